use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{broadcast, Barrier};

use super::{Collective, CollectiveError, WorkerContext};

const CHANNEL_CAPACITY: usize = 16;

/// In-process collective group. Each handle plays one worker; handles are
/// moved onto separate tasks or threads.
pub struct LocalCollective {
    ctx: WorkerContext,
    tx: broadcast::Sender<Bytes>,
    /// `None` on the coordinator, which never receives its own broadcasts.
    rx: Option<broadcast::Receiver<Bytes>>,
    barrier: Arc<Barrier>,
}

impl LocalCollective {
    /// Create handles for ranks `0..size`, in rank order.
    pub fn group(size: usize) -> Vec<Self> {
        let size = size.max(1);
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let barrier = Arc::new(Barrier::new(size));
        (0..size)
            .map(|rank| {
                let ctx = WorkerContext { rank, size };
                Self {
                    ctx,
                    rx: (!ctx.is_coordinator()).then(|| tx.subscribe()),
                    tx: tx.clone(),
                    barrier: Arc::clone(&barrier),
                }
            })
            .collect()
    }

    pub fn single() -> Self {
        let mut group = Self::group(1);
        group.remove(0)
    }
}

impl Collective for LocalCollective {
    fn context(&self) -> WorkerContext {
        self.ctx
    }

    async fn broadcast(&mut self, payload: Bytes) -> Result<Bytes, CollectiveError> {
        match self.rx.as_mut() {
            None => {
                if self.ctx.size > 1 {
                    self.tx
                        .send(payload.clone())
                        .map_err(|_| CollectiveError::Closed)?;
                }
                Ok(payload)
            }
            Some(rx) => match rx.recv().await {
                Ok(bytes) => Ok(bytes),
                Err(broadcast::error::RecvError::Closed) => Err(CollectiveError::Closed),
                Err(broadcast::error::RecvError::Lagged(n)) => Err(CollectiveError::Protocol(
                    format!("missed {n} broadcast messages"),
                )),
            },
        }
    }

    async fn barrier(&mut self) -> Result<(), CollectiveError> {
        self.barrier.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_every_rank() {
        let handles: Vec<_> = LocalCollective::group(4)
            .into_iter()
            .map(|mut c| {
                tokio::spawn(async move {
                    let payload = if c.context().is_coordinator() {
                        Bytes::from_static(b"hello")
                    } else {
                        Bytes::new()
                    };
                    let first = c.broadcast(payload).await.unwrap();
                    let second = c.broadcast(Bytes::from(vec![c.context().rank as u8])).await.unwrap();
                    c.barrier().await.unwrap();
                    (first, second)
                })
            })
            .collect();

        for handle in handles {
            let (first, second) = handle.await.unwrap();
            assert_eq!(&first[..], b"hello");
            assert_eq!(&second[..], &[0u8]);
        }
    }

    #[tokio::test]
    async fn single_worker_broadcast_is_identity() {
        let mut c = LocalCollective::single();
        assert_eq!(c.context(), WorkerContext::single());
        let out = c.broadcast(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(&out[..], b"abc");
        c.barrier().await.unwrap();
    }
}
