use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Collective, CollectiveError, WorkerContext};

/// Wire format of one collective message:
///
///   [0]      tag          (u8, see `Tag`)
///   [1..5]   payload_len  (u32 big-endian)
///   [5..]    payload
const MESSAGE_HEADER_SIZE: usize = 5;
const MAX_PAYLOAD_LEN: usize = 256 * 1024 * 1024;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    /// Worker to coordinator on connect; payload is the worker's rank (u32 BE).
    Hello = 0,
    Broadcast = 1,
    Arrive = 2,
    Release = 3,
}

impl TryFrom<u8> for Tag {
    type Error = CollectiveError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Tag::Hello),
            1 => Ok(Tag::Broadcast),
            2 => Ok(Tag::Arrive),
            3 => Ok(Tag::Release),
            other => Err(CollectiveError::Protocol(format!("unknown message tag {other}"))),
        }
    }
}

enum Role {
    /// Streams to ranks 1..size, indexed by `rank - 1`.
    Coordinator { peers: Vec<TcpStream> },
    Worker { stream: TcpStream },
}

/// Star-topology collective over TCP: the coordinator accepts one connection
/// per worker and relays every operation.
pub struct TcpCollective {
    ctx: WorkerContext,
    role: Role,
}

impl TcpCollective {
    /// Bind or connect depending on the rank in `ctx`.
    pub async fn establish(
        ctx: WorkerContext,
        coordinator: &str,
        timeout: Duration,
    ) -> Result<Self, CollectiveError> {
        if ctx.is_coordinator() {
            let listener = TcpListener::bind(coordinator).await?;
            info!(addr = coordinator, size = ctx.size, "coordinator listening");
            Self::coordinate(listener, ctx, timeout).await
        } else {
            Self::join(coordinator, ctx, timeout).await
        }
    }

    /// Accept `size - 1` workers on `listener` and order them by rank.
    pub async fn coordinate(
        listener: TcpListener,
        ctx: WorkerContext,
        timeout: Duration,
    ) -> Result<Self, CollectiveError> {
        let mut slots: Vec<Option<TcpStream>> = (1..ctx.size).map(|_| None).collect();
        let deadline = Instant::now() + timeout;

        for _ in 1..ctx.size {
            let (mut stream, peer_addr) =
                tokio::time::timeout_at(deadline, listener.accept())
                    .await
                    .map_err(|_| CollectiveError::Timeout("workers to connect"))??;
            stream.set_nodelay(true)?;

            let hello = expect_message(&mut stream, Tag::Hello);
            let payload = tokio::time::timeout_at(deadline, hello)
                .await
                .map_err(|_| CollectiveError::Timeout("worker hello"))??;
            let rank = decode_rank(&payload)?;
            if rank == 0 || rank >= ctx.size {
                return Err(CollectiveError::Protocol(format!(
                    "worker at {peer_addr} announced rank {rank} in a world of size {}",
                    ctx.size
                )));
            }
            let slot = &mut slots[rank - 1];
            if slot.is_some() {
                return Err(CollectiveError::Protocol(format!(
                    "rank {rank} connected twice"
                )));
            }
            debug!(rank, peer = %peer_addr, "worker joined");
            *slot = Some(stream);
        }

        let peers = slots.into_iter().flatten().collect();
        info!(size = ctx.size, "all workers connected");
        Ok(Self {
            ctx,
            role: Role::Coordinator { peers },
        })
    }

    /// Connect to the coordinator, retrying with exponential backoff until `timeout`.
    pub async fn join(
        coordinator: &str,
        ctx: WorkerContext,
        timeout: Duration,
    ) -> Result<Self, CollectiveError> {
        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;

        let mut stream = loop {
            match TcpStream::connect(coordinator).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if Instant::now() + backoff > deadline {
                        warn!(error = %e, addr = coordinator, "giving up on coordinator");
                        return Err(CollectiveError::Timeout("coordinator to accept"));
                    }
                    debug!(error = %e, rank = ctx.rank, "coordinator not ready, retrying in {:?}", backoff);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        };
        stream.set_nodelay(true)?;

        write_message(&mut stream, Tag::Hello, &(ctx.rank as u32).to_be_bytes()).await?;
        info!(rank = ctx.rank, addr = coordinator, "joined coordinator");
        Ok(Self {
            ctx,
            role: Role::Worker { stream },
        })
    }
}

impl Collective for TcpCollective {
    fn context(&self) -> WorkerContext {
        self.ctx
    }

    async fn broadcast(&mut self, payload: Bytes) -> Result<Bytes, CollectiveError> {
        match &mut self.role {
            Role::Coordinator { peers } => {
                for peer in peers.iter_mut() {
                    write_message(peer, Tag::Broadcast, &payload).await?;
                }
                Ok(payload)
            }
            Role::Worker { stream } => expect_message(stream, Tag::Broadcast).await,
        }
    }

    async fn barrier(&mut self) -> Result<(), CollectiveError> {
        match &mut self.role {
            Role::Coordinator { peers } => {
                for peer in peers.iter_mut() {
                    expect_message(peer, Tag::Arrive).await?;
                }
                for peer in peers.iter_mut() {
                    write_message(peer, Tag::Release, &[]).await?;
                }
                Ok(())
            }
            Role::Worker { stream } => {
                write_message(stream, Tag::Arrive, &[]).await?;
                expect_message(stream, Tag::Release).await?;
                Ok(())
            }
        }
    }
}

fn decode_rank(payload: &[u8]) -> Result<usize, CollectiveError> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| CollectiveError::Protocol(format!("hello payload of {} bytes", payload.len())))?;
    Ok(u32::from_be_bytes(bytes) as usize)
}

async fn write_message<W>(writer: &mut W, tag: Tag, payload: &[u8]) -> Result<(), CollectiveError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&n| n as usize <= MAX_PAYLOAD_LEN)
        .ok_or_else(|| CollectiveError::Protocol(format!("payload of {} bytes", payload.len())))?;

    let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    buf.put_u8(tag as u8);
    buf.put_u32(len);
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_message<R>(reader: &mut R) -> Result<(Tag, Bytes), CollectiveError>
where
    R: AsyncRead + Unpin,
{
    let tag = match reader.read_u8().await {
        Ok(tag) => Tag::try_from(tag)?,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CollectiveError::Closed)
        }
        Err(e) => return Err(e.into()),
    };
    let len = reader.read_u32().await? as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(CollectiveError::Protocol(format!("payload of {len} bytes")));
    }
    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;
    Ok((tag, payload.freeze()))
}

async fn expect_message<R>(reader: &mut R, expected: Tag) -> Result<Bytes, CollectiveError>
where
    R: AsyncRead + Unpin,
{
    let (tag, payload) = read_message(reader).await?;
    if tag != expected {
        return Err(CollectiveError::Protocol(format!(
            "expected {expected:?}, got {tag:?}"
        )));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn message_framing_round_trips_through_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_message(&mut a, Tag::Broadcast, b"payload").await.unwrap();
        let (tag, payload) = read_message(&mut b).await.unwrap();
        assert_eq!(tag, Tag::Broadcast);
        assert_eq!(&payload[..], b"payload");
    }

    #[tokio::test]
    async fn unknown_tag_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[9, 0, 0, 0, 0]).await.unwrap();
        assert!(matches!(
            read_message(&mut b).await,
            Err(CollectiveError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn closed_stream_reported() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(read_message(&mut b).await, Err(CollectiveError::Closed)));
    }

    #[tokio::test]
    async fn three_workers_broadcast_and_barrier() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let coordinator = async {
            let ctx = WorkerContext::new(0, 3).unwrap();
            let mut c = TcpCollective::coordinate(listener, ctx, TIMEOUT).await.unwrap();
            let out = c.broadcast(Bytes::from_static(b"files")).await.unwrap();
            c.barrier().await.unwrap();
            out
        };
        let worker = |rank: usize| {
            let addr = addr.clone();
            async move {
                let ctx = WorkerContext::new(rank, 3).unwrap();
                let mut c = TcpCollective::join(&addr, ctx, TIMEOUT).await.unwrap();
                let out = c.broadcast(Bytes::new()).await.unwrap();
                c.barrier().await.unwrap();
                out
            }
        };

        let (root, one, two) = tokio::join!(coordinator, worker(1), worker(2));
        assert_eq!(&root[..], b"files");
        assert_eq!(&one[..], b"files");
        assert_eq!(&two[..], b"files");
    }

    #[tokio::test]
    async fn silent_peer_does_not_hang_coordinator() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = WorkerContext::new(0, 2).unwrap();

        let coordinator = TcpCollective::coordinate(listener, ctx, Duration::from_millis(300));
        let silent = async {
            let stream = TcpStream::connect(addr).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        };
        let result = tokio::select! {
            result = coordinator => result,
            _ = silent => panic!("coordinator still waiting after the peer went away"),
        };
        assert!(matches!(result, Err(CollectiveError::Timeout("worker hello"))));
    }

    #[tokio::test]
    async fn join_times_out_without_coordinator() {
        // Bind then drop so the port is very likely closed.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let ctx = WorkerContext::new(1, 2).unwrap();
        let result = TcpCollective::join(&addr, ctx, Duration::from_millis(300)).await;
        assert!(matches!(result, Err(CollectiveError::Timeout(_))));
    }
}
