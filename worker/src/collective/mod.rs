pub mod local;
pub mod tcp;

use bytes::Bytes;
use std::future::Future;

pub use local::LocalCollective;
pub use tcp::TcpCollective;

/// Rank of the worker that discovers the file set and owns the final report.
pub const COORDINATOR_RANK: usize = 0;

const RANK_ENV: &str = "SPOTSCAN_RANK";
const WORLD_SIZE_ENV: &str = "SPOTSCAN_WORLD_SIZE";

/// Identity of one worker within a fixed-size run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerContext {
    pub rank: usize,
    pub size: usize,
}

impl WorkerContext {
    pub fn new(rank: usize, size: usize) -> Result<Self, CollectiveError> {
        if size == 0 || rank >= size {
            return Err(CollectiveError::InvalidContext(format!(
                "rank {rank} is outside a world of size {size}"
            )));
        }
        Ok(Self { rank, size })
    }

    pub fn single() -> Self {
        Self { rank: 0, size: 1 }
    }

    /// Read the worker identity set by the launcher. Unset variables mean a
    /// single-worker run.
    pub fn from_env() -> Result<Self, CollectiveError> {
        let rank = env_usize(RANK_ENV)?.unwrap_or(0);
        let size = env_usize(WORLD_SIZE_ENV)?.unwrap_or(1);
        Self::new(rank, size)
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == COORDINATOR_RANK
    }
}

fn env_usize(name: &str) -> Result<Option<usize>, CollectiveError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CollectiveError::InvalidContext(format!("{name}={value} is not a number"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(CollectiveError::InvalidContext(format!("{name}: {e}"))),
    }
}

/// Collective operations across the fixed set of workers of one run.
///
/// Every worker must call the same sequence of operations; each call returns
/// only once the coordinator's side of it has happened.
pub trait Collective {
    fn context(&self) -> WorkerContext;

    /// One-to-all broadcast from the coordinator. The coordinator's `payload`
    /// is returned on every worker; other workers pass an empty payload.
    fn broadcast(
        &mut self,
        payload: Bytes,
    ) -> impl Future<Output = Result<Bytes, CollectiveError>> + Send;

    /// Wait until every worker has reached the barrier.
    fn barrier(&mut self) -> impl Future<Output = Result<(), CollectiveError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum CollectiveError {
    #[error("invalid worker context: {0}")]
    InvalidContext(String),
    #[error("collective I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("collective group closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_validates_rank() {
        assert!(WorkerContext::new(0, 1).is_ok());
        assert!(WorkerContext::new(3, 4).is_ok());
        assert!(WorkerContext::new(4, 4).is_err());
        assert!(WorkerContext::new(0, 0).is_err());
    }

    #[test]
    fn coordinator_is_rank_zero() {
        assert!(WorkerContext::single().is_coordinator());
        assert!(!WorkerContext::new(2, 3).unwrap().is_coordinator());
    }
}
