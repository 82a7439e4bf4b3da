use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::collective::{Collective, CollectiveError, WorkerContext};

/// One file of the run and its position in the broadcast list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub index: usize,
    pub path: PathBuf,
}

impl WorkItem {
    pub fn display_name(&self) -> String {
        self.path.display().to_string()
    }
}

/// Expand every pattern and return the sorted, de-duplicated set of files.
///
/// A literal path is a pattern that matches only itself, so explicit file
/// lists and shell-style globs can be mixed.
pub fn discover(patterns: &[String]) -> Result<Vec<PathBuf>, DistributeError> {
    let mut files = Vec::new();
    for pattern in patterns {
        let entries = glob::glob(pattern).map_err(|e| DistributeError::Pattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        let before = files.len();
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => files.push(path),
                Ok(path) => debug!(path = %path.display(), "not a regular file, ignoring"),
                Err(e) => warn!(error = %e, pattern = %pattern, "unreadable path while expanding pattern"),
            }
        }
        debug!(pattern = %pattern, matched = files.len() - before, "pattern expanded");
    }

    files.sort();
    files.dedup();
    if files.is_empty() {
        return Err(DistributeError::NoFiles(patterns.join(" ")));
    }
    Ok(files)
}

/// Resolve the file set on the coordinator and broadcast it to every worker.
///
/// The list travels in two phases: first the file count, then the packed
/// `(length, path bytes)` entries. A count of zero tells the other workers
/// that the coordinator found nothing and the run is over.
pub async fn distribute<C: Collective>(
    collective: &mut C,
    patterns: &[String],
) -> Result<Vec<PathBuf>, DistributeError> {
    let ctx = collective.context();

    if ctx.is_coordinator() {
        let files = match discover(patterns) {
            Ok(files) => files,
            Err(e) => {
                collective.broadcast(encode_count(0)).await?;
                return Err(e);
            }
        };
        let count = u32::try_from(files.len())
            .map_err(|_| DistributeError::TooManyFiles(files.len()))?;
        collective.broadcast(encode_count(count)).await?;
        collective.broadcast(encode_file_list(&files)).await?;
        info!(files = files.len(), workers = ctx.size, "file list broadcast");
        Ok(files)
    } else {
        let count = decode_count(collective.broadcast(Bytes::new()).await?)?;
        if count == 0 {
            return Err(DistributeError::Aborted);
        }
        let files = decode_file_list(collective.broadcast(Bytes::new()).await?, count)?;
        debug!(files = files.len(), rank = ctx.rank, "file list received");
        Ok(files)
    }
}

/// Files at indices `rank, rank + size, rank + 2*size, ...`.
pub fn assigned(ctx: WorkerContext, files: &[PathBuf]) -> Vec<WorkItem> {
    files
        .iter()
        .enumerate()
        .skip(ctx.rank)
        .step_by(ctx.size)
        .map(|(index, path)| WorkItem {
            index,
            path: path.clone(),
        })
        .collect()
}

fn encode_count(count: u32) -> Bytes {
    Bytes::copy_from_slice(&count.to_be_bytes())
}

fn decode_count(payload: Bytes) -> Result<u32, DistributeError> {
    let bytes: [u8; 4] = payload[..]
        .try_into()
        .map_err(|_| DistributeError::Malformed(format!("count of {} bytes", payload.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

fn encode_file_list(files: &[PathBuf]) -> Bytes {
    let mut buf = BytesMut::new();
    for path in files {
        let text = path.to_string_lossy();
        buf.put_u32(text.len() as u32);
        buf.extend_from_slice(text.as_bytes());
    }
    buf.freeze()
}

fn decode_file_list(mut payload: Bytes, count: u32) -> Result<Vec<PathBuf>, DistributeError> {
    let mut files = Vec::with_capacity(count as usize);
    for i in 0..count {
        if payload.remaining() < 4 {
            return Err(DistributeError::Malformed(format!("entry {i} has no length")));
        }
        let len = payload.get_u32() as usize;
        if payload.remaining() < len {
            return Err(DistributeError::Malformed(format!(
                "entry {i} declares {len} bytes, {} left",
                payload.remaining()
            )));
        }
        let raw = payload.split_to(len);
        let text = std::str::from_utf8(&raw)
            .map_err(|_| DistributeError::Malformed(format!("entry {i} is not UTF-8")))?;
        files.push(PathBuf::from(text));
    }
    if payload.has_remaining() {
        return Err(DistributeError::Malformed(format!(
            "{} trailing bytes after {count} entries",
            payload.remaining()
        )));
    }
    Ok(files)
}

#[derive(Debug, thiserror::Error)]
pub enum DistributeError {
    #[error("invalid pattern {pattern}: {reason}")]
    Pattern { pattern: String, reason: String },
    #[error("no files matched {0}")]
    NoFiles(String),
    #[error("coordinator aborted the run")]
    Aborted,
    #[error("too many files to broadcast: {0}")]
    TooManyFiles(usize),
    #[error("malformed file list: {0}")]
    Malformed(String),
    #[error(transparent)]
    Collective(#[from] CollectiveError),
}
