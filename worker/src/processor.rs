use rayon::ThreadPool;
use spotscan_common::codec::PixelCodec;
use spotscan_common::config::DetectorConfig;
use spotscan_common::frame::{FrameError, RawFrame};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::analysis::{detect, estimate, PixelGrid, Spot, ThresholdStatistic};
use crate::collective::WorkerContext;
use crate::distributor::WorkItem;
use crate::report::ReportWriter;

/// What happened to one assigned file.
#[derive(Debug)]
pub enum FrameOutcome {
    Spots {
        statistic: ThresholdStatistic,
        spots: Vec<Spot>,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Debug)]
pub struct RunResult {
    pub item: WorkItem,
    pub outcome: FrameOutcome,
}

/// Per-worker totals, logged when the worker finishes its share.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: usize,
    pub skipped: usize,
    pub spots: usize,
}

/// Runs the load, decode, threshold, detect pipeline for the files assigned
/// to one worker. Frame analysis runs on a dedicated rayon pool, reached
/// through `spawn_blocking` so the async runtime stays responsive.
#[derive(Clone)]
pub struct FrameProcessor {
    ctx: WorkerContext,
    codec: Arc<dyn PixelCodec>,
    detector: DetectorConfig,
    pool: Arc<ThreadPool>,
}

impl FrameProcessor {
    /// `threads == 0` sizes the pool to the number of cores.
    pub fn new(
        ctx: WorkerContext,
        codec: Arc<dyn PixelCodec>,
        detector: DetectorConfig,
        threads: usize,
    ) -> Result<Self, ProcessError> {
        let rank = ctx.rank;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("spotscan-{rank}-{i}"))
            .build()
            .map_err(|e| ProcessError::Pool(e.to_string()))?;
        debug!(rank, threads = pool.current_num_threads(), codec = codec.name(), "analysis pool ready");
        Ok(Self {
            ctx,
            codec,
            detector,
            pool: Arc::new(pool),
        })
    }

    /// Decode one frame and find its spots. The raw bytes are released as
    /// soon as the pixels are decoded.
    pub fn analyze(&self, raw: RawFrame) -> Result<(ThresholdStatistic, Vec<Spot>), ProcessError> {
        let decoded = raw.decode(self.codec.as_ref())?;
        let (width, height) = decoded
            .header
            .dimensions()
            .unwrap_or((self.detector.width, self.detector.height));
        let grid = PixelGrid::new(&decoded.pixels, width, height).ok_or(
            ProcessError::DimensionMismatch {
                width,
                height,
                elements: decoded.pixels.len(),
            },
        )?;

        Ok(self.pool.install(|| {
            let statistic = estimate(&decoded.pixels);
            let spots = detect(&grid, statistic.threshold);
            (statistic, spots)
        }))
    }

    /// Process one file. Per-file problems become [`FrameOutcome::Skipped`];
    /// only fatal errors are returned as `Err`.
    pub async fn process(&self, item: &WorkItem) -> Result<RunResult, ProcessError> {
        let outcome = match self.load_and_analyze(item).await {
            Ok((statistic, spots)) => FrameOutcome::Spots { statistic, spots },
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(file = %item.path.display(), seq = item.index, error = %e, "skipping frame");
                FrameOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
        };
        Ok(RunResult {
            item: item.clone(),
            outcome,
        })
    }

    async fn load_and_analyze(
        &self,
        item: &WorkItem,
    ) -> Result<(ThresholdStatistic, Vec<Spot>), ProcessError> {
        let bytes = tokio::fs::read(&item.path).await?;
        let processor = self.clone();
        tokio::task::spawn_blocking(move || processor.analyze(RawFrame::new(bytes)))
            .await
            .map_err(|e| ProcessError::Join(e.to_string()))?
    }

    /// Process `items` in order, writing each frame's records before moving on.
    pub async fn run<W: Write>(
        &self,
        items: &[WorkItem],
        report: &mut ReportWriter<W>,
    ) -> Result<RunSummary, ProcessError> {
        let mut summary = RunSummary::default();
        for item in items {
            let result = self.process(item).await?;
            match &result.outcome {
                FrameOutcome::Spots { statistic, spots } => {
                    info!(
                        file = %item.path.display(),
                        seq = item.index,
                        max = statistic.max,
                        threshold = statistic.threshold,
                        spots = spots.len(),
                        "frame analyzed"
                    );
                    debug!(
                        seq = item.index,
                        mean = statistic.mean,
                        stddev = statistic.stddev,
                        "frame statistics"
                    );
                    summary.frames += 1;
                    summary.spots += spots.len();
                }
                FrameOutcome::Skipped { .. } => summary.skipped += 1,
            }
            report.write_result(&result).map_err(ProcessError::Report)?;
        }
        info!(
            rank = self.ctx.rank,
            frames = summary.frames,
            skipped = summary.skipped,
            spots = summary.spots,
            "assigned frames done"
        );
        Ok(summary)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to read frame: {0}")]
    Read(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("frame of {elements} elements does not fill a {width}x{height} grid")]
    DimensionMismatch {
        width: usize,
        height: usize,
        elements: usize,
    },
    #[error("failed to build analysis pool: {0}")]
    Pool(String),
    #[error("analysis task failed: {0}")]
    Join(String),
    #[error("failed to write report: {0}")]
    Report(std::io::Error),
}

impl ProcessError {
    /// Fatal errors abort the worker; the rest skip a single file.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProcessError::Read(_) | ProcessError::DimensionMismatch { .. } => false,
            ProcessError::Frame(e) => e.is_fatal(),
            ProcessError::Pool(_) | ProcessError::Join(_) | ProcessError::Report(_) => true,
        }
    }
}
