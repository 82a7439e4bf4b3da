use serde::Serialize;
use spotscan_common::config::OutputFormat;
use std::io::{self, Write};
use std::time::Duration;

use crate::processor::{FrameOutcome, RunResult};

#[derive(Serialize)]
struct SpotRecord<'a> {
    file: &'a str,
    seq: usize,
    x: usize,
    y: usize,
    intensity: i32,
}

#[derive(Serialize)]
struct FrameRecord<'a> {
    file: &'a str,
    seq: usize,
    max: i32,
    mean: f64,
    stddev: f64,
    threshold: i32,
    spots: usize,
}

#[derive(Serialize)]
struct FrameLine<'a> {
    frame: FrameRecord<'a>,
}

#[derive(Serialize)]
struct SummaryRecord {
    workers: usize,
    elapsed_secs: f64,
    finished_at: String,
}

#[derive(Serialize)]
struct SummaryLine {
    summary: SummaryRecord,
}

/// Line-oriented result stream: one record per detected spot.
///
/// Text lines are `<file> <seq> <x> <y> <intensity>`; JSON mode writes one
/// object per line with the same fields, followed by a `{"frame": ...}`
/// record carrying the frame's statistics.
pub struct ReportWriter<W: Write> {
    out: W,
    format: OutputFormat,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self { out, format }
    }

    /// Write the records of one frame and flush. Skipped frames produce no
    /// records; their diagnostics go to the log. Returns the spot count.
    pub fn write_result(&mut self, result: &RunResult) -> io::Result<usize> {
        let FrameOutcome::Spots { statistic, spots } = &result.outcome else {
            return Ok(0);
        };
        let file = result.item.display_name();
        for spot in spots {
            match self.format {
                OutputFormat::Text => writeln!(
                    self.out,
                    "{file} {} {} {} {}",
                    result.item.index, spot.x, spot.y, spot.intensity
                )?,
                OutputFormat::Json => {
                    let record = SpotRecord {
                        file: &file,
                        seq: result.item.index,
                        x: spot.x,
                        y: spot.y,
                        intensity: spot.intensity,
                    };
                    serde_json::to_writer(&mut self.out, &record)?;
                    self.out.write_all(b"\n")?;
                }
            }
        }
        if self.format == OutputFormat::Json {
            let line = FrameLine {
                frame: FrameRecord {
                    file: &file,
                    seq: result.item.index,
                    max: statistic.max,
                    mean: statistic.mean,
                    stddev: statistic.stddev,
                    threshold: statistic.threshold,
                    spots: spots.len(),
                },
            };
            serde_json::to_writer(&mut self.out, &line)?;
            self.out.write_all(b"\n")?;
        }
        self.out.flush()?;
        Ok(spots.len())
    }

    /// Closing line written by the coordinator once every worker is done.
    pub fn write_summary(&mut self, workers: usize, elapsed: Duration) -> io::Result<()> {
        match self.format {
            OutputFormat::Text => writeln!(
                self.out,
                "Total execution time: {:.6} seconds",
                elapsed.as_secs_f64()
            )?,
            OutputFormat::Json => {
                let line = SummaryLine {
                    summary: SummaryRecord {
                        workers,
                        elapsed_secs: elapsed.as_secs_f64(),
                        finished_at: chrono::Utc::now().to_rfc3339(),
                    },
                };
                serde_json::to_writer(&mut self.out, &line)?;
                self.out.write_all(b"\n")?;
            }
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
