use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub mod benchmark;
pub mod bridge;
pub mod cif;
pub mod config;
pub mod engine;
pub mod extract;
pub mod job;
pub mod propagation;
pub mod refine;
pub mod results;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use benchmark::{BenchmarkFile, BenchmarkSource};
pub use bridge::{BridgeEngine, BridgeLibrary, BridgeSession};
pub use config::{ConfigError, JobConfiguration, ParamKey, ParamValue, Settings};
pub use engine::{CrystalLibrary, RefinementEngine};
pub use job::{BenchJob, JobContext, JobRun};
pub use propagation::{DistanceCalculator, MetricDistanceCalculator};
pub use workspace::SetupError;

/// Which benchmark entries a batch covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSelection {
    All,
    Single(usize),
}

impl JobSelection {
    /// Absent or negative index (the `-1` convention) selects every job.
    pub fn from_index(index: Option<i64>) -> JobSelection {
        match index {
            Some(i) if i >= 0 => JobSelection::Single(i as usize),
            _ => JobSelection::All,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobDisposition {
    /// A done marker already existed; the job was not constructed.
    Skipped,
    SetupFailed { reason: String },
    Done,
    NotDone,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub id: usize,
    pub advanced: bool,
    #[serde(flatten)]
    pub disposition: JobDisposition,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub work_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobReport>,
}

impl BatchReport {
    pub fn count(&self, pred: impl Fn(&JobDisposition) -> bool) -> usize {
        self.jobs.iter().filter(|j| pred(&j.disposition)).count()
    }
}

fn run_one(
    work_path: &Path,
    id: usize,
    source: &dyn BenchmarkSource,
    ctx: &mut JobContext<'_>,
) -> Result<JobReport> {
    let entry = source.get(id).ok_or(ConfigError::IndexOutOfRange {
        index: id,
        len: source.len(),
    })?;
    let params = ctx.settings.job_parameters(entry);
    let advanced = params.is_some();
    if source.is_finished(id) {
        info!(job_id = id, "done marker present, skipping");
        return Ok(JobReport {
            id,
            advanced,
            disposition: JobDisposition::Skipped,
        });
    }

    info!(job_id = id, advanced, "Running job {}", id);
    let job = match BenchJob::new(work_path, id, params) {
        Ok(job) => job,
        Err(e) => {
            warn!(job_id = id, error = %e, "job setup failed");
            return Ok(JobReport {
                id,
                advanced,
                disposition: JobDisposition::SetupFailed {
                    reason: e.to_string(),
                },
            });
        }
    };
    debug!(job_id = id, "{}", job);
    let run = job.run(ctx);
    Ok(JobReport {
        id,
        advanced,
        disposition: if run.done {
            JobDisposition::Done
        } else {
            JobDisposition::NotDone
        },
    })
}

/// Runs the selected benchmark entries one after another in source order.
/// Entries whose done marker exists are skipped before construction. Job
/// failures only show up in the report and the job's own files.
pub fn run_batch(
    work_path: &Path,
    source: &dyn BenchmarkSource,
    selection: JobSelection,
    ctx: &mut JobContext<'_>,
) -> Result<BatchReport> {
    let started_at = Utc::now();
    let ids: Vec<usize> = match selection {
        JobSelection::All => (0..source.len()).collect(),
        JobSelection::Single(id) => vec![id],
    };
    info!(work_path = %work_path.display(), jobs = ids.len(), "starting benchmark batch");

    let mut jobs = Vec::with_capacity(ids.len());
    for id in ids {
        jobs.push(run_one(work_path, id, source, ctx)?);
    }

    let report = BatchReport {
        work_path: work_path.to_path_buf(),
        started_at,
        finished_at: Utc::now(),
        jobs,
    };
    info!(
        done = report.count(|d| *d == JobDisposition::Done),
        skipped = report.count(|d| *d == JobDisposition::Skipped),
        "benchmark batch finished"
    );
    Ok(report)
}
