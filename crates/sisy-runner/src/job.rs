use anyhow::{Context, Result};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

use crate::cif::{parse_report, ReportStats};
use crate::config::{JobConfiguration, Settings};
use crate::engine::{CrystalLibrary, RefinementEngine};
use crate::extract::{self, Outcome};
use crate::propagation::{DistanceCalculator, Propagation};
use crate::refine::{refine, RefinementOutcome, RefinementPlan, RefinementTiming};
use crate::results::{self, ResultsRecord};
use crate::workspace::{JobLog, JobWorkspace, SetupError};

/// Collaborators every job runs against, passed in by the orchestrator.
pub struct JobContext<'a> {
    pub engine: &'a mut dyn RefinementEngine,
    pub library: &'a mut dyn CrystalLibrary,
    pub calculator: &'a dyn DistanceCalculator,
    pub settings: &'a Settings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRun {
    pub refinement: RefinementOutcome,
    /// Set when extraction returned without error and the done marker exists.
    pub done: bool,
}

/// One benchmark job bound to its private workspace.
pub struct BenchJob {
    id: usize,
    workspace: JobWorkspace,
    log: JobLog,
    advanced: Option<JobConfiguration>,
}

impl BenchJob {
    /// Stages the workspace. `advanced` carries the merged parameters for an
    /// aspherical job; `None` builds a plain IAM job.
    pub fn new(
        base_work_path: &Path,
        id: usize,
        advanced: Option<JobConfiguration>,
    ) -> Result<Self, SetupError> {
        let workspace = JobWorkspace::setup(base_work_path, id)?;
        let log = JobLog::new(workspace.log_path(), id);
        Ok(Self {
            id,
            workspace,
            log,
            advanced,
        })
    }

    pub fn workspace(&self) -> &JobWorkspace {
        &self.workspace
    }

    pub fn is_advanced(&self) -> bool {
        self.advanced.is_some()
    }

    pub fn run(&self, ctx: &mut JobContext<'_>) -> JobRun {
        let plan = RefinementPlan {
            job_id: self.id,
            model_file: self.workspace.model_file(),
            update_weight: ctx.settings.update_weight,
            advanced: self.advanced.as_ref(),
        };
        let refinement = refine(&mut *ctx.engine, &self.log, &plan);
        self.log.header("Finished Refinement");

        let timing = match &refinement {
            RefinementOutcome::Completed(timing) => *timing,
            RefinementOutcome::Failed { .. } => RefinementTiming::default(),
        };
        let done = match self.extract_info(ctx, timing) {
            Ok(()) => {
                self.log.header("Extracted Information");
                match self.workspace.mark_done() {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(job_id = self.id, error = %e, "could not write done marker");
                        false
                    }
                }
            }
            Err(e) => {
                self.log.line(&format!("{:#}", e));
                self.log.line("Failed to extract information!");
                warn!(job_id = self.id, error = %e, "extraction failed");
                false
            }
        };
        info!(job_id = self.id, done, "job finished");
        JobRun { refinement, done }
    }

    fn note_failure<T: Default>(&self, category: &str, outcome: Outcome<T>) -> T {
        if let Some(reason) = outcome.failure() {
            self.log.line(&format!("Failed to extract {}: {}", category, reason));
            warn!(job_id = self.id, category, error = reason, "extraction category failed");
        }
        outcome.into_value()
    }

    fn report_stats(&self) -> ReportStats {
        let parsed = self
            .workspace
            .find_report()
            .and_then(|path| parse_report(&path));
        match parsed {
            Ok(outcome) => ReportStats {
                fields: self.note_failure("CIF stats", outcome.fields),
                displacements: self.note_failure("CIF atom displacements", outcome.displacements),
            },
            Err(e) => {
                self.log.line(&format!("Failed to extract CIF stats: {:#}", e));
                ReportStats::default()
            }
        }
    }

    /// Collects every statistic and appends one block to `results.txt`.
    /// Category failures are logged and leave their entries empty; an error
    /// here means the job is not done.
    pub fn extract_info(&self, ctx: &mut JobContext<'_>, timing: RefinementTiming) -> Result<()> {
        let cell_stats = self.note_failure("cell stats", extract::cell_stats(&mut *ctx.engine));
        let reflection_stats =
            self.note_failure("reflection stats", extract::reflection_stats(&mut *ctx.engine));
        let report = self.report_stats();

        let table = if self.is_advanced() {
            ctx.settings.scattering_table.as_deref()
        } else {
            None
        };
        let propagation = Propagation::run(&mut *ctx.library, ctx.calculator, table);
        if let Propagation::Zeroed { reason } = &propagation {
            self.log.line("Failed to extract distances");
            self.log.line(reason);
            warn!(job_id = self.id, error = %reason, "propagation zeroed");
        }
        let propagated = propagation.into_stats();

        let residuals = extract::residuals(&mut *ctx.engine).context("reading residuals")?;
        let npd_count = ctx.engine.npd_count().context("reading NPD count")?;

        let record = ResultsRecord {
            advanced: self.advanced.as_ref(),
            reflection_stats: &reflection_stats,
            cell_stats: &cell_stats,
            report: &report,
            residuals: &residuals,
            propagated: &propagated,
            cycles: timing.cycles,
            elapsed_secs: timing.elapsed_secs,
            update_weight: ctx.settings.update_weight,
            npd_count,
        };
        results::append(&self.workspace.results_path(), &record)
    }
}

impl fmt::Display for BenchJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Job with following options:")?;
        match &self.advanced {
            None => writeln!(f, "IAM Job"),
            Some(params) => {
                for (key, value) in params.iter() {
                    write!(f, "{}:{}|", key, value)?;
                }
                Ok(())
            }
        }
    }
}
