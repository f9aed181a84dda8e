//! The fixed refinement protocol: IAM warm-up, extinction handling and the
//! optional aspherical pass, run once per job against the engine.

use anyhow::{anyhow, Result};
use std::fmt;
use std::path::Path;
use std::time::Instant;

use crate::config::{JobConfiguration, ParamKey, ParamValue};
use crate::engine::RefinementEngine;
use crate::workspace::JobLog;

/// Extinction coefficients below this are dropped from the model.
pub const EXTINCTION_THRESHOLD: f64 = 0.001;

const ADVANCED_SOURCE: &str = "ORCA 6.0";
const GAUSS_NEWTON: &str = "spy.set_refinement_program(olex2.refine, Gauss-Newton)";
const LEVENBERG_MARQUARDT: &str = "spy.set_refinement_program(olex2.refine, Levenberg-Marquardt)";

fn advanced_param(name: &str) -> String {
    format!("snum.NoSpherA2.{}", name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Prepare,
    Weighting,
    EngineSelection,
    IamWarmup,
    Extinction,
    IamRefine,
    Advanced,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::Prepare => "prepare",
            Stage::Weighting => "weighting",
            Stage::EngineSelection => "engine-selection",
            Stage::IamWarmup => "iam-warmup",
            Stage::Extinction => "extinction",
            Stage::IamRefine => "iam-refine",
            Stage::Advanced => "advanced",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RefinementTiming {
    pub elapsed_secs: f64,
    pub cycles: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefinementOutcome {
    Completed(RefinementTiming),
    Failed { stage: Stage, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Extinction {
    Absent,
    Present(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtinctionAction {
    DeleteInstruction,
    SwitchToLevenbergMarquardt,
    Keep,
}

/// Parses the engine's extinction report: `n/a`, or a value with an
/// optional parenthesised esd such as `0.0021(4)`.
pub fn parse_extinction(raw: &str) -> Result<Extinction> {
    let raw = raw.trim();
    if raw == "n/a" {
        return Ok(Extinction::Absent);
    }
    let value = raw.split('(').next().unwrap_or(raw).trim();
    value
        .parse::<f64>()
        .map(Extinction::Present)
        .map_err(|_| anyhow!("unparsable extinction value: {}", raw))
}

pub fn extinction_action(ext: Extinction) -> ExtinctionAction {
    match ext {
        Extinction::Absent => ExtinctionAction::Keep,
        Extinction::Present(v) if v < EXTINCTION_THRESHOLD => ExtinctionAction::DeleteInstruction,
        Extinction::Present(_) => ExtinctionAction::SwitchToLevenbergMarquardt,
    }
}

pub struct RefinementPlan<'a> {
    pub job_id: usize,
    pub model_file: &'a Path,
    pub update_weight: bool,
    /// Parameters for the aspherical pass; `None` runs IAM only.
    pub advanced: Option<&'a JobConfiguration>,
}

struct StageFailure {
    stage: Stage,
    error: anyhow::Error,
}

fn at(stage: Stage) -> impl FnOnce(anyhow::Error) -> StageFailure {
    move |error| StageFailure { stage, error }
}

/// Runs every stage in order. The first failing stage ends the pass; the
/// failure is logged and returned, never raised.
pub fn refine(
    engine: &mut dyn RefinementEngine,
    log: &JobLog,
    plan: &RefinementPlan<'_>,
) -> RefinementOutcome {
    match run_stages(engine, log, plan) {
        Ok(timing) => RefinementOutcome::Completed(timing),
        Err(failure) => {
            let reason = format!("{:#}", failure.error);
            log.line(&reason);
            log.line("Failed during refinement!");
            tracing::warn!(
                job_id = plan.job_id,
                stage = %failure.stage,
                error = %reason,
                "refinement stage failed"
            );
            RefinementOutcome::Failed {
                stage: failure.stage,
                reason,
            }
        }
    }
}

fn run_stages(
    engine: &mut dyn RefinementEngine,
    log: &JobLog,
    plan: &RefinementPlan<'_>,
) -> Result<RefinementTiming, StageFailure> {
    engine.load_model(plan.model_file).map_err(at(Stage::Load))?;
    log.header("Starting New Refinement");
    log.line(&format!("ID: {}", plan.job_id));
    log.line(&format!("Was able to load .ins: {}", plan.model_file.display()));

    prepare(engine).map_err(at(Stage::Prepare))?;

    engine
        .set_param("snum.refinement.update_weight", &ParamValue::Bool(plan.update_weight))
        .map_err(at(Stage::Weighting))?;
    if plan.update_weight {
        log.line("Refining the weighting scheme");
    } else {
        log.line("keeping weighting scheme");
    }

    engine.run_command(GAUSS_NEWTON).map_err(at(Stage::EngineSelection))?;
    log.line("Set refinement engine olex2.refine with G-N");

    iam_warmup(engine).map_err(at(Stage::IamWarmup))?;
    extinction_branch(engine, log).map_err(at(Stage::Extinction))?;
    engine.run_command("refine 10").map_err(at(Stage::IamRefine))?;

    match plan.advanced {
        Some(params) => advanced_pass(engine, log, params).map_err(at(Stage::Advanced)),
        None => Ok(RefinementTiming::default()),
    }
}

fn prepare(engine: &mut dyn RefinementEngine) -> Result<()> {
    engine.add_instruction("EXTI")?;
    engine.add_instruction("ACTA")?;
    engine.run_command("fix disp -c")
}

fn iam_warmup(engine: &mut dyn RefinementEngine) -> Result<()> {
    engine.set_param(&advanced_param("use_aspherical"), &ParamValue::Bool(false))?;
    for _ in 0..3 {
        engine.run_command("refine 5")?;
    }
    Ok(())
}

fn extinction_branch(engine: &mut dyn RefinementEngine, log: &JobLog) -> Result<()> {
    let raw = engine.extinction()?;
    log.line(&format!("Found Extinction: {}", raw));
    match extinction_action(parse_extinction(&raw)?) {
        ExtinctionAction::DeleteInstruction => {
            engine.run_command("delins EXTI")?;
            log.line(&format!("Deleted EXTI with exti of: {}", raw));
        }
        ExtinctionAction::SwitchToLevenbergMarquardt => {
            log.line("Exti > 0.001, set L-M instead of G-N");
            engine.run_command(LEVENBERG_MARQUARDT)?;
        }
        ExtinctionAction::Keep => {}
    }
    Ok(())
}

fn configure_advanced(
    engine: &mut dyn RefinementEngine,
    log: &JobLog,
    params: &JobConfiguration,
) -> Result<()> {
    engine.set_param(&advanced_param("source"), &ParamValue::from(ADVANCED_SOURCE))?;
    for (key, value) in params.iter() {
        let name = advanced_param(key.as_str());
        engine.set_param(&name, value)?;
        log.line(&format!("{}: {}", key, engine.get_param(&name)?));
    }
    for flag in ["Calculate", "precise_output", "use_aspherical", "h_aniso"] {
        engine.set_param(&advanced_param(flag), &ParamValue::Bool(true))?;
    }
    let multiplicity_name = advanced_param(ParamKey::Multiplicity.as_str());
    let multiplicity = engine.get_param(&multiplicity_name)?;
    if matches!(multiplicity.trim(), "" | "0") {
        log.line("No multiplicity selected, falling back to 1");
        engine.set_param(&multiplicity_name, &ParamValue::from("1"))?;
    }
    Ok(())
}

fn advanced_pass(
    engine: &mut dyn RefinementEngine,
    log: &JobLog,
    params: &JobConfiguration,
) -> Result<RefinementTiming> {
    configure_advanced(engine, log, params)?;
    log.line("Starting iterative NoSpherA2 refinement");
    let start = Instant::now();
    engine.run_command("refine 20")?;
    let elapsed_secs = start.elapsed().as_secs_f64();
    let cycles = engine.run_cycle_count()?;
    log.line(&format!("Refinement took {} seconds", elapsed_secs));
    log.line(&format!("Refinement took {} cycles", cycles));
    Ok(RefinementTiming {
        elapsed_secs,
        cycles,
    })
}
