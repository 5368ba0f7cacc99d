/// Runs the custody scenarios in lifecycle order against one group shape
/// and reports which stage of custody broke first.
///
/// Stages: split → distribute → recover → files
use std::time::Instant;

use serde::Serialize;

use crate::scenario_common::{GroupShape, ScenarioResult};
use crate::{scenario_distribute, scenario_files, scenario_recover, scenario_split};

#[derive(Serialize)]
struct CustodyReport {
    event: &'static str,
    stewards: usize,
    threshold: usize,
    stages: Vec<StageReport>,
    /// First stage that did not pass, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    broken_stage: Option<String>,
    elapsed_s: f64,
}

#[derive(Serialize)]
struct StageReport {
    stage: &'static str,
    steps_passed: usize,
    steps_total: usize,
    elapsed_ms: f64,
    /// `step: detail` of the first failing step, or the scenario error.
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
}

impl StageReport {
    fn from_outcome(stage: &'static str, outcome: &anyhow::Result<ScenarioResult>) -> Self {
        match outcome {
            Ok(result) => Self {
                stage,
                steps_passed: result.passed,
                steps_total: result.steps.len(),
                elapsed_ms: result.total_ms,
                failure: result.steps.iter().find(|s| !s.ok).map(|s| match &s.detail {
                    Some(detail) => format!("{}: {detail}", s.step),
                    None => s.step.clone(),
                }),
            },
            Err(e) => Self {
                stage,
                steps_passed: 0,
                steps_total: 0,
                elapsed_ms: 0.0,
                failure: Some(format!("scenario error: {e}")),
            },
        }
    }

    fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Returns true when every stage passed.
pub async fn run(shape: GroupShape, secret: &[u8]) -> bool {
    let started = Instant::now();
    eprintln!(
        "custody lifecycle: {} of {} stewards, {}-byte secret",
        shape.threshold,
        shape.stewards,
        secret.len()
    );

    let outcomes: [(&'static str, anyhow::Result<ScenarioResult>); 4] = [
        ("split", scenario_split::run(shape, secret)),
        ("distribute", scenario_distribute::run(shape).await),
        ("recover", scenario_recover::run(shape).await),
        ("files", scenario_files::run(shape).await),
    ];

    let mut stages = Vec::with_capacity(outcomes.len());
    for (stage, outcome) in &outcomes {
        if let Ok(result) = outcome {
            result.print_summary();
            result.emit_jsonl();
        }
        stages.push(StageReport::from_outcome(*stage, outcome));
    }

    let report = CustodyReport {
        event: "custody_lifecycle",
        stewards: shape.stewards,
        threshold: shape.threshold,
        broken_stage: stages
            .iter()
            .find(|s| !s.passed())
            .map(|s| s.stage.to_string()),
        stages,
        elapsed_s: started.elapsed().as_secs_f64(),
    };
    if let Ok(json) = serde_json::to_string(&report) {
        println!("{json}");
    }

    eprintln!("\ncustody lifecycle report");
    for stage in &report.stages {
        let mark = if stage.passed() { "ok  " } else { "FAIL" };
        eprintln!(
            "  {mark} {:<10} {}/{} steps  {:>8.1}ms",
            stage.stage, stage.steps_passed, stage.steps_total, stage.elapsed_ms
        );
        if let Some(failure) = &stage.failure {
            eprintln!("       {failure}");
        }
    }
    match &report.broken_stage {
        None => eprintln!(
            "key survives the full cycle with {} of {} stewards ({:.1}s)",
            shape.threshold, shape.stewards, report.elapsed_s
        ),
        Some(stage) => eprintln!("custody broke at stage '{stage}'"),
    }

    report.broken_stage.is_none()
}
