use crate::broadcaster::{Broadcaster, EventKind};
use crate::cop::{active_adr_dir, completed_adr_dir, find_adr};
use crate::process::{head_lines, run_git, run_shell, CommandOutput};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use tracing::info;
use wag_core::new_id;

const LINT_FAILURE_LINES: usize = 5;
const TEST_FAILURE_LINES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    pub passed: bool,
    pub cop_passed: bool,
    pub cop_output: String,
    pub failures: Vec<String>,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Lint,
    Tests,
}

impl Phase {
    fn step(&self) -> &'static str {
        match self {
            Phase::Lint => "lint",
            Phase::Tests => "tests",
        }
    }

    fn banner(&self) -> &'static str {
        match self {
            Phase::Lint => "=== LINT ===",
            Phase::Tests => "=== TESTS ===",
        }
    }

    fn passed_text(&self) -> &'static str {
        match self {
            Phase::Lint => "Lint passed",
            Phase::Tests => "Tests passed",
        }
    }

    fn unknown_text(&self) -> &'static str {
        match self {
            Phase::Lint => "Unknown lint error",
            Phase::Tests => "Unknown test error",
        }
    }

    fn failure(&self, output: &str) -> String {
        match self {
            Phase::Lint => format!("Lint failed: {}", head_lines(output, LINT_FAILURE_LINES)),
            Phase::Tests => format!("Tests failed: {}", head_lines(output, TEST_FAILURE_LINES)),
        }
    }
}

/// Lint then tests with live progress, followed by review context on success.
pub struct StreamingGate {
    lint_cmd: String,
    test_cmd: String,
}

impl StreamingGate {
    pub fn new(lint_cmd: impl Into<String>, test_cmd: impl Into<String>) -> Self {
        Self {
            lint_cmd: lint_cmd.into(),
            test_cmd: test_cmd.into(),
        }
    }

    pub async fn run(&self, app_root: &Path, pbi: &str, broadcaster: &Broadcaster) -> GateReport {
        let session_id = new_id();
        let mut failures = Vec::new();
        let mut outputs = Vec::new();

        for (phase, command) in [(Phase::Lint, &self.lint_cmd), (Phase::Tests, &self.test_cmd)] {
            broadcaster.publish(
                EventKind::Gate,
                json!({"type": "cop-start", "step": phase.step(), "pbi": pbi, "sessionId": session_id}),
            );
            let (passed, output) = phase_output(phase, run_shell(command, app_root).await);
            outputs.push(format!("{}\n{output}", phase.banner()));
            if !passed {
                failures.push(phase.failure(&output));
            }
            info!(event = "gate_phase", step = phase.step(), pbi, passed);
            broadcaster.publish(
                EventKind::Gate,
                json!({
                    "type": "cop-step",
                    "step": phase.step(),
                    "passed": passed,
                    "output": output,
                    "sessionId": session_id
                }),
            );
        }

        let cop_passed = failures.is_empty();
        let cop_output = outputs.join("\n\n");
        broadcaster.publish(
            EventKind::Gate,
            json!({
                "type": "cop-complete",
                "pbi": pbi,
                "passed": cop_passed,
                "failures": failures,
                "output": cop_output,
                "sessionId": session_id
            }),
        );

        if !cop_passed {
            return GateReport {
                passed: false,
                cop_passed: false,
                cop_output,
                failures,
                session_id,
            };
        }

        let diff = working_diff(app_root).await;
        let adr = read_adr(app_root, pbi);
        broadcaster.publish(
            EventKind::Gate,
            json!({
                "type": "architect-ready",
                "pbi": pbi,
                "diff": diff,
                "adr": adr,
                "sessionId": session_id
            }),
        );

        GateReport {
            passed: true,
            cop_passed: true,
            cop_output,
            failures: Vec::new(),
            session_id,
        }
    }
}

fn phase_output(phase: Phase, output: CommandOutput) -> (bool, String) {
    if output.success {
        let text = if output.stdout.is_empty() {
            phase.passed_text().to_string()
        } else {
            output.stdout
        };
        (true, text)
    } else {
        let text = output.failure_text(phase.unknown_text());
        (false, text)
    }
}

async fn working_diff(app_root: &Path) -> String {
    match run_git(&["diff", "HEAD"], app_root).await {
        Ok(diff) if diff.is_empty() => "(no changes)".to_string(),
        Ok(diff) => diff,
        Err(_) => "(failed to get diff)".to_string(),
    }
}

/// Design record text, looked up in `adr/active` before `adr/completed`.
pub fn read_adr(app_root: &Path, pbi: &str) -> Option<String> {
    [active_adr_dir(app_root), completed_adr_dir(app_root)]
        .iter()
        .find_map(|dir| find_adr(dir, pbi))
        .and_then(|path| std::fs::read_to_string(path).ok())
}
