//! Checklist gate: runs every check against a work item, records the
//! outcome, and decides whether a clear may proceed.

use crate::process::{head_lines, run_git, run_shell};
use crate::{lock_store, SharedStore};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::info;
use wag_core::{new_id, now_millis, CompletionSession};
use wag_storage::{StorageError, WagStore};

const FAILURE_LINES: usize = 5;
const DIRTY_ENTRIES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub reason: Option<String>,
}

impl CheckOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// A check scoped to one work item.
pub trait WorkItemCheck: Send + Sync {
    fn run<'a>(&'a self, app_root: &'a Path, pbi: &'a str) -> BoxFuture<'a, CheckOutcome>;
}

/// A check over the whole project tree.
pub trait ProjectCheck: Send + Sync {
    fn run<'a>(&'a self, app_root: &'a Path) -> BoxFuture<'a, CheckOutcome>;
}

pub fn wag_dir(app_root: &Path) -> PathBuf {
    app_root.join(".wag")
}

pub fn completed_adr_dir(app_root: &Path) -> PathBuf {
    wag_dir(app_root).join("adr").join("completed")
}

pub fn active_adr_dir(app_root: &Path) -> PathBuf {
    wag_dir(app_root).join("adr").join("active")
}

pub fn completed_pbi_path(app_root: &Path, pbi: &str) -> PathBuf {
    wag_dir(app_root)
        .join("backlog")
        .join("_completed")
        .join(format!("{pbi}.md"))
}

/// First `<pbi>*.md` entry of `dir`, by name.
pub fn find_adr(dir: &Path, pbi: &str) -> Option<PathBuf> {
    let mut matches: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(pbi) && name.ends_with(".md")
        })
        .map(|entry| entry.path())
        .collect();
    matches.sort();
    matches.into_iter().next()
}

/// The design record was archived under `adr/completed`.
pub struct AdrArchived;

impl WorkItemCheck for AdrArchived {
    fn run<'a>(&'a self, app_root: &'a Path, pbi: &'a str) -> BoxFuture<'a, CheckOutcome> {
        async move {
            let dir = completed_adr_dir(app_root);
            if !dir.is_dir() {
                return CheckOutcome::fail(format!(
                    "ADR completed directory not found: {}",
                    dir.display()
                ));
            }
            match find_adr(&dir, pbi) {
                Some(_) => CheckOutcome::pass(),
                None => CheckOutcome::fail(format!("ADR not found in adr/completed/{pbi}*.md")),
            }
        }
        .boxed()
    }
}

/// The work-item file was moved to `backlog/_completed`.
pub struct PbiArchived;

impl WorkItemCheck for PbiArchived {
    fn run<'a>(&'a self, app_root: &'a Path, pbi: &'a str) -> BoxFuture<'a, CheckOutcome> {
        async move {
            if completed_pbi_path(app_root, pbi).is_file() {
                CheckOutcome::pass()
            } else {
                CheckOutcome::fail(format!("PBI not found in backlog/_completed/{pbi}.md"))
            }
        }
        .boxed()
    }
}

pub struct CriteriaComplete;

impl WorkItemCheck for CriteriaComplete {
    fn run<'a>(&'a self, app_root: &'a Path, pbi: &'a str) -> BoxFuture<'a, CheckOutcome> {
        async move {
            match fs::read_to_string(completed_pbi_path(app_root, pbi)) {
                Ok(content) => criteria_outcome(&content),
                Err(_) => CheckOutcome::fail("Cannot check criteria - PBI file not found"),
            }
        }
        .boxed()
    }
}

fn unchecked_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"- \[ \]").expect("valid regex"))
}

fn checked_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)- \[x\]").expect("valid regex"))
}

pub fn criteria_outcome(content: &str) -> CheckOutcome {
    let unchecked = unchecked_pattern().find_iter(content).count();
    let checked = checked_pattern().find_iter(content).count();
    if unchecked > 0 {
        return CheckOutcome::fail(format!(
            "Acceptance criteria not complete: {unchecked} of {} unchecked",
            unchecked + checked
        ));
    }
    if checked == 0 {
        return CheckOutcome::fail("No acceptance criteria found in PBI");
    }
    CheckOutcome::pass()
}

/// Runs a shell command; a non-zero exit fails with the head of its output.
pub struct CommandCheck {
    command: String,
    label: &'static str,
    fallback: &'static str,
}

impl CommandCheck {
    pub fn lint(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            label: "Lint failed",
            fallback: "Unknown lint error",
        }
    }

    pub fn tests(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            label: "Tests failed",
            fallback: "Unknown test error",
        }
    }
}

impl ProjectCheck for CommandCheck {
    fn run<'a>(&'a self, app_root: &'a Path) -> BoxFuture<'a, CheckOutcome> {
        async move {
            let output = run_shell(&self.command, app_root).await;
            if output.success {
                return CheckOutcome::pass();
            }
            let text = output.failure_text(self.fallback);
            CheckOutcome::fail(format!("{}: {}", self.label, head_lines(&text, FAILURE_LINES)))
        }
        .boxed()
    }
}

pub struct CleanWorkTree;

impl ProjectCheck for CleanWorkTree {
    fn run<'a>(&'a self, app_root: &'a Path) -> BoxFuture<'a, CheckOutcome> {
        async move {
            match run_git(&["status", "--porcelain"], app_root).await {
                Ok(stdout) => {
                    let trimmed = stdout.trim();
                    if trimmed.is_empty() {
                        return CheckOutcome::pass();
                    }
                    let entries: Vec<&str> = trimmed.split('\n').take(DIRTY_ENTRIES).collect();
                    CheckOutcome::fail(format!("Git status not clean: {}", entries.join(", ")))
                }
                Err(err) => CheckOutcome::fail(format!("Git check failed: {err}")),
            }
        }
        .boxed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopReport {
    pub passed: bool,
    pub failures: Vec<String>,
    pub session_id: String,
}

/// Ordered check plan: work-item checks first, then project checks.
pub struct CompletionGate {
    work_item_checks: Vec<Box<dyn WorkItemCheck>>,
    project_checks: Vec<Box<dyn ProjectCheck>>,
}

impl CompletionGate {
    pub fn new(
        work_item_checks: Vec<Box<dyn WorkItemCheck>>,
        project_checks: Vec<Box<dyn ProjectCheck>>,
    ) -> Self {
        Self {
            work_item_checks,
            project_checks,
        }
    }

    pub fn standard(lint_cmd: &str, test_cmd: &str) -> Self {
        Self::new(
            vec![
                Box::new(AdrArchived),
                Box::new(PbiArchived),
                Box::new(CriteriaComplete),
            ],
            vec![
                Box::new(CommandCheck::lint(lint_cmd)),
                Box::new(CommandCheck::tests(test_cmd)),
                Box::new(CleanWorkTree),
            ],
        )
    }

    /// Runs every check without short-circuiting and persists the outcome
    /// under a fresh session id.
    pub async fn run(
        &self,
        store: &SharedStore,
        app: &str,
        app_root: &Path,
        pbi: &str,
    ) -> Result<CopReport, StorageError> {
        let mut failures = Vec::new();
        for check in &self.work_item_checks {
            collect(&mut failures, check.run(app_root, pbi).await);
        }
        for check in &self.project_checks {
            collect(&mut failures, check.run(app_root).await);
        }

        let now = now_millis();
        let session = CompletionSession {
            id: new_id(),
            app: app.to_string(),
            pbi: pbi.to_string(),
            passed: failures.is_empty(),
            failures,
            created_at: now,
            updated_at: now,
        };
        lock_store(store).save_completion_session(&session)?;

        info!(
            event = "cop_complete",
            app,
            pbi,
            passed = session.passed,
            failures = session.failures.len(),
            session_id = %session.id
        );
        Ok(CopReport {
            passed: session.passed,
            failures: session.failures,
            session_id: session.id,
        })
    }
}

fn collect(failures: &mut Vec<String>, outcome: CheckOutcome) {
    if outcome.passed {
        return;
    }
    if let Some(reason) = outcome.reason {
        failures.push(reason);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearDecision {
    Allowed,
    NoSession,
    Failed(Vec<String>),
}

impl ClearDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ClearDecision::Allowed)
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            ClearDecision::Allowed => None,
            ClearDecision::NoSession => {
                Some("wag_cop must pass before wag_clear. Call wag_cop first.".to_string())
            }
            ClearDecision::Failed(failures) => Some(format!(
                "wag_cop failed. Fix issues and run wag_cop again. Failures: {}",
                failures.join("; ")
            )),
        }
    }
}

/// Clear is open when no work item is active, otherwise only after the
/// latest gate run for (app, pbi) passed.
pub fn can_clear(
    store: &WagStore,
    app: &str,
    pbi: Option<&str>,
) -> Result<ClearDecision, StorageError> {
    let Some(pbi) = pbi.filter(|pbi| !pbi.is_empty()) else {
        return Ok(ClearDecision::Allowed);
    };
    Ok(match store.latest_completion_session(app, pbi)? {
        None => ClearDecision::NoSession,
        Some(session) if !session.passed => ClearDecision::Failed(session.failures),
        Some(_) => ClearDecision::Allowed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn shared_store() -> SharedStore {
        Arc::new(Mutex::new(WagStore::open_in_memory().expect("store")))
    }

    fn write(path: PathBuf, content: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    fn session(id: &str, passed: bool, failures: &[&str], updated_at: i64) -> CompletionSession {
        CompletionSession {
            id: id.to_string(),
            app: "demo".to_string(),
            pbi: "PBI-1".to_string(),
            passed,
            failures: failures.iter().map(|f| f.to_string()).collect(),
            created_at: updated_at,
            updated_at,
        }
    }

    struct Fixed(CheckOutcome);

    impl ProjectCheck for Fixed {
        fn run<'a>(&'a self, _app_root: &'a Path) -> BoxFuture<'a, CheckOutcome> {
            let outcome = self.0.clone();
            async move { outcome }.boxed()
        }
    }

    #[test]
    fn criteria_counts_checked_and_unchecked_boxes() {
        let partial = criteria_outcome("- [x] Done\n- [ ] Not done");
        assert!(!partial.passed);
        let reason = partial.reason.expect("reason");
        assert!(reason.contains("unchecked"));
        assert_eq!(reason, "Acceptance criteria not complete: 1 of 2 unchecked");

        assert!(criteria_outcome("- [x] Done\n- [X] Also done").passed);

        let none = criteria_outcome("# PBI-1\nNo checklist here");
        assert_eq!(
            none.reason.as_deref(),
            Some("No acceptance criteria found in PBI")
        );
    }

    #[tokio::test]
    async fn archive_checks_report_missing_files() {
        let root = TempDir::new().expect("temp dir");

        let adr = AdrArchived.run(root.path(), "PBI-1").await;
        assert!(adr
            .reason
            .expect("reason")
            .starts_with("ADR completed directory not found: "));

        fs::create_dir_all(completed_adr_dir(root.path())).expect("mkdir");
        let adr = AdrArchived.run(root.path(), "PBI-1").await;
        assert_eq!(
            adr.reason.as_deref(),
            Some("ADR not found in adr/completed/PBI-1*.md")
        );

        write(completed_adr_dir(root.path()).join("PBI-1-auth.md"), "# ADR");
        assert!(AdrArchived.run(root.path(), "PBI-1").await.passed);

        let pbi = PbiArchived.run(root.path(), "PBI-1").await;
        assert_eq!(
            pbi.reason.as_deref(),
            Some("PBI not found in backlog/_completed/PBI-1.md")
        );
        let criteria = CriteriaComplete.run(root.path(), "PBI-1").await;
        assert_eq!(
            criteria.reason.as_deref(),
            Some("Cannot check criteria - PBI file not found")
        );

        write(completed_pbi_path(root.path(), "PBI-1"), "- [x] Done");
        assert!(PbiArchived.run(root.path(), "PBI-1").await.passed);
        assert!(CriteriaComplete.run(root.path(), "PBI-1").await.passed);
    }

    #[tokio::test]
    async fn command_check_truncates_failure_output() {
        let root = TempDir::new().expect("temp dir");
        assert!(CommandCheck::lint("exit 0").run(root.path()).await.passed);

        let failed = CommandCheck::tests("for i in 1 2 3 4 5 6 7; do echo line$i; done; exit 1")
            .run(root.path())
            .await;
        assert_eq!(
            failed.reason.as_deref(),
            Some("Tests failed: line1\nline2\nline3\nline4\nline5")
        );

        let silent = CommandCheck::lint("exit 3").run(root.path()).await;
        assert_eq!(silent.reason.as_deref(), Some("Lint failed: Unknown lint error"));
    }

    #[tokio::test]
    async fn gate_collects_every_failure_and_persists_the_session() {
        let root = TempDir::new().expect("temp dir");
        write(completed_pbi_path(root.path(), "PBI-1"), "- [ ] todo");
        let store = shared_store();
        let gate = CompletionGate::new(
            vec![Box::new(AdrArchived), Box::new(CriteriaComplete)],
            vec![
                Box::new(Fixed(CheckOutcome::fail("Lint failed: nope"))),
                Box::new(Fixed(CheckOutcome::pass())),
            ],
        );

        let report = gate
            .run(&store, "demo", root.path(), "PBI-1")
            .await
            .expect("run");
        assert!(!report.passed);
        assert_eq!(report.failures.len(), 3);
        assert_eq!(report.failures[2], "Lint failed: nope");

        let saved = lock_store(&store)
            .latest_completion_session("demo", "PBI-1")
            .expect("lookup")
            .expect("session");
        assert_eq!(saved.id, report.session_id);
        assert_eq!(saved.failures, report.failures);

        let again = gate
            .run(&store, "demo", root.path(), "PBI-1")
            .await
            .expect("run");
        assert_ne!(again.session_id, report.session_id);
    }

    #[tokio::test]
    async fn passing_gate_allows_clear() {
        let root = TempDir::new().expect("temp dir");
        let store = shared_store();
        let gate = CompletionGate::new(Vec::new(), vec![Box::new(Fixed(CheckOutcome::pass()))]);
        let report = gate
            .run(&store, "demo", root.path(), "PBI-9")
            .await
            .expect("run");
        assert!(report.passed);
        assert!(report.failures.is_empty());

        let decision = can_clear(&lock_store(&store), "demo", Some("PBI-9")).expect("decision");
        assert!(decision.is_allowed());
    }

    #[test]
    fn clear_gating_follows_the_latest_session() {
        let store = WagStore::open_in_memory().expect("store");
        assert_eq!(
            can_clear(&store, "demo", None).expect("no pbi"),
            ClearDecision::Allowed
        );

        let missing = can_clear(&store, "demo", Some("PBI-1")).expect("no session");
        assert!(!missing.is_allowed());
        assert!(missing.reason().expect("reason").contains("must pass"));

        store
            .save_completion_session(&session("s-1", false, &["a", "b"], 10))
            .expect("save");
        let failed = can_clear(&store, "demo", Some("PBI-1")).expect("failed");
        assert_eq!(
            failed.reason().as_deref(),
            Some("wag_cop failed. Fix issues and run wag_cop again. Failures: a; b")
        );

        store
            .save_completion_session(&session("s-2", true, &[], 20))
            .expect("save");
        assert!(can_clear(&store, "demo", Some("PBI-1"))
            .expect("passed")
            .is_allowed());
    }
}
