use crate::Header;
use serde::{Deserialize, Serialize};

/// What is happening right now. Replaced wholesale by state-setting calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub header: Header,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_pbi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tasks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_app: Option<AppRecord>,
}

impl SessionState {
    /// Name used to key completion sessions: the selected app, else the header app.
    pub fn app_name(&self) -> &str {
        self.selected_app
            .as_ref()
            .map(|app| app.name.as_str())
            .unwrap_or(self.header.app.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppRecord {
    pub name: String,
    pub app_root: String,
    pub repo_root: Option<String>,
    pub last_used: i64,
}

/// Byte watermark up to which a transcript file has been consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptOffset {
    pub app: String,
    pub file_path: String,
    pub byte_offset: u64,
    pub updated_at: i64,
}

/// Outcome of one checklist gate run for an (app, work item) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSession {
    pub id: String,
    pub app: String,
    pub pbi: String,
    pub passed: bool,
    pub failures: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_serializes_only_the_header() {
        let value = serde_json::to_value(SessionState::default()).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "header": {"mode": null, "app": "", "branch": "dev", "context": ""}
            })
        );
    }

    #[test]
    fn app_name_prefers_selected_app() {
        let mut state = SessionState::default();
        state.header.app = "from-header".to_string();
        assert_eq!(state.app_name(), "from-header");

        state.selected_app = Some(AppRecord {
            name: "selected".to_string(),
            app_root: "/tmp/selected".to_string(),
            repo_root: None,
            last_used: 1,
        });
        assert_eq!(state.app_name(), "selected");

        let value = serde_json::to_value(&state).expect("serialize");
        assert_eq!(value["selectedApp"]["appRoot"], "/tmp/selected");
        assert!(value["selectedApp"]["repoRoot"].is_null());
    }
}
