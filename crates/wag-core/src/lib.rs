use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod session;

pub use session::{AppRecord, CompletionSession, SessionState, TranscriptOffset};

pub const DEFAULT_BRANCH: &str = "dev";
pub const TRANSCRIPT_CONTEXT: &str = "From transcript";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Workflow mode shown in the header. Absent (`null`) when no mode is set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Docs,
    Adr,
    Dev,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Docs => "DOCS",
            Mode::Adr => "ADR",
            Mode::Dev => "DEV",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = UnknownVariant;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "DOCS" => Ok(Mode::Docs),
            "ADR" => Ok(Mode::Adr),
            "DEV" => Ok(Mode::Dev),
            _ => Err(UnknownVariant::new("mode", input)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Pm,
    Architect,
    Dev,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Pm => "pm",
            Role::Architect => "architect",
            Role::Dev => "dev",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "user" => Ok(Role::User),
            "pm" => Ok(Role::Pm),
            "architect" => Ok(Role::Architect),
            "dev" => Ok(Role::Dev),
            _ => Err(UnknownVariant::new("role", input)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Chat,
    Proposal,
    Review,
    Diff,
    Decision,
    System,
    Context,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::Proposal => "proposal",
            MessageType::Review => "review",
            MessageType::Diff => "diff",
            MessageType::Decision => "decision",
            MessageType::System => "system",
            MessageType::Context => "context",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = UnknownVariant;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "chat" => Ok(MessageType::Chat),
            "proposal" => Ok(MessageType::Proposal),
            "review" => Ok(MessageType::Review),
            "diff" => Ok(MessageType::Diff),
            "decision" => Ok(MessageType::Decision),
            "system" => Ok(MessageType::System),
            "context" => Ok(MessageType::Context),
            _ => Err(UnknownVariant::new("message type", input)),
        }
    }
}

/// Where a message came from: a live API write or a replayed transcript line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    Transcript,
    Wag,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub mode: Option<Mode>,
    pub app: String,
    pub branch: String,
    pub context: String,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            mode: None,
            app: String::new(),
            branch: DEFAULT_BRANCH.to_string(),
            context: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pbi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<MessageSource>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.file.is_none()
            && self.task.is_none()
            && self.pbi.is_none()
            && self.approved.is_none()
            && self.source.is_none()
    }

    /// `None` when no field is set, so empty bags are never stored.
    pub fn into_option(self) -> Option<Self> {
        if self.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

/// One workflow event. The header is a snapshot taken at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub timestamp: i64,
    pub header: Header,
    pub role: Role,
    #[serde(rename = "type")]
    pub r#type: MessageType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    /// Builds a live message with a fresh id, stamped now.
    pub fn new(header: Header, role: Role, r#type: MessageType, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            timestamp: now_millis(),
            header,
            role,
            r#type,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata.into_option();
        self
    }

    pub fn source(&self) -> Option<MessageSource> {
        self.metadata.as_ref().and_then(|metadata| metadata.source)
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Parses an RFC 3339 / ISO-8601 timestamp into epoch milliseconds.
pub fn parse_iso_millis(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|datetime| datetime.with_timezone(&Utc).timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serializes_with_camel_wire_names_and_null_mode() {
        let message = Message {
            id: "m-1".to_string(),
            timestamp: 42,
            header: Header::default(),
            role: Role::Architect,
            r#type: MessageType::Review,
            content: "looks fine".to_string(),
            metadata: None,
        };

        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["type"], "review");
        assert_eq!(value["role"], "architect");
        assert!(value["header"]["mode"].is_null());
        assert_eq!(value["header"]["branch"], "dev");
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn metadata_omits_unset_fields() {
        let metadata = MessageMetadata {
            pbi: Some("PBI-7".to_string()),
            approved: Some(false),
            ..Default::default()
        };
        let value = serde_json::to_value(&metadata).expect("serialize");
        assert_eq!(value, serde_json::json!({"pbi": "PBI-7", "approved": false}));
        assert_eq!(MessageMetadata::default().into_option(), None);
    }

    #[test]
    fn enums_reject_values_outside_the_closed_sets() {
        assert_eq!("pm".parse::<Role>().expect("role"), Role::Pm);
        assert!("robot".parse::<Role>().is_err());
        assert!("memo".parse::<MessageType>().is_err());
        assert_eq!("dev".parse::<Mode>().expect("mode"), Mode::Dev);
        assert!(serde_json::from_str::<Role>("\"robot\"").is_err());
        assert_eq!(
            serde_json::from_str::<Mode>("\"ADR\"").expect("mode"),
            Mode::Adr
        );
    }

    #[test]
    fn iso_timestamps_convert_to_epoch_millis() {
        assert_eq!(
            parse_iso_millis("2026-01-23T10:30:00.000Z"),
            Some(1_769_164_200_000)
        );
        assert_eq!(parse_iso_millis("yesterday"), None);
    }
}
