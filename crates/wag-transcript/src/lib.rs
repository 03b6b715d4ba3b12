use serde_json::Value;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use wag_core::{
    now_millis, parse_iso_millis, Header, Message, MessageMetadata, MessageSource, MessageType,
    Role, DEFAULT_BRANCH, TRANSCRIPT_CONTEXT,
};
use wag_storage::{StorageError, WagStore};

const TRANSCRIPT_EXTENSION: &str = "jsonl";

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result of one poll tick.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PollReport {
    pub file: Option<PathBuf>,
    pub rotated: bool,
    pub start_offset: u64,
    pub offset: u64,
    pub skipped_lines: usize,
    pub duplicates: usize,
    pub new_messages: Vec<Message>,
}

/// Bytes appended since a watermark, split into parsed JSON objects.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TailChunk {
    pub entries: Vec<Value>,
    pub skipped_lines: usize,
    pub new_offset: u64,
}

/// `~/.claude/projects`, where assistant sessions are logged per project.
pub fn default_projects_root() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("projects"))
}

/// Directory name the assistant uses for a project root: separators and dots become `-`.
pub fn encode_project_dir(app_root: &str) -> String {
    app_root
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | '.' => '-',
            other => other,
        })
        .collect()
}

pub fn transcript_dir(projects_root: &Path, app_root: &str) -> PathBuf {
    projects_root.join(encode_project_dir(app_root))
}

/// Most recently modified `*.jsonl` file in `dir`, if any.
pub fn latest_transcript(dir: &Path) -> io::Result<Option<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(TRANSCRIPT_EXTENSION) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let newer = match &latest {
            Some((current, current_path)) => {
                modified > *current || (modified == *current && path > *current_path)
            }
            None => true,
        };
        if newer {
            latest = Some((modified, path));
        }
    }

    Ok(latest.map(|(_, path)| path))
}

/// Reads `[offset, EOF)` and parses each complete JSON object line.
///
/// Lines that do not parse (including a trailing fragment the writer has not
/// finished) are dropped, yet the returned offset still covers every byte read.
pub fn read_appended(path: &Path, offset: u64) -> io::Result<TailChunk> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(TailChunk {
                new_offset: offset,
                ..Default::default()
            })
        }
        Err(err) => return Err(err),
    };

    let size = file.metadata()?.len();
    if size <= offset {
        return Ok(TailChunk {
            new_offset: offset,
            ..Default::default()
        });
    }

    file.seek(SeekFrom::Start(offset))?;
    let mut buffer = Vec::with_capacity((size - offset) as usize);
    let read = file.read_to_end(&mut buffer)?;

    let mut chunk = TailChunk {
        new_offset: offset + read as u64,
        ..Default::default()
    };
    for line in buffer.split(|byte| *byte == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Value>(line) {
            Ok(value) if value.is_object() => chunk.entries.push(value),
            _ => chunk.skipped_lines += 1,
        }
    }

    Ok(chunk)
}

/// Converts a user or assistant transcript entry into a chat message.
pub fn parse_transcript_entry(entry: &Value, app: &str) -> Option<Message> {
    let role = match entry.get("type").and_then(Value::as_str)? {
        "user" => Role::User,
        "assistant" => Role::Dev,
        _ => return None,
    };
    let id = entry
        .get("uuid")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())?;
    let text = extract_text(entry.get("message")?.get("content")?)?;
    if text.is_empty() {
        return None;
    }

    let timestamp = entry
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_iso_millis)
        .unwrap_or_else(now_millis);

    Some(Message {
        id: id.to_string(),
        timestamp,
        header: Header {
            mode: None,
            app: app.to_string(),
            branch: DEFAULT_BRANCH.to_string(),
            context: TRANSCRIPT_CONTEXT.to_string(),
        },
        role,
        r#type: MessageType::Chat,
        content: text,
        metadata: Some(MessageMetadata {
            source: Some(MessageSource::Transcript),
            ..Default::default()
        }),
    })
}

fn extract_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .map(|block| block.get("text").and_then(Value::as_str).unwrap_or_default())
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        _ => None,
    }
}

/// Follows the newest transcript of one project and folds new lines into the store.
pub struct TranscriptTail {
    projects_root: PathBuf,
}

impl TranscriptTail {
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        Self {
            projects_root: projects_root.into(),
        }
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    /// One tick: locate, read past the watermark, persist unseen messages,
    /// then advance the watermark. Returned messages were not in the store before.
    pub fn poll(
        &self,
        store: &WagStore,
        app: &str,
        app_root: &str,
    ) -> Result<PollReport, TranscriptError> {
        let dir = transcript_dir(&self.projects_root, app_root);
        let Some(path) = latest_transcript(&dir)? else {
            return Ok(PollReport::default());
        };
        let file_path = path.to_string_lossy().to_string();

        let mut report = PollReport {
            file: Some(path.clone()),
            ..Default::default()
        };

        let stored = store.transcript_offset(app)?;
        let start_offset = match stored {
            Some(offset) if offset.file_path == file_path => offset.byte_offset,
            Some(_) => {
                store.set_transcript_offset(app, &file_path, 0)?;
                report.rotated = true;
                0
            }
            None => 0,
        };
        report.start_offset = start_offset;

        let chunk = read_appended(&path, start_offset)?;
        report.skipped_lines = chunk.skipped_lines;
        report.offset = chunk.new_offset;
        if chunk.new_offset == start_offset {
            return Ok(report);
        }

        for entry in &chunk.entries {
            let Some(message) = parse_transcript_entry(entry, app) else {
                continue;
            };
            if store.has_message(&message.id)? {
                report.duplicates += 1;
                continue;
            }
            store.append_message(&message)?;
            report.new_messages.push(message);
        }

        store.set_transcript_offset(app, &file_path, chunk.new_offset)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    const APP_ROOT: &str = "/home/user/project";

    fn user_line(uuid: &str, text: &str) -> String {
        json!({
            "type": "user",
            "uuid": uuid,
            "timestamp": "2026-01-23T10:30:00.000Z",
            "message": {"content": [{"type": "text", "text": text}]}
        })
        .to_string()
    }

    fn project_dir(root: &TempDir) -> PathBuf {
        let dir = transcript_dir(root.path(), APP_ROOT);
        fs::create_dir_all(&dir).expect("create project dir");
        dir
    }

    fn append(path: &Path, text: &str) {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open transcript");
        file.write_all(text.as_bytes()).expect("append");
        file.flush().expect("flush");
    }

    #[test]
    fn encodes_separators_and_dots_as_hyphens() {
        assert_eq!(encode_project_dir("/home/user/project"), "-home-user-project");
        assert_eq!(encode_project_dir("/"), "-");
        assert_eq!(
            encode_project_dir("/home/samf/source/claude/tools/wagui"),
            "-home-samf-source-claude-tools-wagui"
        );
        assert_eq!(encode_project_dir("/srv/app.v2"), "-srv-app-v2");
        assert_eq!(
            transcript_dir(Path::new("/p"), "/a/b"),
            PathBuf::from("/p/-a-b")
        );
    }

    #[test]
    fn parses_user_and_assistant_entries() {
        let user: Value = serde_json::from_str(&user_line("u-1", "Hello world")).expect("json");
        let message = parse_transcript_entry(&user, "test-app").expect("message");
        assert_eq!(message.id, "u-1");
        assert_eq!(message.role, Role::User);
        assert_eq!(message.r#type, MessageType::Chat);
        assert_eq!(message.content, "Hello world");
        assert_eq!(message.timestamp, 1_769_164_200_000);
        assert_eq!(message.header.app, "test-app");
        assert_eq!(message.header.context, TRANSCRIPT_CONTEXT);
        assert_eq!(message.source(), Some(MessageSource::Transcript));

        let assistant = json!({
            "type": "assistant",
            "uuid": "a-1",
            "timestamp": "2026-01-23T10:31:00.000Z",
            "message": {"content": "I can help with that"}
        });
        let message = parse_transcript_entry(&assistant, "test-app").expect("message");
        assert_eq!(message.role, Role::Dev);
        assert_eq!(message.content, "I can help with that");
    }

    #[test]
    fn joins_text_blocks_and_ignores_other_blocks() {
        let entry = json!({
            "type": "assistant",
            "uuid": "multi",
            "timestamp": "2026-01-23T10:32:00.000Z",
            "message": {"content": [
                {"type": "text", "text": "First line"},
                {"type": "tool_use", "name": "bash"},
                {"type": "text", "text": "Second line"}
            ]}
        });
        let message = parse_transcript_entry(&entry, "app").expect("message");
        assert_eq!(message.content, "First line\nSecond line");
    }

    #[test]
    fn skips_non_message_and_textless_entries() {
        let progress = json!({
            "type": "progress",
            "uuid": "p-1",
            "timestamp": "2026-01-23T10:32:00.000Z",
            "message": {"content": "working"}
        });
        assert!(parse_transcript_entry(&progress, "app").is_none());

        let tool_only = json!({
            "type": "user",
            "uuid": "t-1",
            "timestamp": "2026-01-23T10:32:00.000Z",
            "message": {"content": [{"type": "tool_result", "content": "ok"}]}
        });
        assert!(parse_transcript_entry(&tool_only, "app").is_none());

        let empty = json!({
            "type": "user",
            "uuid": "e-1",
            "timestamp": "2026-01-23T10:32:00.000Z",
            "message": {"content": ""}
        });
        assert!(parse_transcript_entry(&empty, "app").is_none());

        let no_message = json!({"type": "user", "uuid": "n-1"});
        assert!(parse_transcript_entry(&no_message, "app").is_none());
    }

    #[test]
    fn latest_transcript_picks_newest_jsonl() {
        let root = TempDir::new().expect("temp dir");
        let dir = project_dir(&root);
        assert!(latest_transcript(&root.path().join("missing"))
            .expect("missing dir")
            .is_none());

        let older = dir.join("older.jsonl");
        let newer = dir.join("newer.jsonl");
        append(&older, "{}\n");
        append(&newer, "{}\n");
        append(&dir.join("notes.txt"), "ignored");

        let file = File::options().write(true).open(&older).expect("open");
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .expect("set mtime");

        assert_eq!(latest_transcript(&dir).expect("latest"), Some(older));
    }

    #[test]
    fn re_ingesting_the_same_line_yields_one_message() {
        let root = TempDir::new().expect("temp dir");
        let dir = project_dir(&root);
        let path = dir.join("session.jsonl");
        let line = user_line("dup-1", "hello");
        append(&path, &format!("{line}\n{line}\n"));

        let store = WagStore::open_in_memory().expect("store");
        let tail = TranscriptTail::new(root.path());
        let report = tail.poll(&store, "demo", APP_ROOT).expect("poll");
        assert_eq!(report.new_messages.len(), 1);
        assert_eq!(report.duplicates, 1);

        store
            .set_transcript_offset("demo", &path.to_string_lossy(), 0)
            .expect("rewind");
        let replay = tail.poll(&store, "demo", APP_ROOT).expect("poll again");
        assert!(replay.new_messages.is_empty());
        assert_eq!(replay.duplicates, 2);
        assert_eq!(store.message_count().expect("count"), 1);
    }

    #[test]
    fn offset_only_moves_forward_for_the_same_file() {
        let root = TempDir::new().expect("temp dir");
        let dir = project_dir(&root);
        let path = dir.join("session.jsonl");
        let store = WagStore::open_in_memory().expect("store");
        let tail = TranscriptTail::new(root.path());

        let empty = tail.poll(&store, "demo", APP_ROOT).expect("no file");
        assert!(empty.file.is_none());

        let first_line = format!("{}\n", user_line("m-1", "one"));
        append(&path, &first_line);
        let first = tail.poll(&store, "demo", APP_ROOT).expect("poll");
        assert_eq!(first.offset, first_line.len() as u64);

        let idle = tail.poll(&store, "demo", APP_ROOT).expect("idle poll");
        assert_eq!(idle.offset, first.offset);
        assert!(idle.new_messages.is_empty());

        append(&path, &format!("{}\n", user_line("m-2", "two")));
        let second = tail.poll(&store, "demo", APP_ROOT).expect("poll");
        assert!(second.offset > first.offset);
        assert_eq!(second.start_offset, first.offset);
        assert_eq!(second.new_messages.len(), 1);
        assert_eq!(second.new_messages[0].id, "m-2");

        let stored = store
            .transcript_offset("demo")
            .expect("offset")
            .expect("present");
        assert_eq!(stored.byte_offset, second.offset);
    }

    #[test]
    fn rotation_to_a_new_file_restarts_from_zero() {
        let root = TempDir::new().expect("temp dir");
        let dir = project_dir(&root);
        let store = WagStore::open_in_memory().expect("store");
        let tail = TranscriptTail::new(root.path());

        let old = dir.join("old.jsonl");
        append(&old, &format!("{}\n", user_line("old-1", "old")));
        tail.poll(&store, "demo", APP_ROOT).expect("poll old");

        let new = dir.join("new.jsonl");
        let new_line = format!("{}\n", user_line("new-1", "new"));
        append(&new, &new_line);
        let file = File::options().write(true).open(&new).expect("open");
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .expect("set mtime");

        let report = tail.poll(&store, "demo", APP_ROOT).expect("poll new");
        assert!(report.rotated);
        assert_eq!(report.start_offset, 0);
        assert_eq!(report.offset, new_line.len() as u64);
        assert_eq!(report.new_messages[0].id, "new-1");

        let stored = store
            .transcript_offset("demo")
            .expect("offset")
            .expect("present");
        assert_eq!(stored.file_path, new.to_string_lossy());
    }

    #[test]
    fn partial_trailing_line_is_dropped_but_its_bytes_are_consumed() {
        let root = TempDir::new().expect("temp dir");
        let dir = project_dir(&root);
        let path = dir.join("session.jsonl");
        let store = WagStore::open_in_memory().expect("store");
        let tail = TranscriptTail::new(root.path());

        let complete = format!("{}\n", user_line("c-1", "complete"));
        let partial = user_line("p-1", "partial");
        let (head, rest) = partial.split_at(partial.len() / 2);
        append(&path, &format!("{complete}{{\"bad_json\"\n{head}"));

        let first = tail.poll(&store, "demo", APP_ROOT).expect("poll");
        assert_eq!(first.new_messages.len(), 1);
        assert_eq!(first.skipped_lines, 2);
        assert_eq!(
            first.offset,
            (complete.len() + "{\"bad_json\"\n".len() + head.len()) as u64
        );

        append(&path, &format!("{rest}\n"));
        let second = tail.poll(&store, "demo", APP_ROOT).expect("poll");
        assert!(second.new_messages.is_empty());
        assert_eq!(second.skipped_lines, 1);
        assert!(!store.has_message("p-1").expect("lookup"));
    }
}
