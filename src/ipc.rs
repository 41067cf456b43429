//! Local IPC — the on-disk contract between the long-lived service and
//! short-lived CLI processes.
//!
//! Four artifacts: `server.pid` (liveness), `commands.jsonl` (CLI appends),
//! `results.jsonl` (service appends, correlated by command id) and
//! `messages.jsonl` (inbound events). Journals are append-only; rotation
//! happens only via atomic replace.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, ErrorCode, Result};
use crate::paths::{new_id, write_atomic, DataDir};
use crate::queue::QueueStatus;
use crate::relay::RelayStats;

// ─── Command language ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Send { to: String, content: String },
    SendGroup { group_id: String, content: String },
    CreateGroup { name: String },
    JoinGroup { group_id: String, topic: String },
    LeaveGroup { group_id: String },
    ListGroups,
    Kick { group_id: String, target: String },
    Ban { group_id: String, target: String },
    Mute { group_id: String, target: String, duration_s: u64 },
    SetAdmin { group_id: String, target: String, admin: bool },
    Transfer { group_id: String, new_owner: String },
    Status,
    Recv {
        #[serde(default)]
        clear: bool,
    },
}

/// One parsed line of `commands.jsonl`. The id survives even when the
/// command itself does not parse, so the failure can still be correlated.
#[derive(Debug)]
pub struct ParsedCommand {
    pub id: String,
    pub command: std::result::Result<Command, AgentError>,
}

pub fn parse_command_line(line: &str) -> ParsedCommand {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return ParsedCommand {
                id: new_id(),
                command: Err(AgentError::new(
                    ErrorCode::UnknownCommand,
                    format!("unparseable command line: {e}"),
                )),
            }
        }
    };
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(new_id);
    let command = serde_json::from_value::<Command>(value).map_err(|e| {
        AgentError::new(ErrorCode::UnknownCommand, format!("unknown command: {e}"))
    });
    ParsedCommand { id, command }
}

// ─── Result envelope ─────────────────────────────────────────────────────────

/// `{ok: true, …payload, timestamp}`
pub fn success_envelope(payload: Value) -> Value {
    let mut obj = serde_json::json!({
        "ok": true,
        "timestamp": now_secs(),
    });
    if let (Some(out), Some(extra)) = (obj.as_object_mut(), payload.as_object()) {
        for (k, v) in extra {
            out.insert(k.clone(), v.clone());
        }
    }
    obj
}

/// `{ok: false, error: {…}, timestamp}`
pub fn failure_envelope(err: &AgentError) -> Value {
    serde_json::json!({
        "ok": false,
        "error": err.to_json(),
        "timestamp": now_secs(),
    })
}

// ─── Journal primitives ──────────────────────────────────────────────────────

/// Append one self-describing record as a line of JSON.
pub fn append_line(path: &PathBuf, record: &Value) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Incremental reader over an append-only journal. Remembers its byte
/// offset and only hands out complete (newline-terminated) lines, so a
/// writer caught mid-append is picked up on the next drain.
pub struct JournalReader {
    path: PathBuf,
    offset: u64,
}

impl JournalReader {
    pub fn new(path: PathBuf) -> Self {
        Self { path, offset: 0 }
    }

    /// Start at the current end of the journal, skipping history.
    pub fn at_end(path: PathBuf) -> Self {
        let offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self { path, offset }
    }

    pub fn drain(&mut self) -> Result<Vec<String>> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        if len < self.offset {
            // Journal was rotated underneath us; start over.
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;

        let mut lines = Vec::new();
        let mut consumed = 0usize;
        for line in buf.split_inclusive('\n') {
            if !line.ends_with('\n') {
                break;
            }
            consumed += line.len();
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        self.offset += consumed as u64;
        Ok(lines)
    }
}

// ─── Inbound message journal ─────────────────────────────────────────────────

pub fn append_message(paths: &DataDir, record: &Value) -> Result<()> {
    append_line(&paths.messages(), record)
}

/// Return journal entries, newest last, capped at `max_keep`. With `clear`
/// the journal is emptied; otherwise an over-long journal is trimmed to the
/// cap, both via atomic replace.
pub fn read_messages(paths: &DataDir, clear: bool, max_keep: usize) -> Result<Vec<Value>> {
    let path = paths.messages();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = std::fs::read_to_string(&path)?;
    let mut entries: Vec<Value> = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(v) => entries.push(v),
            Err(e) => log::warn!("skipping corrupt message journal line: {e}"),
        }
    }

    if entries.len() > max_keep {
        entries.drain(..entries.len() - max_keep);
    }

    if clear {
        write_atomic(&path, b"")?;
    } else if raw.lines().count() > max_keep {
        let mut out = String::new();
        for entry in &entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        write_atomic(&path, out.as_bytes())?;
    }

    Ok(entries)
}

// ─── PID file ────────────────────────────────────────────────────────────────

pub fn write_pid(paths: &DataDir, pid: u32) -> Result<()> {
    write_atomic(&paths.server_pid(), pid.to_string().as_bytes())
}

pub fn read_pid(paths: &DataDir) -> Option<u32> {
    std::fs::read_to_string(paths.server_pid())
        .ok()?
        .trim()
        .parse()
        .ok()
}

pub fn remove_pid(paths: &DataDir) {
    let _ = std::fs::remove_file(paths.server_pid());
}

#[cfg(target_os = "linux")]
pub fn pid_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

/// Without procfs, a fresh health heartbeat stands in for liveness; the
/// caller passes the heartbeat age limit.
#[cfg(not(target_os = "linux"))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

/// Whether a live service owns this data directory.
pub fn is_service_running(paths: &DataDir) -> bool {
    match read_pid(paths) {
        Some(pid) if pid == std::process::id() => true,
        Some(pid) => {
            if cfg!(target_os = "linux") {
                pid_alive(pid)
            } else {
                health_is_fresh(paths, Duration::from_secs(15))
            }
        }
        None => false,
    }
}

fn health_is_fresh(paths: &DataDir, max_age: Duration) -> bool {
    std::fs::metadata(paths.health())
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .map(|age| age <= max_age)
        .unwrap_or(false)
}

// ─── Health heartbeat ────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    pub running: bool,
    pub pid: u32,
    pub agent_name: String,
    pub started_at: u64,
    pub queue_status: QueueStatus,
    pub relay_stats: Vec<RelayStats>,
}

pub fn write_health(paths: &DataDir, health: &Health) -> Result<()> {
    write_atomic(&paths.health(), serde_json::to_string_pretty(health)?.as_bytes())
}

pub fn read_health(paths: &DataDir) -> Option<Health> {
    let raw = std::fs::read_to_string(paths.health()).ok()?;
    serde_json::from_str(&raw).ok()
}

// ─── CLI-side helpers ────────────────────────────────────────────────────────

/// Append a command for the service to pick up. Fails fast when no live
/// service owns the data directory.
pub fn enqueue_command(paths: &DataDir, command: &Command) -> Result<String> {
    if !is_service_running(paths) {
        return Err(AgentError::new(
            ErrorCode::ServiceNotRunning,
            "no running service owns this data directory",
        ));
    }
    let id = new_id();
    let mut record = serde_json::to_value(command)?;
    record["id"] = Value::String(id.clone());
    append_line(&paths.commands(), &record)?;
    Ok(id)
}

/// Scan the results journal for the envelope answering `command_id`.
pub fn find_result(paths: &DataDir, command_id: &str) -> Result<Option<Value>> {
    let path = paths.results();
    if !path.exists() {
        return Ok(None);
    }
    for line in std::fs::read_to_string(&path)?.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(v) = serde_json::from_str::<Value>(line) {
            if v.get("id").and_then(Value::as_str) == Some(command_id) {
                return Ok(Some(v));
            }
        }
    }
    Ok(None)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn data_dir(dir: &tempfile::TempDir) -> DataDir {
        let paths = DataDir::new(dir.path());
        paths.ensure().unwrap();
        paths
    }

    #[test]
    fn command_lines_roundtrip() {
        let cmd = Command::Send { to: "a".repeat(64), content: "hi".into() };
        let mut record = serde_json::to_value(&cmd).unwrap();
        record["id"] = Value::String("cmd-1".into());
        let line = serde_json::to_string(&record).unwrap();

        let parsed = parse_command_line(&line);
        assert_eq!(parsed.id, "cmd-1");
        assert_eq!(parsed.command.unwrap(), cmd);
    }

    #[test]
    fn unknown_commands_keep_their_id() {
        let parsed = parse_command_line(r#"{"id":"cmd-9","cmd":"fly_to_moon"}"#);
        assert_eq!(parsed.id, "cmd-9");
        let err = parsed.command.unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownCommand);
    }

    #[test]
    fn envelopes_have_the_contract_shape() {
        let ok = success_envelope(serde_json::json!({"group_id": "g1"}));
        assert_eq!(ok["ok"], true);
        assert_eq!(ok["group_id"], "g1");
        assert!(ok["timestamp"].as_u64().unwrap() > 0);

        let err = AgentError::new(ErrorCode::GroupNotFound, "nope");
        let fail = failure_envelope(&err);
        assert_eq!(fail["ok"], false);
        assert_eq!(fail["error"]["code_key"], "GROUP_NOT_FOUND");
    }

    #[test]
    fn journal_reader_drains_incrementally() {
        let dir = tempfile::tempdir().unwrap();
        let paths = data_dir(&dir);
        let mut reader = JournalReader::new(paths.commands());

        assert!(reader.drain().unwrap().is_empty());

        append_line(&paths.commands(), &serde_json::json!({"n": 1})).unwrap();
        append_line(&paths.commands(), &serde_json::json!({"n": 2})).unwrap();
        assert_eq!(reader.drain().unwrap().len(), 2);
        assert!(reader.drain().unwrap().is_empty());

        append_line(&paths.commands(), &serde_json::json!({"n": 3})).unwrap();
        let third = reader.drain().unwrap();
        assert_eq!(third.len(), 1);
        assert!(third[0].contains("3"));
    }

    #[test]
    fn journal_reader_ignores_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let paths = data_dir(&dir);
        let mut reader = JournalReader::new(paths.commands());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.commands())
            .unwrap();
        file.write_all(b"{\"n\":1}\n{\"n\":2").unwrap();

        assert_eq!(reader.drain().unwrap().len(), 1);
        // Writer finishes the line.
        file.write_all(b"}\n").unwrap();
        assert_eq!(reader.drain().unwrap(), vec!["{\"n\":2}".to_string()]);
    }

    #[test]
    fn read_messages_clear_empties_journal() {
        let dir = tempfile::tempdir().unwrap();
        let paths = data_dir(&dir);

        for i in 0..3 {
            append_message(&paths, &serde_json::json!({"n": i})).unwrap();
        }
        let got = read_messages(&paths, true, 1_000).unwrap();
        assert_eq!(got.len(), 3);
        assert!(read_messages(&paths, false, 1_000).unwrap().is_empty());
    }

    #[test]
    fn read_messages_trims_to_cap() {
        let dir = tempfile::tempdir().unwrap();
        let paths = data_dir(&dir);

        for i in 0..7 {
            append_message(&paths, &serde_json::json!({"n": i})).unwrap();
        }
        let got = read_messages(&paths, false, 4).unwrap();
        assert_eq!(got.len(), 4);
        assert_eq!(got[0]["n"], 3);

        // The journal itself was trimmed on disk.
        let raw = std::fs::read_to_string(paths.messages()).unwrap();
        assert_eq!(raw.lines().count(), 4);
    }

    #[test]
    fn enqueue_requires_running_service() {
        let dir = tempfile::tempdir().unwrap();
        let paths = data_dir(&dir);

        let err = enqueue_command(
            &paths,
            &Command::Send { to: "a".repeat(64), content: "hi".into() },
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ServiceNotRunning);

        // Our own PID counts as a live service.
        write_pid(&paths, std::process::id()).unwrap();
        let id = enqueue_command(
            &paths,
            &Command::Send { to: "a".repeat(64), content: "hi".into() },
        )
        .unwrap();
        assert_eq!(id.len(), 32);
    }

    #[test]
    fn find_result_correlates_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let paths = data_dir(&dir);

        let mut rec = success_envelope(serde_json::json!({"x": 1}));
        rec["id"] = Value::String("cmd-7".into());
        append_line(&paths.results(), &rec).unwrap();

        assert!(find_result(&paths, "cmd-7").unwrap().is_some());
        assert!(find_result(&paths, "cmd-8").unwrap().is_none());
    }

    #[test]
    fn stale_pid_means_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let paths = data_dir(&dir);
        // PID 1 exists on Linux but this refined check only trusts our own
        // PID plus procfs; use an id that cannot be a live process.
        write_pid(&paths, u32::MAX - 1).unwrap();
        assert!(!is_service_running(&paths));
        remove_pid(&paths);
        assert!(!is_service_running(&paths));
    }
}
