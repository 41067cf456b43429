//! Durable outbound message queue.
//!
//! Every mutation lands in memory first and is then appended to the JSONL
//! journal; periodic compaction rewrites the journal from the in-memory map
//! via atomic replace, so a crash at any point replays to a consistent
//! state. Entries live until published, TTL-expired, or retry-exhausted.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, ErrorCode, Result};
use crate::paths::{new_id, write_atomic, DataDir};

/// Journal appends between compactions.
const COMPACT_EVERY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub kind: MessageKind,
    /// Recipient pubkey (direct) or group id (group).
    pub target: String,
    pub content: String,
    pub created_at: u64,
    pub retry_count: u32,
    pub next_retry_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total: usize,
    pub pending: usize,
    pub waiting: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Put { msg: QueuedMessage },
    Remove { id: String },
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_size: usize,
    pub max_retries: u32,
    pub ttl: Duration,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_retries: 3,
            ttl: Duration::from_secs(24 * 60 * 60),
            base_delay: Duration::from_secs(1),
            factor: 2,
        }
    }
}

pub struct MessageQueue {
    path: PathBuf,
    cfg: QueueConfig,
    entries: HashMap<String, QueuedMessage>,
    /// Enqueue order; ids of removed entries are pruned lazily.
    order: Vec<String>,
    appends: usize,
}

impl MessageQueue {
    /// Replay the journal into memory, dropping entries already past TTL.
    pub fn load(paths: &DataDir, cfg: QueueConfig) -> Result<Self> {
        let path = paths.offline_queue();
        paths.guard_inside(&path)?;

        let mut queue = Self {
            path,
            cfg,
            entries: HashMap::new(),
            order: Vec::new(),
            appends: 0,
        };

        if queue.path.exists() {
            let file = std::fs::File::open(&queue.path)?;
            let now = now_millis();
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                // A torn final line from a crash mid-append is skipped.
                let record: JournalRecord = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("skipping corrupt queue journal line: {e}");
                        continue;
                    }
                };
                match record {
                    JournalRecord::Put { msg } => {
                        if now.saturating_sub(msg.created_at) >= queue.cfg.ttl.as_millis() as u64 {
                            continue;
                        }
                        if !queue.entries.contains_key(&msg.id) {
                            queue.order.push(msg.id.clone());
                        }
                        queue.entries.insert(msg.id.clone(), msg);
                    }
                    JournalRecord::Remove { id } => {
                        queue.entries.remove(&id);
                    }
                }
            }
            queue.prune_order();
            queue.compact()?;
            log::info!("queue replayed: {} live entries", queue.entries.len());
        }

        Ok(queue)
    }

    /// Admit a new outbound message. Rejects when the cap is reached.
    pub fn enqueue(
        &mut self,
        kind: MessageKind,
        target: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<String> {
        if self.entries.len() >= self.cfg.max_size {
            return Err(AgentError::new(
                ErrorCode::NetworkSendFailed,
                format!("outbound queue is full ({} entries)", self.cfg.max_size),
            ));
        }

        let now = now_millis();
        let msg = QueuedMessage {
            id: new_id(),
            kind,
            target: target.into(),
            content: content.into(),
            created_at: now,
            retry_count: 0,
            next_retry_at: now,
            last_error: None,
        };
        let id = msg.id.clone();
        self.entries.insert(id.clone(), msg.clone());
        self.order.push(id.clone());
        self.append(&JournalRecord::Put { msg })?;
        Ok(id)
    }

    pub fn mark_success(&mut self, id: &str) -> Result<()> {
        if self.entries.remove(id).is_some() {
            self.append(&JournalRecord::Remove { id: id.to_string() })?;
        }
        Ok(())
    }

    /// Record a delivery failure and schedule the next attempt with
    /// exponential backoff. Returns `false` once retries are exhausted.
    pub fn mark_failure(&mut self, id: &str, error: &str) -> Result<bool> {
        let max_retries = self.cfg.max_retries;
        let base = self.cfg.base_delay.as_millis() as u64;
        let factor = self.cfg.factor as u64;

        let Some(msg) = self.entries.get_mut(id) else {
            return Ok(false);
        };

        msg.retry_count += 1;
        msg.last_error = Some(error.to_string());
        let delay = base.saturating_mul(factor.saturating_pow(msg.retry_count - 1));
        msg.next_retry_at = now_millis() + delay;
        let can_retry = msg.retry_count <= max_retries;

        let snapshot = msg.clone();
        self.append(&JournalRecord::Put { msg: snapshot })?;
        Ok(can_retry)
    }

    /// Entries due for a publish attempt, in enqueue order.
    pub fn pending(&self) -> Vec<&QueuedMessage> {
        let now = now_millis();
        let ttl = self.cfg.ttl.as_millis() as u64;
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|m| {
                m.next_retry_at <= now
                    && m.retry_count <= self.cfg.max_retries
                    && now.saturating_sub(m.created_at) < ttl
            })
            .collect()
    }

    pub fn status(&self) -> QueueStatus {
        let pending = self.pending().len();
        QueueStatus {
            total: self.entries.len(),
            pending,
            waiting: self.entries.len() - pending,
        }
    }

    /// Drop TTL-expired and retry-exhausted entries. Returns how many went.
    pub fn clean_expired(&mut self) -> Result<usize> {
        let now = now_millis();
        let ttl = self.cfg.ttl.as_millis() as u64;
        let max_retries = self.cfg.max_retries;

        let doomed: Vec<String> = self
            .entries
            .values()
            .filter(|m| {
                now.saturating_sub(m.created_at) >= ttl || m.retry_count > max_retries
            })
            .map(|m| m.id.clone())
            .collect();

        for id in &doomed {
            self.entries.remove(id);
            self.append(&JournalRecord::Remove { id: id.clone() })?;
            log::debug!("{}: queue dropped entry {id}", ErrorCode::MessageExpired.key());
        }
        self.prune_order();
        Ok(doomed.len())
    }

    /// Rewrite the journal from the in-memory map (atomic replace).
    pub fn compact(&mut self) -> Result<()> {
        let mut out = String::new();
        for id in &self.order {
            if let Some(msg) = self.entries.get(id) {
                let record = JournalRecord::Put { msg: msg.clone() };
                out.push_str(&serde_json::to_string(&record)?);
                out.push('\n');
            }
        }
        write_atomic(&self.path, out.as_bytes())?;
        self.appends = 0;
        Ok(())
    }

    fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;

        self.appends += 1;
        if self.appends >= COMPACT_EVERY {
            self.compact()?;
        }
        Ok(())
    }

    fn prune_order(&mut self) {
        self.order.retain(|id| self.entries.contains_key(id));
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ─── Tests ────────────────────────────────────────────────────────────────────
