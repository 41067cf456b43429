//! Service core — the long-lived supervisor.
//!
//! Owns identity, storage key, queue, group manager and relay pool, and runs
//! the cooperative main loop: drain CLI commands, push the outbound queue,
//! heartbeat the health file, dispatch inbound events. All shared state is
//! mutated only from this loop; relay transports talk back exclusively
//! through the delivery channel.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::direct;
use crate::error::{AgentError, ErrorCode, Result};
use crate::event::{kind, Event, Subscription};
use crate::group::{GroupControlOp, GroupManager};
use crate::group_crypto;
use crate::identity::{parse_pubkey, Identity};
use crate::ipc::{
    self, append_line, failure_envelope, parse_command_line, success_envelope, Command, Health,
    JournalReader,
};
use crate::paths::DataDir;
use crate::queue::{MessageKind, MessageQueue, QueueConfig, QueuedMessage};
use crate::relay::{PoolConfig, RelayDelivery, RelayPool, RelayTransport};
use crate::storage_key::StorageKeyCustodian;

/// Plaintext carried inside a sealed group event. The wire kind mirrors the
/// variant so subscribers can route without decrypting first.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GroupPayload {
    Msg { content: String },
    Ctrl { op: GroupControlOp },
}

pub struct Service {
    cfg: Config,
    paths: DataDir,
    custodian: StorageKeyCustodian,
    identity: Identity,
    queue: MessageQueue,
    groups: GroupManager,
    pool: RelayPool,
    event_rx: Option<mpsc::Receiver<RelayDelivery>>,
    command_reader: JournalReader,
    started_at: u64,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").finish_non_exhaustive()
    }
}

impl Service {
    /// Bring the service up: claim the data directory, load all persisted
    /// state, connect the relay pool and open subscriptions.
    pub async fn start(cfg: Config, relays: Vec<Arc<dyn RelayTransport>>) -> Result<Self> {
        let paths = DataDir::new(&cfg.data_dir);
        paths.ensure()?;

        if ipc::is_service_running(&paths) {
            return Err(AgentError::new(
                ErrorCode::ServiceAlreadyRunning,
                format!(
                    "a live service already owns {}",
                    paths.root().display()
                ),
            ));
        }

        let custodian = StorageKeyCustodian::new(paths.clone(), cfg.key_rotation_interval);
        let identity = Identity::load_or_create(&paths, &custodian)?;
        let groups = GroupManager::load(&paths, &custodian, cfg.group_history_limit)?;

        // Rotate only after everything sealed under the old key is loaded.
        if custodian.should_rotate()? {
            custodian.rotate()?;
            identity.persist(&paths, &custodian)?;
            groups.persist(&custodian)?;
        }

        let queue = MessageQueue::load(
            &paths,
            QueueConfig {
                max_size: cfg.max_queue_size,
                max_retries: cfg.max_retries,
                ttl: cfg.message_ttl,
                base_delay: cfg.retry_base_delay,
                factor: cfg.retry_factor,
            },
        )?;

        let (mut pool, event_rx) = RelayPool::new(
            &paths,
            PoolConfig {
                publish_timeout: cfg.publish_timeout,
                dedup_cache_size: cfg.dedup_cache_size,
                unhealthy_after_failures: cfg.unhealthy_after_failures,
            },
            relays,
        )?;

        if !cfg.ephemeral {
            ipc::write_pid(&paths, std::process::id())?;
        }

        let group_ids: Vec<String> = groups
            .list_groups()
            .iter()
            .map(|g| g.group_id.clone())
            .collect();
        pool.subscribe(Subscription {
            recipient: Some(identity.public_key_hex().to_string()),
            group_ids,
        })
        .await;

        let command_reader = JournalReader::at_end(paths.commands());

        log::info!(
            "service up as {} in {}",
            identity.public_key_hex(),
            paths.root().display()
        );

        Ok(Self {
            cfg,
            paths,
            custodian,
            identity,
            queue,
            groups,
            pool,
            event_rx: Some(event_rx),
            command_reader,
            started_at: now_secs(),
        })
    }

    pub fn public_key_hex(&self) -> &str {
        self.identity.public_key_hex()
    }

    /// Main loop. Returns after a shutdown signal and a final flush.
    pub async fn run(mut self) -> Result<()> {
        let mut event_rx = self.event_rx.take().expect("run() is called once");

        let mut cmd_interval = tokio::time::interval(self.cfg.cmd_poll_interval);
        let mut queue_interval = tokio::time::interval(Duration::from_secs(1));
        let mut health_interval = tokio::time::interval(self.cfg.health_update_interval);

        loop {
            tokio::select! {
                _ = cmd_interval.tick() => self.command_tick().await,
                _ = queue_interval.tick() => self.queue_tick().await,
                _ = health_interval.tick() => self.health_tick(),
                delivery = event_rx.recv() => {
                    match delivery {
                        Some(d) => {
                            if let Some(event) = self.pool.admit(d) {
                                self.dispatch_inbound(event);
                            }
                        }
                        None => {
                            log::error!("delivery channel closed; shutting down");
                            break;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    // ── Ticks ────────────────────────────────────────────────────────────────

    /// Drain new command lines, dispatch each, and append the outcome to the
    /// results journal keyed by command id.
    pub(crate) async fn command_tick(&mut self) {
        let lines = match self.command_reader.drain() {
            Ok(lines) => lines,
            Err(e) => {
                log::error!("cannot read command journal: {e}");
                return;
            }
        };

        for line in lines {
            let parsed = parse_command_line(&line);
            let envelope = match parsed.command {
                Ok(command) => match self.handle_command(command).await {
                    Ok(payload) => success_envelope(payload),
                    Err(e) => {
                        log::debug!("command {} failed: {e}", parsed.id);
                        failure_envelope(&e)
                    }
                },
                Err(e) => failure_envelope(&e),
            };

            let mut record = envelope;
            record["id"] = Value::String(parsed.id);
            if let Err(e) = append_line(&self.paths.results(), &record) {
                log::error!("cannot append result: {e}");
            }
        }
    }

    /// Attempt delivery of every due queue entry.
    pub(crate) async fn queue_tick(&mut self) {
        match self.queue.clean_expired() {
            Ok(0) => {}
            Ok(n) => log::info!("dropped {n} expired queue entries"),
            Err(e) => log::error!("queue cleanup failed: {e}"),
        }

        let due: Vec<QueuedMessage> = self.queue.pending().into_iter().cloned().collect();
        for msg in due {
            let outcome = match self.build_event(&msg) {
                Ok(event) => self.pool.publish(&event).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    if let Err(e) = self.queue.mark_success(&msg.id) {
                        log::error!("cannot ack queue entry {}: {e}", msg.id);
                    }
                }
                Err(e) => match self.queue.mark_failure(&msg.id, &e.message) {
                    Ok(true) => log::debug!("will retry {} after backoff: {e}", msg.id),
                    Ok(false) => log::warn!(
                        "{}: giving up on message {} to {}",
                        ErrorCode::MessageRetryExhausted.key(),
                        msg.id,
                        msg.target
                    ),
                    Err(journal_err) => {
                        log::error!("cannot record failure for {}: {journal_err}", msg.id)
                    }
                },
            }
        }
    }

    /// Refresh `health.json`, persist relay stats, rotate the storage key
    /// when due.
    pub(crate) fn health_tick(&mut self) {
        if let Ok(true) = self.custodian.should_rotate() {
            match self.custodian.rotate() {
                Ok(_) => {
                    if let Err(e) = self
                        .identity
                        .persist(&self.paths, &self.custodian)
                        .and_then(|_| self.groups.persist(&self.custodian))
                    {
                        log::error!("re-encryption after rotation failed: {e}");
                    }
                }
                Err(e) => log::error!("storage key rotation failed: {e}"),
            }
        }

        let health = Health {
            running: true,
            pid: std::process::id(),
            agent_name: self.cfg.agent_name.clone(),
            started_at: self.started_at,
            queue_status: self.queue.status(),
            relay_stats: self.pool.stats(),
        };
        if let Err(e) = ipc::write_health(&self.paths, &health) {
            log::error!("cannot write health file: {e}");
        }
        if let Err(e) = self.pool.persist_stats() {
            log::error!("cannot persist relay stats: {e}");
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Decrypt one first-seen event and land it in the inbound journal (or
    /// the group state machine for control events).
    pub(crate) fn dispatch_inbound(&mut self, event: Event) {
        if event.pubkey == self.identity.public_key_hex() {
            // Our own publishes echo back through subscriptions.
            return;
        }

        match event.kind {
            kind::DIRECT => self.dispatch_direct(event),
            kind::GROUP => self.dispatch_group(event),
            kind::GROUP_CONTROL => self.dispatch_control(event),
            other => log::debug!("ignoring event {} of unknown kind {other}", event.id),
        }
    }

    fn dispatch_direct(&mut self, event: Event) {
        if event.recipient() != Some(self.identity.public_key_hex()) {
            return;
        }
        let Ok(sender_pk) = parse_pubkey(&event.pubkey) else {
            return;
        };
        let seed = self.identity.seed_bytes();
        let plain = match direct::decrypt(&seed, &sender_pk, &event.content) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("direct event {} from {} failed to open: {e}", event.id, event.pubkey);
                return;
            }
        };

        let record = serde_json::json!({
            "id": event.id,
            "from": event.pubkey,
            "kind": "direct",
            "content": String::from_utf8_lossy(&plain),
            "received_at": now_secs(),
        });
        if let Err(e) = ipc::append_message(&self.paths, &record) {
            log::error!("cannot journal inbound message: {e}");
        }
    }

    fn dispatch_group(&mut self, event: Event) {
        let Some(group_id) = event.group_id().map(str::to_string) else {
            return;
        };
        let Some(payload) = self.open_group_payload(&group_id, &event) else {
            return;
        };
        let GroupPayload::Msg { content } = payload else {
            return;
        };

        self.groups.touch_member(&group_id, &event.pubkey);

        let record = serde_json::json!({
            "id": event.id,
            "from": event.pubkey,
            "kind": "group",
            "group_id": group_id,
            "content": content,
            "received_at": now_secs(),
        });
        if let Err(e) = ipc::append_message(&self.paths, &record) {
            log::error!("cannot journal inbound message: {e}");
        }
        if let Err(e) = self.groups.append_history(&group_id, &record) {
            log::error!("cannot append group history: {e}");
        }
    }

    fn dispatch_control(&mut self, event: Event) {
        let Some(group_id) = event.group_id().map(str::to_string) else {
            return;
        };
        let Some(payload) = self.open_group_payload(&group_id, &event) else {
            return;
        };
        let GroupPayload::Ctrl { op } = payload else {
            return;
        };

        match self.groups.apply_control(&group_id, &event.pubkey, &op) {
            Ok(true) => {
                self.groups.touch_member(&group_id, &event.pubkey);
                if let Err(e) = self.groups.persist(&self.custodian) {
                    log::error!("cannot persist group state: {e}");
                }
                log::info!("applied control {op:?} from {} in {group_id}", event.pubkey);
            }
            Ok(false) => {
                log::debug!("ignored control {op:?} from {} in {group_id}", event.pubkey)
            }
            Err(e) => log::warn!("control event {} rejected: {e}", event.id),
        }
    }

    fn open_group_payload(&self, group_id: &str, event: &Event) -> Option<GroupPayload> {
        let topic = match self.groups.get(group_id) {
            Ok(group) => group.topic.clone(),
            Err(_) => return None,
        };
        let plain = match group_crypto::decrypt(&topic, &event.content) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("group event {} failed to open: {e}", event.id);
                return None;
            }
        };
        match serde_json::from_slice(&plain) {
            Ok(payload) => Some(payload),
            Err(e) => {
                log::warn!("group event {} carried malformed payload: {e}", event.id);
                None
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    pub(crate) async fn handle_command(&mut self, command: Command) -> Result<Value> {
        match command {
            Command::Send { to, content } => {
                parse_pubkey(&to)?;
                let message_id = self.queue.enqueue(MessageKind::Direct, to, content)?;
                Ok(serde_json::json!({ "message_id": message_id, "queued": true }))
            }

            Command::SendGroup { group_id, content } => {
                let me = self.identity.public_key_hex().to_string();
                self.groups.can_send(&group_id, &me)?;
                let payload = serde_json::to_string(&GroupPayload::Msg {
                    content: content.clone(),
                })?;
                let message_id =
                    self.queue.enqueue(MessageKind::Group, group_id.clone(), payload)?;
                let record = serde_json::json!({
                    "id": message_id.clone(),
                    "from": me,
                    "kind": "group",
                    "group_id": group_id.clone(),
                    "content": content,
                    "received_at": now_secs(),
                });
                if let Err(e) = self.groups.append_history(&group_id, &record) {
                    log::error!("cannot append group history: {e}");
                }
                Ok(serde_json::json!({ "message_id": message_id, "queued": true }))
            }

            Command::CreateGroup { name } => {
                let me = self.identity.public_key_hex().to_string();
                let (group_id, topic) = self.groups.create_group(&name, &me)?;
                self.groups.persist(&self.custodian)?;
                self.subscribe_group(&group_id).await;
                Ok(serde_json::json!({ "group_id": group_id, "topic": topic }))
            }

            Command::JoinGroup { group_id, topic } => {
                let me = self.identity.public_key_hex().to_string();
                self.groups.join_group(&group_id, &topic, &me)?;
                self.groups.persist(&self.custodian)?;
                self.subscribe_group(&group_id).await;
                self.emit_control(&group_id, GroupControlOp::Join)?;
                Ok(serde_json::json!({ "group_id": group_id, "joined": true }))
            }

            Command::LeaveGroup { group_id } => {
                // The leave announcement must go out while the topic is
                // still known; it is published once, best effort.
                self.groups.get(&group_id)?;
                if let Err(e) = self
                    .publish_control_now(&group_id, GroupControlOp::Leave)
                    .await
                {
                    log::warn!("leave announcement for {group_id} not delivered: {e}");
                }
                self.groups.leave_group(&group_id)?;
                self.groups.persist(&self.custodian)?;
                Ok(serde_json::json!({ "group_id": group_id, "left": true }))
            }

            Command::ListGroups => {
                let me = self.identity.public_key_hex();
                let groups: Vec<Value> = self
                    .groups
                    .list_groups()
                    .iter()
                    .map(|g| {
                        serde_json::json!({
                            "group_id": g.group_id,
                            "name": g.name,
                            "owner": g.owner,
                            "members": g.members.len(),
                            "is_owner": g.owner == me,
                            "created_at": g.created_at,
                        })
                    })
                    .collect();
                Ok(serde_json::json!({ "groups": groups }))
            }

            Command::Kick { group_id, target } => {
                let me = self.identity.public_key_hex().to_string();
                let op = self.groups.kick(&group_id, &me, &target)?;
                self.groups.persist(&self.custodian)?;
                self.emit_control(&group_id, op)?;
                Ok(serde_json::json!({ "group_id": group_id, "kicked": target }))
            }

            Command::Ban { group_id, target } => {
                let me = self.identity.public_key_hex().to_string();
                let op = self.groups.ban(&group_id, &me, &target)?;
                self.groups.persist(&self.custodian)?;
                self.emit_control(&group_id, op)?;
                Ok(serde_json::json!({ "group_id": group_id, "banned": target }))
            }

            Command::Mute { group_id, target, duration_s } => {
                let me = self.identity.public_key_hex().to_string();
                let op = self
                    .groups
                    .mute(&group_id, &me, &target, Duration::from_secs(duration_s))?;
                self.groups.persist(&self.custodian)?;
                self.emit_control(&group_id, op)?;
                Ok(serde_json::json!({
                    "group_id": group_id,
                    "muted": target,
                    "duration_s": duration_s,
                }))
            }

            Command::SetAdmin { group_id, target, admin } => {
                let me = self.identity.public_key_hex().to_string();
                let op = self.groups.set_admin(&group_id, &me, &target, admin)?;
                self.groups.persist(&self.custodian)?;
                self.emit_control(&group_id, op)?;
                Ok(serde_json::json!({
                    "group_id": group_id,
                    "target": target,
                    "admin": admin,
                }))
            }

            Command::Transfer { group_id, new_owner } => {
                let me = self.identity.public_key_hex().to_string();
                let op = self.groups.transfer_ownership(&group_id, &me, &new_owner)?;
                self.groups.persist(&self.custodian)?;
                self.emit_control(&group_id, op)?;
                Ok(serde_json::json!({ "group_id": group_id, "owner": new_owner }))
            }

            Command::Status => Ok(serde_json::json!({
                "pubkey": self.identity.public_key_hex(),
                "agent_name": self.cfg.agent_name,
                "pid": std::process::id(),
                "started_at": self.started_at,
                "queue": self.queue.status(),
                "relays": self.pool.stats(),
                "groups": self.groups.list_groups().len(),
            })),

            Command::Recv { clear } => {
                let messages =
                    ipc::read_messages(&self.paths, clear, self.cfg.max_messages_keep)?;
                Ok(serde_json::json!({
                    "count": messages.len(),
                    "messages": messages,
                }))
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Open the stream for one newly known group; the inbox subscription
    /// from startup stays as is.
    async fn subscribe_group(&mut self, group_id: &str) {
        self.pool
            .subscribe(Subscription {
                recipient: None,
                group_ids: vec![group_id.to_string()],
            })
            .await;
    }

    /// Queue a signed control event for reliable delivery.
    fn emit_control(&mut self, group_id: &str, op: GroupControlOp) -> Result<()> {
        let payload = serde_json::to_string(&GroupPayload::Ctrl { op })?;
        self.queue
            .enqueue(MessageKind::Group, group_id.to_string(), payload)?;
        Ok(())
    }

    /// Publish a control event immediately, bypassing the queue.
    async fn publish_control_now(&mut self, group_id: &str, op: GroupControlOp) -> Result<()> {
        let topic = self.groups.get(group_id)?.topic.clone();
        let payload = serde_json::to_string(&GroupPayload::Ctrl { op })?;
        let frame = group_crypto::encrypt(&topic, payload.as_bytes())
            .map_err(|e| AgentError::wrap(ErrorCode::InternalError, e))?;
        let event = Event::build(
            &self.identity,
            kind::GROUP_CONTROL,
            vec![vec!["g".into(), group_id.to_string()]],
            frame,
        );
        self.pool.publish(&event).await
    }

    /// Seal one queue entry into its wire event.
    fn build_event(&self, msg: &QueuedMessage) -> Result<Event> {
        match msg.kind {
            MessageKind::Direct => {
                let recipient = parse_pubkey(&msg.target)?;
                let seed = self.identity.seed_bytes();
                let frame = direct::encrypt(&seed, &recipient, msg.content.as_bytes())
                    .map_err(|e| AgentError::wrap(ErrorCode::InternalError, e))?;
                Ok(Event::build(
                    &self.identity,
                    kind::DIRECT,
                    vec![vec!["p".into(), msg.target.clone()]],
                    frame,
                ))
            }
            MessageKind::Group => {
                let topic = self.groups.get(&msg.target)?.topic.clone();
                let payload: GroupPayload = serde_json::from_str(&msg.content)?;
                let wire_kind = match payload {
                    GroupPayload::Msg { .. } => kind::GROUP,
                    GroupPayload::Ctrl { .. } => kind::GROUP_CONTROL,
                };
                let frame = group_crypto::encrypt(&topic, msg.content.as_bytes())
                    .map_err(|e| AgentError::wrap(ErrorCode::InternalError, e))?;
                Ok(Event::build(
                    &self.identity,
                    wire_kind,
                    vec![vec!["g".into(), msg.target.clone()]],
                    frame,
                ))
            }
        }
    }

    async fn shutdown(&mut self) {
        // One bounded final drain so queued messages get their last chance.
        let deadline = self.cfg.start_timeout;
        if tokio::time::timeout(deadline, self.queue_tick()).await.is_err() {
            log::warn!("final queue drain timed out");
        }

        if let Err(e) = self.queue.compact() {
            log::error!("queue flush failed: {e}");
        }
        if let Err(e) = self.groups.persist(&self.custodian) {
            log::error!("group flush failed: {e}");
        }
        let _ = self.pool.persist_stats();

        let health = Health {
            running: false,
            pid: std::process::id(),
            agent_name: self.cfg.agent_name.clone(),
            started_at: self.started_at,
            queue_status: self.queue.status(),
            relay_stats: self.pool.stats(),
        };
        let _ = ipc::write_health(&self.paths, &health);

        if !self.cfg.ephemeral {
            ipc::remove_pid(&self.paths);
        }
        log::info!("service stopped");
    }
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
    use crate::relay::loopback::LoopbackRelay;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config {
            data_dir: dir.path().to_path_buf(),
            relays: vec!["wss://loop".into()],
            ..Config::default()
        }
    }

    async fn service_on(
        dir: &tempfile::TempDir,
        relays: Vec<Arc<dyn RelayTransport>>,
    ) -> Service {
        Service::start(test_config(dir), relays).await.unwrap()
    }

    #[tokio::test]
    async fn start_claims_pid_and_rejects_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let relay = LoopbackRelay::new("wss://loop");
        let service = service_on(&dir, vec![relay.clone() as Arc<dyn RelayTransport>]).await;

        assert_eq!(
            ipc::read_pid(&service.paths),
            Some(std::process::id())
        );

        let err = Service::start(
            test_config(&dir),
            vec![relay as Arc<dyn RelayTransport>],
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ServiceAlreadyRunning);
    }

    #[tokio::test]
    async fn ephemeral_mode_skips_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let relay = LoopbackRelay::new("wss://loop");
        let cfg = Config { ephemeral: true, ..test_config(&dir) };
        let service = Service::start(cfg, vec![relay as Arc<dyn RelayTransport>])
            .await
            .unwrap();
        assert!(ipc::read_pid(&service.paths).is_none());
    }

    #[tokio::test]
    async fn identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let pubkey;
        {
            let relay = LoopbackRelay::new("wss://loop");
            let mut service =
                service_on(&dir, vec![relay as Arc<dyn RelayTransport>]).await;
            pubkey = service.public_key_hex().to_string();
            service.shutdown().await;
        }
        let relay = LoopbackRelay::new("wss://loop");
        let service = service_on(&dir, vec![relay as Arc<dyn RelayTransport>]).await;
        assert_eq!(service.public_key_hex(), pubkey);
    }

    #[tokio::test]
    async fn send_to_invalid_pubkey_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let relay = LoopbackRelay::new("wss://loop");
        let mut service = service_on(&dir, vec![relay as Arc<dyn RelayTransport>]).await;

        let err = service
            .handle_command(Command::Send { to: "abc".into(), content: "hi".into() })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPubkey);
        // Validation failures leave no state behind.
        assert_eq!(service.queue.status().total, 0);
    }

    #[tokio::test]
    async fn command_tick_correlates_results_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let relay = LoopbackRelay::new("wss://loop");
        let mut service = service_on(&dir, vec![relay as Arc<dyn RelayTransport>]).await;

        append_line(
            &service.paths.commands(),
            &serde_json::json!({"id": "c1", "cmd": "create_group", "name": "Team"}),
        )
        .unwrap();
        append_line(
            &service.paths.commands(),
            &serde_json::json!({"id": "c2", "cmd": "warp_drive"}),
        )
        .unwrap();
        service.command_tick().await;

        let ok = ipc::find_result(&service.paths, "c1").unwrap().unwrap();
        assert_eq!(ok["ok"], true);
        assert_eq!(ok["group_id"].as_str().unwrap().len(), 32);
        assert_eq!(ok["topic"].as_str().unwrap().len(), 64);

        let fail = ipc::find_result(&service.paths, "c2").unwrap().unwrap();
        assert_eq!(fail["ok"], false);
        assert_eq!(fail["error"]["code_key"], "UNKNOWN_COMMAND");
    }

    #[tokio::test]
    async fn direct_message_end_to_end() {
        let relay = LoopbackRelay::new("wss://loop");

        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut alice =
            service_on(&dir_a, vec![relay.clone() as Arc<dyn RelayTransport>]).await;
        let mut bob =
            service_on(&dir_b, vec![relay.clone() as Arc<dyn RelayTransport>]).await;
        let mut bob_rx = bob.event_rx.take().unwrap();

        alice
            .handle_command(Command::Send {
                to: bob.public_key_hex().to_string(),
                content: "hello bob".into(),
            })
            .await
            .unwrap();
        alice.queue_tick().await;
        assert_eq!(alice.queue.status().total, 0);

        let delivery = bob_rx.recv().await.unwrap();
        let event = bob.pool.admit(delivery).unwrap();
        assert_eq!(event.kind, kind::DIRECT);
        bob.dispatch_inbound(event);

        let inbox = ipc::read_messages(&bob.paths, false, 1_000).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0]["content"], "hello bob");
        assert_eq!(inbox[0]["from"], alice.public_key_hex());
        assert_eq!(inbox[0]["kind"], "direct");
    }

    #[tokio::test]
    async fn group_flow_end_to_end() {
        let relay = LoopbackRelay::new("wss://loop");

        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut alice =
            service_on(&dir_a, vec![relay.clone() as Arc<dyn RelayTransport>]).await;
        let mut bob =
            service_on(&dir_b, vec![relay.clone() as Arc<dyn RelayTransport>]).await;
        let mut alice_rx = alice.event_rx.take().unwrap();
        let mut bob_rx = bob.event_rx.take().unwrap();

        // Alice creates; Bob joins with the shared topic.
        let created = alice
            .handle_command(Command::CreateGroup { name: "Team".into() })
            .await
            .unwrap();
        let group_id = created["group_id"].as_str().unwrap().to_string();
        let topic = created["topic"].as_str().unwrap().to_string();

        bob.handle_command(Command::JoinGroup {
            group_id: group_id.clone(),
            topic: topic.clone(),
        })
        .await
        .unwrap();
        bob.queue_tick().await; // publishes the join control event

        // Alice applies Bob's join and now sees two members.
        let delivery = alice_rx.recv().await.unwrap();
        let event = alice.pool.admit(delivery).unwrap();
        assert_eq!(event.kind, kind::GROUP_CONTROL);
        alice.dispatch_inbound(event);
        assert_eq!(alice.groups.get_members(&group_id).unwrap().len(), 2);

        // Alice posts; Bob reads it from his inbound journal.
        alice
            .handle_command(Command::SendGroup {
                group_id: group_id.clone(),
                content: "standup in 5".into(),
            })
            .await
            .unwrap();
        alice.queue_tick().await;

        // Bob's own join control echoes back first; the message follows.
        let event = loop {
            let delivery = bob_rx.recv().await.unwrap();
            if let Some(ev) = bob.pool.admit(delivery) {
                if ev.pubkey != bob.public_key_hex() {
                    break ev;
                }
            }
        };
        assert_eq!(event.kind, kind::GROUP);
        bob.dispatch_inbound(event);

        let recv = bob
            .handle_command(Command::Recv { clear: true })
            .await
            .unwrap();
        assert_eq!(recv["count"], 1);
        assert_eq!(recv["messages"][0]["content"], "standup in 5");
        assert_eq!(recv["messages"][0]["group_id"], group_id);

        // A second recv after clear is empty.
        let recv = bob
            .handle_command(Command::Recv { clear: false })
            .await
            .unwrap();
        assert_eq!(recv["count"], 0);
    }

    #[tokio::test]
    async fn moderation_commands_enforce_roles() {
        let relay = LoopbackRelay::new("wss://loop");
        let dir = tempfile::tempdir().unwrap();
        let mut service =
            service_on(&dir, vec![relay as Arc<dyn RelayTransport>]).await;

        let created = service
            .handle_command(Command::CreateGroup { name: "Mods".into() })
            .await
            .unwrap();
        let group_id = created["group_id"].as_str().unwrap().to_string();
        let topic = created["topic"].as_str().unwrap().to_string();

        let peer = "c".repeat(64);
        service
            .groups
            .join_group(&group_id, &topic, &peer)
            .unwrap();

        service
            .handle_command(Command::Ban { group_id: group_id.clone(), target: peer.clone() })
            .await
            .unwrap();
        let err = service
            .groups
            .can_send(&group_id, &peer)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MemberBanned);

        // The ban control event is queued for the rest of the group.
        assert_eq!(service.queue.status().total, 1);
    }

    #[tokio::test]
    async fn status_reports_queue_and_relays() {
        let relay = LoopbackRelay::new("wss://loop");
        let dir = tempfile::tempdir().unwrap();
        let mut service =
            service_on(&dir, vec![relay as Arc<dyn RelayTransport>]).await;

        let status = service.handle_command(Command::Status).await.unwrap();
        assert_eq!(status["pubkey"], service.public_key_hex());
        assert_eq!(status["queue"]["total"], 0);
        assert_eq!(status["relays"][0]["url"], "wss://loop");
    }

    #[tokio::test]
    async fn failed_publish_backs_off_for_retry() {
        let relay = LoopbackRelay::new("wss://loop");
        relay.set_failing(true).await;
        let dir = tempfile::tempdir().unwrap();
        let mut service =
            service_on(&dir, vec![relay.clone() as Arc<dyn RelayTransport>]).await;

        let result = service
            .handle_command(Command::Send {
                to: "a".repeat(64),
                content: "doomed".into(),
            })
            .await
            .unwrap();
        assert_eq!(result["queued"], true);

        service.queue_tick().await;
        let status = service.queue.status();
        assert_eq!(status.total, 1);
        assert_eq!(status.pending, 0); // backing off after the failure

        let stats = service.pool.stats();
        assert_eq!(stats[0].publishes_fail, 1);
        assert!(stats[0].last_error.is_some());
    }

    #[tokio::test]
    async fn health_tick_writes_heartbeat() {
        let relay = LoopbackRelay::new("wss://loop");
        let dir = tempfile::tempdir().unwrap();
        let mut service =
            service_on(&dir, vec![relay as Arc<dyn RelayTransport>]).await;

        service.health_tick();
        let health = ipc::read_health(&service.paths).unwrap();
        assert!(health.running);
        assert_eq!(health.pid, std::process::id());
        assert_eq!(health.relay_stats.len(), 1);
    }
}
