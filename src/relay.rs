//! Relay pool — N untrusted event stores behind one publish/subscribe face.
//!
//! Publishes fan out to every healthy relay and succeed when at least one
//! acknowledges inside the per-call deadline. Subscription deliveries from
//! all relays funnel through one bounded channel (backpressure pauses the
//! transports) and are deduplicated before they reach the service loop.
//! Per-relay health statistics persist across restarts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::dedup::DedupCache;
use crate::error::{AgentError, ErrorCode, Result};
use crate::event::{Event, Subscription};
use crate::paths::{write_atomic, DataDir};

/// Capacity of the single-consumer delivery channel.
const DELIVERY_CHANNEL_CAPACITY: usize = 256;

/// Longest reconnect backoff a failing relay can accrue.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

// ─── Transport abstraction ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// One event delivered by one relay.
#[derive(Debug, Clone)]
pub struct RelayDelivery {
    pub relay_url: String,
    pub event: Event,
}

/// The wire transport the pool drives. Implementations run their own I/O
/// tasks; the only path back into the pool is the delivery channel handed to
/// `subscribe`.
pub trait RelayTransport: Send + Sync {
    fn url(&self) -> &str;

    /// Publish one event and wait for the relay's acknowledgement.
    fn publish(&self, event: Event) -> BoxFuture<'_, std::result::Result<(), TransportError>>;

    /// Open a long-lived subscription. Matching events are pushed into `tx`
    /// until the channel closes.
    fn subscribe(
        &self,
        sub: Subscription,
        tx: mpsc::Sender<RelayDelivery>,
    ) -> BoxFuture<'_, std::result::Result<(), TransportError>>;
}

// ─── Per-relay statistics ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStats {
    pub url: String,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub publishes_ok: u64,
    pub publishes_fail: u64,
    pub subs_delivered: u64,
    pub reconnect_backoff_until: u64,
    /// Consecutive publish failures; resets on any success.
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl RelayStats {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            connected: false,
            last_error: None,
            publishes_ok: 0,
            publishes_fail: 0,
            subs_delivered: 0,
            reconnect_backoff_until: 0,
            consecutive_failures: 0,
        }
    }
}

// ─── Pool ─────────────────────────────────────────────────────────────────────

pub struct PoolConfig {
    pub publish_timeout: Duration,
    pub dedup_cache_size: usize,
    pub unhealthy_after_failures: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_millis(800),
            dedup_cache_size: 500,
            unhealthy_after_failures: 5,
        }
    }
}

pub struct RelayPool {
    relays: Vec<Arc<dyn RelayTransport>>,
    stats: HashMap<String, RelayStats>,
    dedup: DedupCache,
    cfg: PoolConfig,
    stats_path: PathBuf,
    event_tx: mpsc::Sender<RelayDelivery>,
}

impl RelayPool {
    /// Build the pool over `relays`, restoring persisted stats when present.
    /// The returned receiver is the single consumer of every subscription
    /// delivery; feed what it yields through [`RelayPool::admit`].
    pub fn new(
        paths: &DataDir,
        cfg: PoolConfig,
        relays: Vec<Arc<dyn RelayTransport>>,
    ) -> Result<(Self, mpsc::Receiver<RelayDelivery>)> {
        let stats_path = paths.relay_stats();
        paths.guard_inside(&stats_path)?;

        let mut stats: HashMap<String, RelayStats> = HashMap::new();
        if stats_path.exists() {
            let raw = std::fs::read_to_string(&stats_path)?;
            match serde_json::from_str::<Vec<RelayStats>>(&raw) {
                Ok(list) => {
                    for entry in list {
                        stats.insert(entry.url.clone(), entry);
                    }
                }
                Err(e) => log::warn!("ignoring corrupt relay stats file: {e}"),
            }
        }
        for relay in &relays {
            stats
                .entry(relay.url().to_string())
                .or_insert_with(|| RelayStats::new(relay.url()));
        }

        let (event_tx, event_rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        let dedup = DedupCache::new(cfg.dedup_cache_size);

        Ok((
            Self {
                relays,
                stats,
                dedup,
                cfg,
                stats_path,
                event_tx,
            },
            event_rx,
        ))
    }

    /// Install `sub` on every relay. A relay that refuses the subscription
    /// is recorded but does not fail the call.
    pub async fn subscribe(&mut self, sub: Subscription) {
        let relays = self.relays.clone();
        for relay in &relays {
            let result = relay.subscribe(sub.clone(), self.event_tx.clone()).await;
            let entry = self.stat_mut(relay.url());
            match result {
                Ok(()) => entry.connected = true,
                Err(e) => {
                    entry.connected = false;
                    entry.last_error = Some(e.to_string());
                    log::warn!("relay {} refused subscription: {e}", relay.url());
                }
            }
        }
    }

    /// Fan one event out across the pool. Ok iff at least one relay acks
    /// within the deadline.
    pub async fn publish(&mut self, event: &Event) -> Result<()> {
        let timeout = self.cfg.publish_timeout;
        let now = now_millis();

        let mut targets: Vec<Arc<dyn RelayTransport>> = self
            .relays
            .iter()
            .filter(|r| self.is_healthy(r.url(), now))
            .cloned()
            .collect();
        // Never give up on the pool: with every relay backing off, try them
        // all anyway rather than fail without an attempt.
        if targets.is_empty() {
            targets = self.relays.clone();
        }

        let attempts = targets.iter().map(|relay| {
            let relay = relay.clone();
            let ev = event.clone();
            async move {
                let outcome = match tokio::time::timeout(timeout, relay.publish(ev)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("publish timed out".to_string()),
                };
                (relay.url().to_string(), outcome)
            }
        });

        let mut accepted = 0usize;
        for (url, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => {
                    accepted += 1;
                    self.record_publish_ok(&url);
                }
                Err(e) => self.record_publish_failure(&url, &e),
            }
        }

        if accepted > 0 {
            log::debug!("event {} accepted by {accepted} relay(s)", event.id);
            Ok(())
        } else {
            Err(AgentError::new(
                ErrorCode::RelayAllFailed,
                format!("no relay accepted event {}", event.id),
            ))
        }
    }

    /// Gate one delivery: count it against the relay's stats, verify the
    /// signature and suppress anything already seen. Returns the event only
    /// on its first valid sighting.
    pub fn admit(&mut self, delivery: RelayDelivery) -> Option<Event> {
        self.stat_mut(&delivery.relay_url).subs_delivered += 1;

        if !delivery.event.verify() {
            log::warn!(
                "{}: dropping event {} from {}",
                ErrorCode::InvalidSignature.key(),
                delivery.event.id,
                delivery.relay_url
            );
            return None;
        }
        if !self.dedup.insert(&delivery.event.id) {
            log::debug!("suppressed duplicate event {}", delivery.event.id);
            return None;
        }
        Some(delivery.event)
    }

    pub fn stats(&self) -> Vec<RelayStats> {
        let mut list: Vec<RelayStats> = self.stats.values().cloned().collect();
        list.sort_by(|a, b| a.url.cmp(&b.url));
        list
    }

    /// Persist stats so reconnection policy survives restarts.
    pub fn persist_stats(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.stats())?;
        write_atomic(&self.stats_path, json.as_bytes())
    }

    fn is_healthy(&self, url: &str, now: u64) -> bool {
        match self.stats.get(url) {
            Some(s) => {
                s.reconnect_backoff_until <= now
                    && s.consecutive_failures < self.cfg.unhealthy_after_failures
            }
            None => true,
        }
    }

    fn record_publish_ok(&mut self, url: &str) {
        let entry = self.stat_mut(url);
        entry.publishes_ok += 1;
        entry.connected = true;
        entry.last_error = None;
        entry.consecutive_failures = 0;
        entry.reconnect_backoff_until = 0;
    }

    fn record_publish_failure(&mut self, url: &str, error: &str) {
        let entry = self.stat_mut(url);
        entry.publishes_fail += 1;
        entry.connected = false;
        entry.last_error = Some(error.to_string());
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        let backoff = Duration::from_secs(1 << entry.consecutive_failures.min(5));
        let backoff = backoff.min(MAX_BACKOFF);
        entry.reconnect_backoff_until = now_millis() + backoff.as_millis() as u64;
        log::warn!("relay {url} publish failed ({error}); backing off {backoff:?}");
    }

    fn stat_mut(&mut self, url: &str) -> &mut RelayStats {
        self.stats
            .entry(url.to_string())
            .or_insert_with(|| RelayStats::new(url))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ─── In-memory transport ──────────────────────────────────────────────────────

/// Loopback relay: an in-process event store used by tests and local runs.
/// Behaves like a real relay — stores events, fans them out to matching
/// subscriptions, and can be told to fail publishes.
pub mod loopback {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        subscriptions: Vec<(Subscription, mpsc::Sender<RelayDelivery>)>,
        stored: Vec<Event>,
        failing: bool,
    }

    pub struct LoopbackRelay {
        url: String,
        inner: Arc<Mutex<Inner>>,
    }

    impl LoopbackRelay {
        pub fn new(url: impl Into<String>) -> Arc<Self> {
            Arc::new(Self {
                url: url.into(),
                inner: Arc::new(Mutex::new(Inner::default())),
            })
        }

        /// Make subsequent publishes fail, as an unreachable relay would.
        pub async fn set_failing(&self, failing: bool) {
            self.inner.lock().await.failing = failing;
        }

        /// Deliver an event as if a remote peer had published it here.
        pub async fn inject(&self, event: Event) {
            let inner = self.inner.lock().await;
            for (sub, tx) in &inner.subscriptions {
                if sub.matches(&event) {
                    let _ = tx
                        .send(RelayDelivery {
                            relay_url: self.url.clone(),
                            event: event.clone(),
                        })
                        .await;
                }
            }
        }

        pub async fn stored_events(&self) -> Vec<Event> {
            self.inner.lock().await.stored.clone()
        }
    }

    impl RelayTransport for LoopbackRelay {
        fn url(&self) -> &str {
            &self.url
        }

        fn publish(&self, event: Event) -> BoxFuture<'_, std::result::Result<(), TransportError>> {
            Box::pin(async move {
                let mut inner = self.inner.lock().await;
                if inner.failing {
                    return Err(TransportError("connection refused".into()));
                }
                inner.stored.push(event.clone());
                let subs = inner.subscriptions.clone();
                drop(inner);
                for (sub, tx) in subs {
                    if sub.matches(&event) {
                        let _ = tx
                            .send(RelayDelivery {
                                relay_url: self.url.clone(),
                                event: event.clone(),
                            })
                            .await;
                    }
                }
                Ok(())
            })
        }

        fn subscribe(
            &self,
            sub: Subscription,
            tx: mpsc::Sender<RelayDelivery>,
        ) -> BoxFuture<'_, std::result::Result<(), TransportError>> {
            Box::pin(async move {
                self.inner.lock().await.subscriptions.push((sub, tx));
                Ok(())
            })
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::loopback::LoopbackRelay;
    use super::*;
    use crate::event::kind;
    use crate::identity::Identity;
    use crate::storage_key::StorageKeyCustodian;

    fn identity(dir: &tempfile::TempDir) -> Identity {
        let paths = DataDir::new(dir.path());
        paths.ensure().unwrap();
        let custodian = StorageKeyCustodian::new(paths.clone(), Duration::from_secs(3600));
        Identity::load_or_create(&paths, &custodian).unwrap()
    }

    fn pool_with(
        dir: &tempfile::TempDir,
        relays: Vec<Arc<dyn RelayTransport>>,
    ) -> (RelayPool, mpsc::Receiver<RelayDelivery>) {
        let paths = DataDir::new(dir.path());
        paths.ensure().unwrap();
        RelayPool::new(&paths, PoolConfig::default(), relays).unwrap()
    }

    fn direct_event(id: &Identity, to: &str) -> Event {
        Event::build(
            id,
            kind::DIRECT,
            vec![vec!["p".into(), to.into()]],
            "ct?iv=iv".into(),
        )
    }

    #[tokio::test]
    async fn publish_succeeds_when_one_relay_acks() {
        let dir = tempfile::tempdir().unwrap();
        let id = identity(&dir);

        let good = LoopbackRelay::new("wss://good");
        let bad = LoopbackRelay::new("wss://bad");
        bad.set_failing(true).await;

        let (mut pool, _rx) = pool_with(
            &dir,
            vec![good.clone() as Arc<dyn RelayTransport>, bad.clone()],
        );
        let event = direct_event(&id, &"a".repeat(64));
        pool.publish(&event).await.unwrap();

        let stats = pool.stats();
        let good_stats = stats.iter().find(|s| s.url == "wss://good").unwrap();
        let bad_stats = stats.iter().find(|s| s.url == "wss://bad").unwrap();
        assert_eq!(good_stats.publishes_ok, 1);
        assert_eq!(bad_stats.publishes_fail, 1);
        assert!(bad_stats.reconnect_backoff_until > 0);
    }

    #[tokio::test]
    async fn publish_fails_when_all_relays_fail() {
        let dir = tempfile::tempdir().unwrap();
        let id = identity(&dir);

        let r1 = LoopbackRelay::new("wss://one");
        let r2 = LoopbackRelay::new("wss://two");
        r1.set_failing(true).await;
        r2.set_failing(true).await;

        let (mut pool, _rx) = pool_with(&dir, vec![r1 as Arc<dyn RelayTransport>, r2]);
        let err = pool.publish(&direct_event(&id, &"a".repeat(64))).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RelayAllFailed);
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn duplicate_delivery_is_dispatched_once() {
        let dir = tempfile::tempdir().unwrap();
        let id = identity(&dir);
        let me = "b".repeat(64);

        let r1 = LoopbackRelay::new("wss://one");
        let r2 = LoopbackRelay::new("wss://two");
        let (mut pool, mut rx) = pool_with(
            &dir,
            vec![r1.clone() as Arc<dyn RelayTransport>, r2.clone()],
        );

        pool.subscribe(Subscription {
            recipient: Some(me.clone()),
            group_ids: vec![],
        })
        .await;

        // The same event arrives from both relays.
        let event = direct_event(&id, &me);
        r1.inject(event.clone()).await;
        r2.inject(event.clone()).await;

        let first = pool.admit(rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.id, event.id);
        assert!(pool.admit(rx.recv().await.unwrap()).is_none());

        // Both deliveries are still visible in the stats.
        let delivered: u64 = pool.stats().iter().map(|s| s.subs_delivered).sum();
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn forged_events_never_reach_the_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let id = identity(&dir);
        let me = "b".repeat(64);

        let relay = LoopbackRelay::new("wss://one");
        let (mut pool, mut rx) =
            pool_with(&dir, vec![relay.clone() as Arc<dyn RelayTransport>]);
        pool.subscribe(Subscription {
            recipient: Some(me.clone()),
            group_ids: vec![],
        })
        .await;

        let mut forged = direct_event(&id, &me);
        forged.content = "tampered".into();
        relay.inject(forged).await;

        assert!(pool.admit(rx.recv().await.unwrap()).is_none());
    }

    #[tokio::test]
    async fn failing_relay_is_deprioritized_but_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let id = identity(&dir);

        let flaky = LoopbackRelay::new("wss://flaky");
        let steady = LoopbackRelay::new("wss://steady");
        flaky.set_failing(true).await;

        let (mut pool, _rx) = pool_with(
            &dir,
            vec![flaky.clone() as Arc<dyn RelayTransport>, steady.clone()],
        );
        let event = direct_event(&id, &"a".repeat(64));
        pool.publish(&event).await.unwrap();

        // Backed off: the next publish skips the flaky relay entirely.
        flaky.set_failing(false).await;
        pool.publish(&direct_event(&id, &"a".repeat(64))).await.unwrap();
        assert_eq!(pool.stats().iter().find(|s| s.url == "wss://flaky").unwrap().publishes_fail, 1);

        // It is never removed: clear the backoff and it participates again.
        pool.stat_mut("wss://flaky").reconnect_backoff_until = 0;
        pool.stat_mut("wss://flaky").consecutive_failures = 0;
        pool.publish(&direct_event(&id, &"a".repeat(64))).await.unwrap();
        assert_eq!(pool.stats().iter().find(|s| s.url == "wss://flaky").unwrap().publishes_ok, 1);
    }

    #[tokio::test]
    async fn stats_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let id = identity(&dir);
        let paths = DataDir::new(dir.path());

        {
            let relay = LoopbackRelay::new("wss://one");
            let (mut pool, _rx) = pool_with(&dir, vec![relay as Arc<dyn RelayTransport>]);
            pool.publish(&direct_event(&id, &"a".repeat(64))).await.unwrap();
            pool.persist_stats().unwrap();
        }

        let (pool, _rx) = RelayPool::new(
            &paths,
            PoolConfig::default(),
            vec![LoopbackRelay::new("wss://one") as Arc<dyn RelayTransport>],
        )
        .unwrap();
        assert_eq!(pool.stats()[0].publishes_ok, 1);
    }
}
