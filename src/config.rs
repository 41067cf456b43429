//! Runtime configuration resolved from the environment.
//!
//! Every knob has a production default; the environment variables below are
//! the container deployment contract.

use std::path::PathBuf;
use std::time::Duration;

/// Relays used when `AGENT_PULSE_RELAYS` is unset.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://relay.nostr.band",
    "wss://nos.lol",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Test,
    Development,
}

impl Environment {
    fn from_str(s: &str) -> Self {
        match s {
            "test" => Environment::Test,
            "development" => Environment::Development,
            _ => Environment::Production,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub relays: Vec<String>,
    pub agent_name: String,
    /// Disposable data directory: PID persistence is skipped.
    pub ephemeral: bool,
    pub environment: Environment,

    pub message_ttl: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_factor: u32,
    pub max_queue_size: usize,
    pub dedup_cache_size: usize,
    pub max_messages_keep: usize,
    pub group_history_limit: usize,
    pub cmd_poll_interval: Duration,
    pub health_update_interval: Duration,
    pub start_timeout: Duration,
    pub key_rotation_interval: Duration,
    /// Deadline for one publish fan-out across the relay pool. Chosen so a
    /// queue tick with up to 8 relays finishes inside one second.
    pub publish_timeout: Duration,
    /// Consecutive publish failures after which a relay is deprioritized.
    pub unhealthy_after_failures: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            relays: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            agent_name: String::new(),
            ephemeral: false,
            environment: Environment::Production,
            message_ttl: Duration::from_secs(24 * 60 * 60),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_factor: 2,
            max_queue_size: 10_000,
            dedup_cache_size: 500,
            max_messages_keep: 1_000,
            group_history_limit: 100,
            cmd_poll_interval: Duration::from_millis(500),
            health_update_interval: Duration::from_secs(5),
            start_timeout: Duration::from_secs(5),
            key_rotation_interval: Duration::from_secs(30 * 24 * 60 * 60),
            publish_timeout: Duration::from_millis(800),
            unhealthy_after_failures: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Ok(dir) = std::env::var("AGENT_PULSE_DATA_DIR") {
            if !dir.is_empty() {
                cfg.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(relays) = std::env::var("AGENT_PULSE_RELAYS") {
            let parsed: Vec<String> = relays
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                cfg.relays = parsed;
            }
        }
        if let Ok(name) = std::env::var("AGENT_NAME") {
            cfg.agent_name = name;
        }
        if let Ok(eph) = std::env::var("AGENT_PULSE_EPHEMERAL") {
            cfg.ephemeral = eph == "true";
        }
        if let Ok(env) = std::env::var("NODE_ENV") {
            cfg.environment = Environment::from_str(&env);
        }

        cfg
    }
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(".agent-pulse"),
        _ => PathBuf::from(".agent-pulse"),
    }
}
