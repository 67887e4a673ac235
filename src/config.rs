//! Server configuration loaded from the environment

use crate::types::SessionSettings;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default memegen instance used when no catalog URL is configured explicitly
pub const DEFAULT_CATALOG_URL: &str = "https://api.memegen.link";

/// Upper bound for the submission and judging windows (one hour)
pub const MAX_PHASE_WINDOW_MS: u64 = 60 * 60 * 1000;

fn phase_window(ms: &u64) -> bool {
    (1..=MAX_PHASE_WINDOW_MS).contains(ms)
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Settings applied to every newly created session
    pub session_defaults: SessionSettings,
    /// Length of the judging phase (fixed per server, not per session)
    pub judging_window: Duration,
    pub max_players: usize,
    /// Minimum number of prompts fetched per round
    pub prompt_pool_size: usize,
    /// Size of each player's private prompt subset
    pub prompts_per_player: usize,
    /// Template catalog base URL (None = built-in static catalog)
    pub catalog_url: Option<String>,
    /// JSON file for persisted sessions (None = in-memory only)
    pub data_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 4100)),
            session_defaults: SessionSettings::default(),
            judging_window: Duration::from_secs(60),
            max_players: 13,
            prompt_pool_size: 12,
            prompts_per_player: 6,
            catalog_url: Some(DEFAULT_CATALOG_URL.to_string()),
            data_file: None,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        // An explicitly empty MEMEARENA_CATALOG_URL selects the static catalog
        let catalog_url = match std::env::var("MEMEARENA_CATALOG_URL") {
            Ok(url) => {
                let trimmed = url.trim();
                (!trimmed.is_empty()).then(|| trimmed.trim_end_matches('/').to_string())
            }
            Err(_) => defaults.catalog_url.clone(),
        };

        Self {
            bind_addr: env_parse("MEMEARENA_BIND").unwrap_or(defaults.bind_addr),
            session_defaults: SessionSettings {
                round_count: env_parse::<u32>("MEMEARENA_ROUNDS")
                    .filter(|n| *n > 0)
                    .unwrap_or(defaults.session_defaults.round_count),
                submission_window_ms: env_parse("MEMEARENA_SUBMISSION_WINDOW_MS")
                    .filter(phase_window)
                    .unwrap_or(defaults.session_defaults.submission_window_ms),
            },
            judging_window: env_parse("MEMEARENA_JUDGING_WINDOW_MS")
                .filter(phase_window)
                .map(Duration::from_millis)
                .unwrap_or(defaults.judging_window),
            max_players: env_parse::<usize>("MEMEARENA_MAX_PLAYERS")
                .filter(|n| *n >= 2)
                .unwrap_or(defaults.max_players),
            prompt_pool_size: env_parse("MEMEARENA_PROMPT_POOL")
                .unwrap_or(defaults.prompt_pool_size),
            prompts_per_player: env_parse::<usize>("MEMEARENA_PROMPTS_PER_PLAYER")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.prompts_per_player),
            catalog_url,
            data_file: env_string("MEMEARENA_DATA_FILE").map(PathBuf::from),
        }
    }

    /// Number of prompts to request for a round with `players` participants
    pub fn pool_size_for(&self, players: usize) -> usize {
        self.prompt_pool_size.max(players * 2)
    }
}
