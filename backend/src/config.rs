use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::fact_check::TmdbConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub persist_path: Option<PathBuf>,
    pub store_timeout: Duration,
    pub tmdb: TmdbConfig,
    pub auth_tokens: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let store_timeout_ms = lookup("STORE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(5_000);

        Self {
            bind_addr: var("BIND_ADDR", "0.0.0.0:3000"),
            persist_path: lookup("PERSIST_PATH").map(PathBuf::from),
            store_timeout: Duration::from_millis(store_timeout_ms),
            tmdb: TmdbConfig {
                api_url: var("TMDB_API_URL", "https://api.themoviedb.org"),
                api_key: var("TMDB_API_KEY", ""),
                image_base: var("TMDB_IMAGE_BASE", "https://image.tmdb.org/t/p/w185"),
            },
            auth_tokens: var("AUTH_TOKENS", ""),
        }
    }
}
