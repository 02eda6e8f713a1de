use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::event::Lang;

/// Command-line and environment configuration of the server binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "sandbox-agent", version, about = "Screenshot-driven computer-use agent service")]
pub struct AppConfig {
    /// Address the HTTP server listens on.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:5000")]
    pub bind: SocketAddr,

    /// PostgreSQL URL; tasks are kept in memory when unset.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Terminal tasks older than this many days are removed.
    #[arg(long, env = "TASK_RETENTION_DAYS", default_value_t = 7)]
    pub retention_days: i64,

    #[arg(long, env = "CLEANUP_INTERVAL_SECS", default_value_t = 3600)]
    pub cleanup_interval_secs: u64,

    /// Language of status messages and the system prompt (`zh` or `en`).
    #[arg(long, env = "AGENT_LANG", default_value = "zh")]
    pub lang: String,

    /// Fallback log filter when `RUST_LOG` is unset.
    #[arg(long, env = "LOG_LEVEL", default_value = "debug")]
    pub log_level: String,
}

impl AppConfig {
    pub fn lang(&self) -> Lang {
        Lang::parse(&self.lang)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days.max(0))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(self.log_level.to_lowercase()))
            .unwrap_or_else(|_| EnvFilter::new("debug"))
    }

    pub fn init_tracing(&self) {
        tracing_subscriber::fmt().with_env_filter(self.env_filter()).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let cfg = AppConfig::parse_from(["sandbox-agent", "--lang", "en", "--retention-days", "3"]);
        assert_eq!(cfg.lang(), Lang::En);
        assert_eq!(cfg.retention(), chrono::Duration::days(3));

        let cfg = AppConfig::parse_from(["sandbox-agent", "--bind", "127.0.0.1:8080"]);
        assert_eq!(cfg.bind.port(), 8080);
    }
}
