//! Environment-driven configuration, grounded in the way the teacher's
//! `server` package loads `Config::from_env()`: read `.env` if present,
//! then pull required/optional values out of `std::env`.

mod credentials;

pub use credentials::{resolve_gitlab_token, resolve_svn_credentials, SvnCredentials};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Selects which `Store` implementation the artifact store wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactsBackend {
    Local,
    File,
    Object,
}

impl std::str::FromStr for ArtifactsBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(ArtifactsBackend::Local),
            "file" => Ok(ArtifactsBackend::File),
            "object" => Ok(ArtifactsBackend::Object),
            other => anyhow::bail!("unknown ENGRAM_ARTIFACTS_BACKEND: {other}"),
        }
    }
}

/// Application-wide configuration loaded once at process start.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub postgres_dsn: String,
    pub artifacts_root: String,
    pub artifacts_backend: ArtifactsBackend,
}

impl AppConfig {
    /// Loads configuration from the environment. `POSTGRES_DSN` is
    /// required; `LOGBOOK_DSN` is the preferred alias and wins when both
    /// are set (spec §6).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let postgres_dsn = env::var("LOGBOOK_DSN")
            .or_else(|_| env::var("POSTGRES_DSN"))
            .context("POSTGRES_DSN (or LOGBOOK_DSN) must be set")?;

        let artifacts_root =
            env::var("ENGRAM_ARTIFACTS_ROOT").unwrap_or_else(|_| "./artifacts".to_string());

        let artifacts_backend = env::var("ENGRAM_ARTIFACTS_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .parse()
            .context("ENGRAM_ARTIFACTS_BACKEND must be one of local|file|object")?;

        Ok(Self {
            postgres_dsn,
            artifacts_root,
            artifacts_backend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logbook_dsn_takes_priority_over_postgres_dsn() {
        temp_env::with_vars(
            [
                ("LOGBOOK_DSN", Some("postgres://logbook")),
                ("POSTGRES_DSN", Some("postgres://fallback")),
                ("ENGRAM_ARTIFACTS_ROOT", None::<&str>),
                ("ENGRAM_ARTIFACTS_BACKEND", None::<&str>),
            ],
            || {
                let cfg = AppConfig::from_env().unwrap();
                assert_eq!(cfg.postgres_dsn, "postgres://logbook");
                assert_eq!(cfg.artifacts_backend, ArtifactsBackend::Local);
            },
        );
    }

    #[test]
    fn missing_dsn_is_an_error() {
        temp_env::with_vars(
            [
                ("LOGBOOK_DSN", None::<&str>),
                ("POSTGRES_DSN", None::<&str>),
            ],
            || {
                assert!(AppConfig::from_env().is_err());
            },
        );
    }
}
