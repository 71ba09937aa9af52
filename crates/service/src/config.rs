//! Service configuration

use std::{
    io,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tokio::fs;

use crate::{session, sweeper, tracing};

/// Service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path of the sqlite database file
    pub database: PathBuf,
    /// Tracing configuration
    #[serde(default)]
    pub tracing: tracing::Config,
    /// Session lifecycle configuration
    #[serde(default)]
    pub session: session::Config,
    /// Expiry sweeper configuration
    #[serde(default)]
    pub sweeper: sweeper::Config,
}

impl Config {
    /// Load configuration from the provided `path`
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = fs::read_to_string(path).await?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// A config error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Loading the config failed
    #[error("load config")]
    Load(#[from] io::Error),
    /// Decoding the config failed
    #[error("decode config")]
    Decode(#[from] toml::de::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = toml::from_str(r#"database = "pawlink.db""#).unwrap();

        assert_eq!(config.database, PathBuf::from("pawlink.db"));
        assert_eq!(config.session.lifespan_secs, 3600);
        assert_eq!(config.sweeper.interval_secs, 300);
    }

    #[test]
    fn sections_override_defaults() {
        let config: Config = toml::from_str(
            r#"
            database = "/var/lib/pawlink/service.db"

            [session]
            lifespan_secs = 600

            [sweeper]
            interval_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.session.lifespan_secs, 600);
        assert_eq!(config.sweeper.interval_secs, 60);
    }
}
