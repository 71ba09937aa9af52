//! Periodic removal of expired session rows
//!
//! Validation never deletes; it only rejects. This task is the one bulk
//! deleter, trimming rows whose expiration has passed so idle sessions
//! do not accumulate forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error;
use crate::gateway::{Filter, Gateway, Value};
use crate::session::{self, SessionService};

/// Sweeper configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Seconds between sweep passes
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    300
}

/// Deletes expired session rows on a fixed interval
pub struct Sweeper {
    gateway: Arc<dyn Gateway>,
    interval: Duration,
}

impl Sweeper {
    /// Sweeper trimming session rows through `gateway`
    pub fn new(gateway: Arc<dyn Gateway>, config: &Config) -> Self {
        Self {
            gateway,
            interval: Duration::from_secs(config.interval_secs),
        }
    }

    /// Sweep once per interval tick until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Sweeper exiting");
                    return;
                }
                _ = interval.tick() => {}
            }

            match self.sweep().await {
                Ok(removed) if removed > 0 => info!(removed, "Expired sessions swept"),
                Ok(_) => {}
                Err(e) => {
                    let error = error::chain(e);
                    warn!(%error, "Sweep pass failed");
                }
            }
        }
    }

    /// One pass: delete every session row that is no longer live,
    /// returning how many were removed.
    ///
    /// Applies the same liveness rule as validation. Rows the gateway
    /// refuses to delete are logged and picked up on the next pass.
    pub async fn sweep(&self) -> Result<u64, session::Error> {
        let now = Utc::now();

        let rows = self
            .gateway
            .get_rows(
                session::TAB_CONNECTIONS,
                &["token", "expiration_date"],
                &Filter::all(),
            )
            .await?;

        let mut removed = 0;
        for row in &rows {
            let expiration = row.get("expiration_date").cloned().unwrap_or(Value::Null);
            if SessionService::is_live(&expiration, now) {
                continue;
            }

            let Some(token) = row.get("token").and_then(Value::as_text) else {
                continue;
            };

            match self
                .gateway
                .delete_rows(session::TAB_CONNECTIONS, &Filter::eq("token", token))
                .await
            {
                Ok(count) => {
                    removed += count;
                    debug!("Expired session removed");
                }
                Err(e) => {
                    let error = error::chain(e);
                    warn!(%error, "Failed to remove expired session");
                }
            }
        }

        Ok(removed)
    }
}
