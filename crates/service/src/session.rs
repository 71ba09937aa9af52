//! Session token lifecycle
//!
//! Issues, validates, renews and revokes the opaque tokens the product
//! hands out at login. A token is a row in the `connections` table; it is
//! live while `now <= expiration_date`, gets its window pushed forward on
//! every successful validation, and is eventually removed by an explicit
//! revocation or by the [`crate::sweeper`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use derive_more::{Display, From, Into};
use rand::RngCore;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::gateway::{self, Filter, Gateway, Row, Value};
use crate::registry::Singleton;

/// Session storage table
pub const TAB_CONNECTIONS: &str = "connections";
/// Account storage table
pub const TAB_ACCOUNTS: &str = "accounts";

const SESSION_COLUMNS: [&str; 4] = ["token", "user_id", "creation_date", "expiration_date"];

/// Token entropy in bytes
const TOKEN_BYTES: usize = 16;

/// Upper bound on collision retries in [`SessionService::generate_token`]
const MAX_GENERATE_ATTEMPTS: u32 = 12;

/// Identifier of an account owning zero or more sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, From, Into, Display, Deserialize)]
pub struct UserId(i64);

impl From<UserId> for Value {
    fn from(id: UserId) -> Self {
        Value::Integer(id.0)
    }
}

/// A session handed back by [`SessionService::issue`] or
/// [`SessionService::refresh`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Opaque credential proving the login
    pub token: String,
    /// Owning account
    pub user_id: UserId,
    /// When the session row was (re)created
    pub created_at: DateTime<Utc>,
    /// When the session stops being live, barring renewal
    pub expires_at: DateTime<Utc>,
}

/// Metadata of an existing session row
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// The session token
    pub token: String,
    /// Owning account
    pub user_id: UserId,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Expiration timestamp
    pub expires_at: DateTime<Utc>,
    /// Remaining time to live; negative once expired
    pub ttl: Duration,
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Seconds a session stays live after issuance or renewal
    #[serde(default = "default_lifespan_secs")]
    pub lifespan_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lifespan_secs: default_lifespan_secs(),
        }
    }
}

fn default_lifespan_secs() -> u64 {
    3600
}

/// Issues, validates, renews and revokes session tokens
pub struct SessionService {
    gateway: Arc<dyn Gateway>,
    lifespan: Duration,
}

impl Singleton for SessionService {}

impl SessionService {
    /// Service reading and writing session rows through `gateway`
    pub fn new(gateway: Arc<dyn Gateway>, config: &Config) -> Self {
        Self {
            gateway,
            lifespan: Duration::seconds(config.lifespan_secs as i64),
        }
    }

    /// The one liveness rule, shared with the sweeper: a session is live
    /// iff its expiration parses and has not passed. Missing or
    /// unparsable expirations count as already expired.
    pub fn is_live(expiration: &Value, now: DateTime<Utc>) -> bool {
        expiration.as_timestamp().is_some_and(|expires_at| now <= expires_at)
    }

    fn lifespan_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.lifespan
    }

    /// Produce a random token that matches no currently stored session.
    ///
    /// The collision retry is bounded; a persistently colliding store
    /// yields [`Error::TokenSpaceExhausted`]. A gateway failure during the
    /// uniqueness probe is a hard error, never treated as a collision.
    pub async fn generate_token(&self) -> Result<String, Error> {
        for attempt in 1..=MAX_GENERATE_ATTEMPTS {
            let mut bytes = [0u8; TOKEN_BYTES];
            rand::thread_rng().fill_bytes(&mut bytes);
            let candidate = hex::encode(bytes);

            let existing = self
                .gateway
                .get_rows(TAB_CONNECTIONS, &["token"], &Filter::eq("token", candidate.as_str()))
                .await?;

            if existing.is_empty() {
                return Ok(candidate);
            }

            debug!(attempt, "Token collision");
        }

        Err(Error::TokenSpaceExhausted {
            attempts: MAX_GENERATE_ATTEMPTS,
        })
    }

    /// Create a session for `user_id`, expiring a lifespan from now.
    ///
    /// Either the row lands with both token and expiration, or the
    /// insert fails and nothing is left behind.
    pub async fn issue(&self, user_id: UserId) -> Result<Session, Error> {
        let token = self.generate_token().await?;
        let now = Utc::now();
        let expires_at = self.lifespan_from(now);

        self.gateway
            .insert_row(
                TAB_CONNECTIONS,
                &SESSION_COLUMNS,
                &[token.as_str().into(), user_id.into(), now.into(), expires_at.into()],
            )
            .await?;

        debug!(%user_id, "Session issued");

        Ok(Session {
            token,
            user_id,
            created_at: now,
            expires_at,
        })
    }

    /// Check `token` and, when live, slide its expiration window to a
    /// full lifespan from now. Returns the new expiration.
    ///
    /// Not read-only: every successful call extends the session. Expired
    /// rows are rejected but left in place for the sweeper.
    pub async fn validate(&self, token: &str) -> Result<DateTime<Utc>, Error> {
        let row = self.fetch(token).await?;
        let now = Utc::now();

        let expiration = row.get("expiration_date").cloned().unwrap_or(Value::Null);
        if !Self::is_live(&expiration, now) {
            warn!("Token rejected after excessive idle time");
            return Err(Error::TokenExpired);
        }

        let expires_at = self.lifespan_from(now);
        let affected = self
            .gateway
            .update_row(
                TAB_CONNECTIONS,
                &["expiration_date"],
                &[expires_at.into()],
                &Filter::eq("token", token),
            )
            .await?;

        // The row may have been revoked between the fetch and the update
        if affected == 0 {
            return Err(Error::TokenMissing);
        }

        Ok(expires_at)
    }

    /// Fail-closed boolean form of [`SessionService::validate`]
    pub async fn is_valid(&self, token: &str) -> bool {
        self.validate(token).await.is_ok()
    }

    /// Swap `token` for a fresh one with a fresh expiration, in a single
    /// row update keyed by the old token.
    ///
    /// The old token must still be live; an expired but unswept row is
    /// rejected with [`Error::TokenExpired`], never traded for a fresh
    /// session. Non-idempotent: of two concurrent calls with the same
    /// old token only the update that still finds the row succeeds; the
    /// loser observes [`Error::TokenInvalid`].
    pub async fn refresh(&self, token: &str) -> Result<Session, Error> {
        let row = match self.fetch(token).await {
            Ok(row) => row,
            // A stale old token reads as invalid, not merely absent
            Err(Error::TokenMissing) => return Err(Error::TokenInvalid),
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        let expiration = row.get("expiration_date").cloned().unwrap_or(Value::Null);
        if !Self::is_live(&expiration, now) {
            return Err(Error::TokenExpired);
        }

        let user_id = row
            .get("user_id")
            .and_then(Value::as_integer)
            .map(UserId::from)
            .ok_or(Error::TokenInvalid)?;

        let new_token = self.generate_token().await?;
        let expires_at = self.lifespan_from(now);

        let affected = self
            .gateway
            .update_row(
                TAB_CONNECTIONS,
                &["token", "expiration_date", "creation_date"],
                &[new_token.as_str().into(), expires_at.into(), now.into()],
                &Filter::eq("token", token),
            )
            .await?;

        if affected == 0 {
            return Err(Error::TokenInvalid);
        }

        debug!(%user_id, "Session refreshed");

        Ok(Session {
            token: new_token,
            user_id,
            created_at: now,
            expires_at,
        })
    }

    /// Delete the session row for `token`. Success when already absent.
    pub async fn revoke(&self, token: &str) -> Result<(), Error> {
        self.gateway
            .delete_rows(TAB_CONNECTIONS, &Filter::eq("token", token))
            .await?;
        Ok(())
    }

    /// Delete every session owned by `user_id`, returning how many were
    /// removed.
    ///
    /// Deletes row by row so a gateway failure mid-stream surfaces as
    /// [`Error::PartialRevocation`] with the count already removed,
    /// distinct from a total failure.
    pub async fn revoke_all_for_user(&self, user_id: UserId) -> Result<u64, Error> {
        let rows = self
            .gateway
            .get_rows(TAB_CONNECTIONS, &["token"], &Filter::eq("user_id", user_id))
            .await?;

        let mut removed = 0;
        for row in &rows {
            let Some(token) = row.get("token").and_then(Value::as_text) else {
                continue;
            };

            match self
                .gateway
                .delete_rows(TAB_CONNECTIONS, &Filter::eq("token", token))
                .await
            {
                Ok(count) => removed += count,
                Err(source) if removed > 0 => return Err(Error::PartialRevocation { removed, source }),
                Err(source) => return Err(Error::Persistence(source)),
            }
        }

        debug!(%user_id, removed, "Sessions revoked");

        Ok(removed)
    }

    /// Resolve the account owning `token`. The single resolution step
    /// shared by validation, admin checks and session info.
    pub async fn user_id_from_token(&self, token: &str) -> Result<UserId, Error> {
        let row = self.fetch(token).await?;
        row.get("user_id")
            .and_then(Value::as_integer)
            .map(UserId::from)
            .ok_or(Error::TokenInvalid)
    }

    /// Whether `token` belongs to an administrator account.
    ///
    /// Anything short of an explicit truthy `admin` field is `false`:
    /// unresolvable token, absent account, absent field. Only a gateway
    /// failure is an error.
    pub async fn is_admin(&self, token: &str) -> Result<bool, Error> {
        let user_id = match self.user_id_from_token(token).await {
            Ok(user_id) => user_id,
            Err(Error::Persistence(e)) => return Err(Error::Persistence(e)),
            Err(_) => return Ok(false),
        };

        let accounts = self
            .gateway
            .get_rows(TAB_ACCOUNTS, &["id", "admin"], &Filter::eq("id", user_id))
            .await?;

        let Some(account) = accounts.first() else {
            return Ok(false);
        };

        let admin = account.get("admin").is_some_and(is_truthy);
        if admin {
            warn!(%user_id, "Admin account resolved");
        }

        Ok(admin)
    }

    /// Metadata and remaining time to live for `token`
    pub async fn info(&self, token: &str) -> Result<SessionInfo, Error> {
        let row = self.fetch(token).await?;

        let user_id = row
            .get("user_id")
            .and_then(Value::as_integer)
            .map(UserId::from)
            .ok_or(Error::TokenInvalid)?;
        let expires_at = row
            .get("expiration_date")
            .and_then(Value::as_timestamp)
            .ok_or(Error::TokenInvalid)?;
        let created_at = row
            .get("creation_date")
            .and_then(Value::as_timestamp)
            .unwrap_or(DateTime::UNIX_EPOCH);

        Ok(SessionInfo {
            token: token.to_string(),
            user_id,
            created_at,
            expires_at,
            ttl: expires_at - Utc::now(),
        })
    }

    /// Fetch the single session row for `token`, failing closed on
    /// malformed input
    async fn fetch(&self, token: &str) -> Result<Row, Error> {
        if token.is_empty() || !token.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::TokenInvalid);
        }

        let mut rows = self
            .gateway
            .get_rows(TAB_CONNECTIONS, &SESSION_COLUMNS, &Filter::eq("token", token))
            .await?;

        match rows.len() {
            1 => Ok(rows.remove(0)),
            0 => Err(Error::TokenMissing),
            // The token column is unique; anything else is a store gone bad
            _ => Err(Error::TokenInvalid),
        }
    }
}

/// `admin` may arrive as an integer flag or a `"0"`/`"1"`/`"true"` style
/// string depending on the storage backend
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Integer(n) => *n == 1,
        Value::Text(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// A session error
#[derive(Debug, Error)]
pub enum Error {
    /// Empty or malformed token, or a row-scoped update that found no row
    #[error("invalid token")]
    TokenInvalid,
    /// No session row exists for this token
    #[error("unknown token")]
    TokenMissing,
    /// The session row exists but its expiration has passed
    #[error("expired token")]
    TokenExpired,
    /// Bounded collision retry gave up
    #[error("token space exhausted after {attempts} attempts")]
    TokenSpaceExhausted {
        /// Candidates tried before giving up
        attempts: u32,
    },
    /// Some sessions were removed before the gateway failed
    #[error("revocation interrupted after removing {removed} sessions")]
    PartialRevocation {
        /// Sessions removed before the failure
        removed: u64,
        /// The failing delete
        #[source]
        source: gateway::Error,
    },
    /// The persistence gateway failed outright
    #[error("persistence gateway")]
    Persistence(#[from] gateway::Error),
}
