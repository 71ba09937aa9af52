#![warn(missing_docs)]
//! Core services for the PawLink device-management backend
//!
//! The HTTP layer, media converters and mail sender live elsewhere; this
//! crate is the backbone they share: a [`Registry`] handing out lazily
//! constructed singleton collaborators, and the session/token lifecycle
//! ([`SessionService`], [`Sweeper`]) built on top of a row-oriented
//! persistence [`Gateway`].
//!
//! Typical wiring:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pawlink_service::gateway::Gateway;
//! use pawlink_service::registry::BoxError;
//! use pawlink_service::{Config, Database, Registry, SessionService, Sweeper};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn wire() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let config = Config::load("pawlink.toml").await?;
//! pawlink_service::tracing::init(&config.tracing);
//!
//! let registry = Registry::new();
//!
//! let path = config.database.clone();
//! registry
//!     .register::<Database, _, _>(move |permit| {
//!         let path = path.clone();
//!         async move {
//!             let database = Database::connect(permit, path).await?;
//!             Ok::<_, BoxError>(database)
//!         }
//!     })
//!     .await?;
//!
//! let gateway: Arc<dyn Gateway> = registry.get::<Database>().await?;
//! let sessions = SessionService::new(Arc::clone(&gateway), &config.session);
//! let sweeper = Sweeper::new(gateway, &config.sweeper);
//!
//! tokio::spawn(sweeper.run(CancellationToken::new()));
//!
//! let session = sessions.issue(42.into()).await?;
//! assert!(sessions.is_valid(&session.token).await);
//! # Ok(())
//! # }
//! ```

pub use self::config::Config;
pub use self::database::Database;
pub use self::gateway::Gateway;
pub use self::registry::Registry;
pub use self::session::SessionService;
pub use self::sweeper::Sweeper;

pub mod config;
pub mod database;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod session;
pub mod sweeper;
pub mod tracing;
