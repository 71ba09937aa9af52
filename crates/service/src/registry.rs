//! Process-wide service registry
//!
//! Hands out lazily constructed singleton collaborators (database handle,
//! session service, sweeper, ...). A [`Registry`] is an explicit value
//! passed to whoever needs it; there is no package-level instance. Each
//! service key pays its construction cost at most once, guarded by a
//! per-key lock with a re-probe after acquisition.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

/// Boxed error returned by service factories
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Instance = Arc<dyn Any + Send + Sync>;
type BuildFn = Arc<dyn Fn(Permit) -> BoxFuture<'static, Result<Instance, BoxError>> + Send + Sync>;

/// A type owned and constructed by a [`Registry`]
pub trait Singleton: Any + Send + Sync {
    /// Runs exactly once after the factory returns and before the
    /// instance is published to concurrent readers
    fn post_init(&self) -> impl Future<Output = Result<(), BoxError>> + Send {
        async { Ok(()) }
    }
}

/// Proof that a construction was initiated by a [`Registry`].
///
/// Cannot be created outside this module and cannot be cloned, so a
/// constructor that takes a `Permit` by value can only ever run inside a
/// registry factory. The permit is moved and dropped on every exit path;
/// there is no flag to restore.
#[derive(Debug)]
pub struct Permit(());

#[derive(Clone)]
struct StoredFactory {
    service: &'static str,
    build: BuildFn,
}

/// Map from service type to its shared singleton instance
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    instances: RwLock<HashMap<TypeId, Instance>>,
    factories: Mutex<HashMap<TypeId, StoredFactory>>,
    locks: Mutex<HashMap<TypeId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `S` and construct eagerly.
    ///
    /// No-op when an instance already exists. A factory failure
    /// propagates to the caller and caches nothing; the factory stays
    /// registered so a later [`Registry::get`] may retry.
    pub async fn register<S, F, Fut>(&self, factory: F) -> Result<(), Error>
    where
        S: Singleton,
        F: Fn(Permit) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, BoxError>> + Send + 'static,
    {
        let key = TypeId::of::<S>();
        self.store_factory::<S, F, Fut>(key, factory);

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        if self.exists::<S>() {
            return Ok(());
        }

        self.construct(key).await.map(drop)
    }

    /// Retrieve the `S` singleton, constructing it on first access.
    ///
    /// Fails with [`Error::NotRegistered`] when no factory was registered
    /// for `S`. Every successful caller observes the same instance.
    pub async fn get<S: Singleton>(&self) -> Result<Arc<S>, Error> {
        if let Some(existing) = self.get_if_exists::<S>() {
            return Ok(existing);
        }

        let key = TypeId::of::<S>();

        let registered = self
            .inner
            .factories
            .lock()
            .expect("lock poisoned")
            .contains_key(&key);
        if !registered {
            return Err(Error::NotRegistered {
                service: type_name::<S>(),
            });
        }

        self.construct_locked(key).await
    }

    /// Retrieve the `S` singleton, registering `factory` on the fly when
    /// nothing was registered yet. Once an instance exists the provided
    /// factory is ignored.
    pub async fn get_with<S, F, Fut>(&self, factory: F) -> Result<Arc<S>, Error>
    where
        S: Singleton,
        F: Fn(Permit) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, BoxError>> + Send + 'static,
    {
        if let Some(existing) = self.get_if_exists::<S>() {
            return Ok(existing);
        }

        let key = TypeId::of::<S>();
        self.store_factory::<S, F, Fut>(key, factory);

        self.construct_locked(key).await
    }

    /// Non-constructing probe. Never triggers a factory; callers with an
    /// optional dependency use this to degrade gracefully.
    pub fn get_if_exists<S: Singleton>(&self) -> Option<Arc<S>> {
        self.inner
            .instances
            .read()
            .expect("lock poisoned")
            .get(&TypeId::of::<S>())
            .cloned()
            .map(|instance| instance.downcast::<S>().expect("instance keyed by TypeId"))
    }

    /// True when an `S` instance has been constructed
    pub fn exists<S: Singleton>(&self) -> bool {
        self.inner
            .instances
            .read()
            .expect("lock poisoned")
            .contains_key(&TypeId::of::<S>())
    }

    /// Drop the stored `S` instance, returning whether one existed. The
    /// factory is kept; the next [`Registry::get`] reconstructs.
    pub fn reset<S: Singleton>(&self) -> bool {
        self.inner
            .instances
            .write()
            .expect("lock poisoned")
            .remove(&TypeId::of::<S>())
            .is_some()
    }

    async fn construct_locked<S: Singleton>(&self, key: TypeId) -> Result<Arc<S>, Error> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        // Another caller may have won the race while this one was blocked
        if let Some(existing) = self.get_if_exists::<S>() {
            return Ok(existing);
        }

        let instance = self.construct(key).await?;
        Ok(instance.downcast::<S>().expect("instance keyed by TypeId"))
    }

    /// Caller must hold the key lock
    async fn construct(&self, key: TypeId) -> Result<Instance, Error> {
        let StoredFactory { service, build } = self
            .inner
            .factories
            .lock()
            .expect("lock poisoned")
            .get(&key)
            .cloned()
            .expect("factory stored before construction");

        let instance = (build)(Permit(()))
            .await
            .map_err(|source| Error::Construct { service, source })?;

        self.inner
            .instances
            .write()
            .expect("lock poisoned")
            .insert(key, Arc::clone(&instance));

        debug!(service, "Service constructed");

        Ok(instance)
    }

    fn store_factory<S, F, Fut>(&self, key: TypeId, factory: F)
    where
        S: Singleton,
        F: Fn(Permit) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, BoxError>> + Send + 'static,
    {
        let mut factories = self.inner.factories.lock().expect("lock poisoned");

        // First registration wins; later factories for the same key are
        // ignored, matching first-caller-args semantics
        factories.entry(key).or_insert_with(|| StoredFactory {
            service: type_name::<S>(),
            build: Arc::new(move |permit| {
                let built = factory(permit);
                async move {
                    let service = built.await?;
                    service.post_init().await?;
                    Ok(Arc::new(service) as Instance)
                }
                .boxed()
            }),
        });
    }

    fn key_lock(&self, key: TypeId) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .locks
            .lock()
            .expect("lock poisoned")
            .entry(key)
            .or_default()
            .clone()
    }
}

/// A registry error
#[derive(Debug, Error)]
pub enum Error {
    /// Lookup of a service with no registered factory
    #[error("service {service} is not registered")]
    NotRegistered {
        /// Requested service type
        service: &'static str,
    },
    /// The factory failed; nothing was cached and a later call may retry
    #[error("construct service {service}")]
    Construct {
        /// Service type under construction
        service: &'static str,
        /// Factory failure
        #[source]
        source: BoxError,
    },
}
