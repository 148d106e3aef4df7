//! Wiring of one service instance.

use std::{fmt, sync::Arc};

use bilicore_authn::{CacheRevocationSet, SigningKeys, TokenCodec};
use bilicore_cache::CacheStore;
use bilicore_coord::LockCoordinator;
use bilicore_gateway::ConsistencyGateway;
use bilicore_reconcile::{ReconciliationEngine, Scheduler, SchedulerHandle};
use bilicore_storage::{SharedClock, StorageBackend, system_clock};
use bilicore_store::AuthoritativeStore;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ServiceConfig, SigningKeyConfig},
    error::{ServiceError, ServiceResult},
};

/// Every component of one instance, built over one shared backend.
///
/// The backend holds cache entries, revocations, lock records and
/// checkpoints; the authoritative stores are passed in separately.
pub struct Service<B> {
    gateway: ConsistencyGateway<B>,
    engine: Arc<ReconciliationEngine<B>>,
    cancel: CancellationToken,
    scheduler: Option<SchedulerHandle>,
}

impl<B> fmt::Debug for Service<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("gateway", &self.gateway)
            .field("engine", &self.engine)
            .field("running", &self.scheduler.is_some())
            .finish()
    }
}

fn signing_keys(config: &SigningKeyConfig) -> ServiceResult<SigningKeys> {
    match &config.seed {
        Some(seed) => SigningKeys::from_seed_b64(config.kid.as_str(), seed),
        None => {
            tracing::warn!(kid = %config.kid, "no signing seed configured, generating an ephemeral key");
            SigningKeys::generate(config.kid.as_str())
        },
    }
    .map_err(ServiceError::SigningKey)
}

impl<B: StorageBackend + Clone + 'static> Service<B> {
    /// Builds an instance reading time from the system clock.
    ///
    /// # Errors
    ///
    /// See [`build_with_clock`](Self::build_with_clock).
    pub fn build(
        config: &ServiceConfig,
        backend: B,
        stores: Vec<Arc<dyn AuthoritativeStore>>,
    ) -> ServiceResult<Self> {
        Self::build_with_clock(config, backend, stores, system_clock())
    }

    /// Builds an instance.
    ///
    /// `clock` must be the clock `backend` expires keys with.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::Config`] if the configuration is invalid
    /// - [`ServiceError::SigningKey`] if the seed cannot be decoded
    /// - [`ServiceError::Job`] if a job names a store that was not passed in
    pub fn build_with_clock(
        config: &ServiceConfig,
        backend: B,
        stores: Vec<Arc<dyn AuthoritativeStore>>,
        clock: SharedClock,
    ) -> ServiceResult<Self> {
        config.validate()?;

        let cache = CacheStore::new(backend.clone(), config.cache.clone(), clock.clone());
        let codec = TokenCodec::new(
            signing_keys(&config.signing_key)?,
            config.token.clone(),
            Arc::new(CacheRevocationSet::new(cache.clone())),
            clock.clone(),
        );

        let mut gateway = ConsistencyGateway::new(codec, cache.clone(), config.gateway.clone());
        let coordinator = LockCoordinator::new(backend.clone(), config.lock.clone(), clock.clone());
        let mut engine =
            ReconciliationEngine::new(config.reconcile.clone(), coordinator, cache, backend, clock);
        for store in stores {
            gateway = gateway.with_store(Arc::clone(&store));
            engine = engine.with_store(store);
        }
        for job in &config.jobs {
            engine = engine.with_job(job.clone())?;
        }

        tracing::info!(
            instance = config.lock.instance_id(),
            jobs = config.jobs.len(),
            "service components built"
        );
        Ok(Self { gateway, engine: Arc::new(engine), cancel: CancellationToken::new(), scheduler: None })
    }

    /// The request gateway.
    #[must_use]
    pub fn gateway(&self) -> &ConsistencyGateway<B> {
        &self.gateway
    }

    /// The reconciliation engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<ReconciliationEngine<B>> {
        &self.engine
    }

    /// Whether the scheduler is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Starts ticking the configured jobs. Calling it again is a no-op.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self) {
        if self.scheduler.is_some() {
            return;
        }
        let scheduler = Scheduler::new(Arc::clone(&self.engine), self.cancel.child_token());
        self.scheduler = Some(scheduler.start());
        tracing::info!("reconciliation scheduler started");
    }

    /// Stops the scheduler and waits for in-flight runs to wind down.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown().await;
        }
        tracing::info!("service stopped");
    }
}
