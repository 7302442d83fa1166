//! # Bootstrap
//!
//! `Init -> SecretPending -> Connecting -> Ready`, or `Failed` from either middle step.
//!
//! The listener is already bound while this runs, so the phase is published on a watch
//! channel. Handlers only get the store handle once the phase is `Ready`, and the serve loop
//! shuts down as soon as the phase turns `Failed`.
use std::{fmt, sync::OnceLock};

use tokio::sync::watch;
use tracing::{error, info};

use crate::{
    database::{Store, StoreConnector},
    error::BootstrapError,
    secrets::SecretResolver,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Init,
    SecretPending,
    Connecting,
    Ready,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::SecretPending => "secret_pending",
            Phase::Connecting => "connecting",
            Phase::Ready => "ready",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Bootstrap {
    phase: watch::Sender<Phase>,
    store: OnceLock<Store>,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self::new()
    }
}

impl Bootstrap {
    pub fn new() -> Self {
        Self {
            phase: watch::Sender::new(Phase::Init),
            store: OnceLock::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// The store handle, only once bootstrap has reached `Ready`.
    pub fn store(&self) -> Option<&Store> {
        match self.phase() {
            Phase::Ready => self.store.get(),
            _ => None,
        }
    }

    /// Resolves when bootstrap fails. Never resolves otherwise.
    pub async fn failed(&self) {
        let mut phase = self.subscribe();
        if phase.wait_for(|phase| *phase == Phase::Failed).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub async fn run(
        &self,
        resolver: &dyn SecretResolver,
        connector: &dyn StoreConnector,
        secret_name: &str,
        vault: &str,
    ) -> Result<(), BootstrapError> {
        let started = self.phase.send_if_modified(|phase| {
            if *phase == Phase::Init {
                *phase = Phase::SecretPending;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(BootstrapError::AlreadyStarted);
        }
        info!("Resolving secret {secret_name}");

        let secret = match resolver.resolve(secret_name, vault).await {
            Ok(secret) => secret,
            Err(e) => return Err(self.fail(e.into())),
        };
        info!("Secret {secret_name} resolved ({} bytes)", secret.len());

        self.advance(Phase::Connecting);

        let store = match connector.connect(secret.expose()).await {
            Ok(store) => store,
            Err(e) => return Err(self.fail(BootstrapError::ConnectionFailed(e))),
        };
        drop(secret);

        if self.store.set(store).is_err() {
            return Err(self.fail(BootstrapError::AlreadyStarted));
        }

        self.advance(Phase::Ready);

        Ok(())
    }

    /// Close the store handle if bootstrap installed one.
    pub async fn close(&self) {
        if let Some(store) = self.store.get() {
            store.close().await;
        }
    }

    fn advance(&self, phase: Phase) {
        info!("Bootstrap phase: {phase}");
        self.phase.send_replace(phase);
    }

    fn fail(&self, e: BootstrapError) -> BootstrapError {
        error!("Bootstrap failed: {e}");
        self.advance(Phase::Failed);
        e
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        error::{SecretError, StoreError},
        memory::MemoryStore,
        secrets::Secret,
    };

    pub(crate) enum Outcome {
        Value(&'static str),
        NotFound,
        Empty,
    }

    pub(crate) struct FakeResolver {
        outcome: Outcome,
        gate: Option<Arc<Notify>>,
        pub calls: AtomicUsize,
    }

    impl FakeResolver {
        pub(crate) fn new(outcome: Outcome) -> Self {
            Self {
                outcome,
                gate: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn gated(outcome: Outcome, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(outcome)
            }
        }
    }

    #[async_trait]
    impl SecretResolver for FakeResolver {
        async fn resolve(&self, name: &str, _vault: &str) -> Result<Secret, SecretError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }

            match self.outcome {
                Outcome::Value(value) => Ok(Secret::new(value)),
                Outcome::NotFound => Err(SecretError::NotFound { name: name.into() }),
                Outcome::Empty => Err(SecretError::Empty { name: name.into() }),
            }
        }
    }

    pub(crate) struct FakeConnector {
        fail: bool,
        gate: Option<Arc<Notify>>,
        pub store: Arc<MemoryStore>,
        pub calls: AtomicUsize,
        pub seen: parking_lot::Mutex<Option<String>>,
    }

    impl FakeConnector {
        pub(crate) fn new() -> Self {
            Self {
                fail: false,
                gate: None,
                store: Arc::new(MemoryStore::new()),
                calls: AtomicUsize::new(0),
                seen: parking_lot::Mutex::new(None),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        pub(crate) fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl StoreConnector for FakeConnector {
        async fn connect(&self, connection_string: &str) -> Result<Store, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen.lock() = Some(connection_string.to_string());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }

            if self.fail {
                Err(StoreError::ConnectionFailed("refused".into()))
            } else {
                Ok(self.store.clone() as Store)
            }
        }
    }

    #[tokio::test]
    async fn reaches_ready_with_connected_store() {
        let bootstrap = Bootstrap::new();
        let resolver = FakeResolver::new(Outcome::Value("mongodb://valid"));
        let connector = FakeConnector::new();

        bootstrap
            .run(&resolver, &connector, "StoreConnectionString", "/run/secrets")
            .await
            .unwrap();

        assert_eq!(bootstrap.phase(), Phase::Ready);
        assert!(bootstrap.store().is_some());
        assert_eq!(connector.seen.lock().as_deref(), Some("mongodb://valid"));
    }

    #[tokio::test]
    async fn empty_secret_fails_without_connecting() {
        let bootstrap = Bootstrap::new();
        let resolver = FakeResolver::new(Outcome::Empty);
        let connector = FakeConnector::new();

        let err = bootstrap
            .run(&resolver, &connector, "StoreConnectionString", "/run/secrets")
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::Secret(SecretError::Empty { .. })));
        assert_eq!(bootstrap.phase(), Phase::Failed);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
        assert!(bootstrap.store().is_none());
    }

    #[tokio::test]
    async fn missing_secret_fails() {
        let bootstrap = Bootstrap::new();
        let resolver = FakeResolver::new(Outcome::NotFound);
        let connector = FakeConnector::new();

        let err = bootstrap
            .run(&resolver, &connector, "StoreConnectionString", "/run/secrets")
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::Secret(SecretError::NotFound { .. })));
        assert_eq!(bootstrap.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn connection_failure_is_fatal() {
        let bootstrap = Bootstrap::new();
        let resolver = FakeResolver::new(Outcome::Value("redis://down"));
        let connector = FakeConnector::failing();

        let err = bootstrap
            .run(&resolver, &connector, "StoreConnectionString", "/run/secrets")
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::ConnectionFailed(_)));
        assert_eq!(bootstrap.phase(), Phase::Failed);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        assert!(bootstrap.store().is_none());
    }

    #[tokio::test]
    async fn store_is_withheld_until_ready() {
        let bootstrap = Arc::new(Bootstrap::new());
        let gate = Arc::new(Notify::new());
        let mut phases = bootstrap.subscribe();

        let task = {
            let bootstrap = bootstrap.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                let resolver = FakeResolver::gated(Outcome::Value("memory://"), gate);
                let connector = FakeConnector::new();
                bootstrap
                    .run(&resolver, &connector, "StoreConnectionString", "/run/secrets")
                    .await
            })
        };

        phases
            .wait_for(|phase| *phase == Phase::SecretPending)
            .await
            .unwrap();
        assert!(bootstrap.store().is_none());

        gate.notify_one();
        task.await.unwrap().unwrap();

        assert_eq!(bootstrap.phase(), Phase::Ready);
        assert!(bootstrap.store().is_some());
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let bootstrap = Bootstrap::new();
        let resolver = FakeResolver::new(Outcome::Value("memory://"));
        let connector = FakeConnector::new();

        bootstrap
            .run(&resolver, &connector, "StoreConnectionString", "/run/secrets")
            .await
            .unwrap();
        let err = bootstrap
            .run(&resolver, &connector, "StoreConnectionString", "/run/secrets")
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::AlreadyStarted));
        assert_eq!(bootstrap.phase(), Phase::Ready);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_resolves_on_failure() {
        let bootstrap = Arc::new(Bootstrap::new());
        let waiter = {
            let bootstrap = bootstrap.clone();
            tokio::spawn(async move { bootstrap.failed().await })
        };

        let resolver = FakeResolver::new(Outcome::Empty);
        let connector = FakeConnector::new();
        let _ = bootstrap
            .run(&resolver, &connector, "StoreConnectionString", "/run/secrets")
            .await;

        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn close_reaches_installed_store() {
        let bootstrap = Bootstrap::new();
        let resolver = FakeResolver::new(Outcome::Value("memory://"));
        let connector = FakeConnector::new();

        bootstrap.close().await;

        bootstrap
            .run(&resolver, &connector, "StoreConnectionString", "/run/secrets")
            .await
            .unwrap();
        bootstrap.close().await;
        bootstrap.close().await;

        assert!(connector.store.is_closed());
    }
}
