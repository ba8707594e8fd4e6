//! The Bulwark service: wires the limiter components together and owns
//! their background tasks.

use axum::http::HeaderMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::antispam::SpamDetector;
use crate::audit::{spawn_forwarder, AuditEmitter, AuditEvent, AuditSink};
use crate::config::BulwarkConfig;
use crate::context::{
    bearer_token, resolve_identity, AdmissionRequest, IdentityProvider, RequestContext,
};
use crate::error::Result;
use crate::ratelimit::{
    BlockRegistry, CounterEntry, CounterStore, Escalation, PolicyEngine, ScopeKey, Stats,
    StrategyTable, SweepReport, Sweeper, Verdict, Whitelist,
};

/// An admission-control instance.
///
/// Instances share nothing; tests build as many as they like.
pub struct Bulwark {
    config: BulwarkConfig,
    engine: Arc<PolicyEngine>,
    sweeper: Arc<Sweeper>,
    identity: Arc<dyn IdentityProvider>,
    audit_sink: Arc<dyn AuditSink>,
    audit_rx: Mutex<Option<mpsc::Receiver<AuditEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Bulwark {
    /// Validate `config` and build every component. Nothing runs until [`Bulwark::start`].
    pub fn new(
        config: BulwarkConfig,
        audit_sink: Arc<dyn AuditSink>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(CounterStore::new(
            Escalation::new(&config.penalty),
            config.sweeper.max_entries,
        ));
        let registry = Arc::new(BlockRegistry::new());
        let detector = Arc::new(SpamDetector::new(&config.anti_spam)?);
        let whitelist = Whitelist::new(
            config.whitelist.parsed_ips()?,
            config.whitelist.roles.iter().cloned(),
        );
        let (audit, audit_rx) = AuditEmitter::channel(config.audit.channel_capacity);
        let trigger = Arc::new(Notify::new());

        let engine = Arc::new(PolicyEngine::new(
            store.clone(),
            registry.clone(),
            detector.clone(),
            StrategyTable::new(&config.limits),
            whitelist,
            audit,
            config.fail_mode,
            trigger.clone(),
        ));
        let sweeper = Arc::new(Sweeper::new(
            store,
            registry,
            detector,
            config.sweeper.clone(),
            trigger,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            engine,
            sweeper,
            identity,
            audit_sink,
            audit_rx: Mutex::new(Some(audit_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the sweeper and the audit forwarder. Calling this twice is a no-op.
    pub fn start(&self) {
        let Some(audit_rx) = self.audit_rx.lock().take() else {
            debug!("Bulwark already started");
            return;
        };

        let sweeper = self.sweeper.clone().spawn(self.shutdown_tx.subscribe());
        let forwarder = spawn_forwarder(
            audit_rx,
            self.audit_sink.clone(),
            self.shutdown_tx.subscribe(),
        );
        self.tasks.lock().extend([sweeper, forwarder]);
        info!("Bulwark started");
    }

    /// Stop background tasks, delivering any audit events still queued.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(err) = result {
                warn!(error = %err, "Background task ended abnormally");
            }
        }
        info!("Bulwark stopped");
    }

    /// Decide on an already extracted request.
    pub fn enforce(&self, request: &RequestContext) -> Verdict {
        self.engine.enforce(request)
    }

    /// Decide on a caller-described request.
    pub fn check(&self, request: AdmissionRequest) -> Verdict {
        self.engine.enforce(&RequestContext::from(request))
    }

    /// Extract, identify and decide on raw HTTP request parts.
    pub async fn admit(
        &self,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
        path: &str,
        body: impl Into<Vec<u8>>,
    ) -> Verdict {
        let identity = resolve_identity(
            self.identity.as_ref(),
            bearer_token(headers),
            self.config.identity.lookup_timeout(),
        )
        .await;
        let request = RequestContext::from_parts(
            headers,
            peer,
            path,
            body,
            self.config.server.trust_proxy_headers,
        )
        .with_identity(identity);
        self.engine.enforce(&request)
    }

    /// Report a failed operation (e.g. a rejected login) from `ip`.
    pub fn record_failure(&self, ip: IpAddr) {
        self.engine.record_failure(ip);
    }

    /// Current counter state for one key.
    pub fn counter(&self, key: &ScopeKey) -> Option<CounterEntry> {
        self.engine.store().get(key)
    }

    pub fn stats(&self) -> Stats {
        self.engine.stats()
    }

    pub fn reset(&self) {
        self.engine.reset();
    }

    /// Run a sweep pass now, outside the schedule.
    pub fn sweep_now(&self) -> Result<SweepReport> {
        self.sweeper.sweep()
    }

    pub fn config(&self) -> &BulwarkConfig {
        &self.config
    }
}
