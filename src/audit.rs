//! Fire-and-forget audit emission for rejected requests.
//!
//! The policy engine hands events to a bounded channel with `try_send`, so a
//! slow or failing sink can never stall an admission decision. A forwarder
//! task drains the channel into the configured [`AuditSink`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ratelimit::{ScopeKey, ViolationType};

/// Errors reported by audit sinks.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("sink error: {0}")]
    Sink(String),
}

/// What happened to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A strategy was exceeded
    RateLimitViolation,
    /// An anti-spam rule matched
    SpamDetected,
    /// The key was already blocked
    BlockedRequest,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::RateLimitViolation => "rate_limit_violation",
            AuditEventType::SpamDetected => "spam_detected",
            AuditEventType::BlockedRequest => "blocked_request",
        }
    }
}

/// A structured violation event.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub event_type: AuditEventType,
    pub scope_key: ScopeKey,
    pub violation_type: ViolationType,
    pub risk_score: u8,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        scope_key: ScopeKey,
        violation_type: ViolationType,
        violations: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            scope_key,
            violation_type,
            risk_score: risk_score(violation_type, violations),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Risk on a 0-100 scale: a base per violation type plus 5 per prior violation.
pub fn risk_score(violation_type: ViolationType, violations: u32) -> u8 {
    let base: u32 = match violation_type {
        ViolationType::SpamDetection => 80,
        ViolationType::IpLimit | ViolationType::UserLimit | ViolationType::RateLimit => 50,
        ViolationType::EndpointLimit => 40,
        ViolationType::GlobalLimit => 20,
    };
    let repeat = violations.saturating_sub(1).saturating_mul(5);
    base.saturating_add(repeat).min(100) as u8
}

/// Receives audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Writes events as structured tracing records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        info!(
            target: "bulwark::audit",
            event_id = %event.event_id,
            event_type = event.event_type.as_str(),
            scope_key = %event.scope_key,
            violation_type = %event.violation_type,
            risk_score = event.risk_score,
            reason = %event.reason,
            timestamp = %event.timestamp.to_rfc3339(),
            "Audit event"
        );
        Ok(())
    }
}

/// Keeps events in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Sending half handed to the policy engine.
#[derive(Debug, Clone)]
pub struct AuditEmitter {
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditEmitter {
    /// Create an emitter and the receiver its forwarder drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an event without waiting. Dropped if the buffer is full.
    pub fn emit(&self, event: AuditEvent) {
        if let Err(err) = self.tx.try_send(event) {
            warn!(error = %err, "Audit event dropped");
        }
    }
}

/// Deliver queued events to `sink` until shutdown, then drain what is left.
pub fn spawn_forwarder(
    mut rx: mpsc::Receiver<AuditEvent>,
    sink: Arc<dyn AuditSink>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Audit forwarder started");
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => deliver(sink.as_ref(), event).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    while let Ok(event) = rx.try_recv() {
                        deliver(sink.as_ref(), event).await;
                    }
                    break;
                }
            }
        }
        debug!("Audit forwarder stopped");
    })
}

async fn deliver(sink: &dyn AuditSink, event: AuditEvent) {
    let event_id = event.event_id;
    if let Err(err) = sink.record(event).await {
        warn!(event_id = %event_id, error = %err, "Audit sink failed");
    }
}
