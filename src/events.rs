//! Event and counter emission.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder as EventPublisher, Reporter};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub static REPORTER: &str = "kube-autodeploy";

pub mod reason {
    pub const SUCCESS: &str = "Success";
    pub const SYNC_FAILED: &str = "SyncFailed";
    pub const CANDIDATE_FAILED: &str = "CandidateFailed";
    pub const LIST_FAILED: &str = "ListFailed";
    pub const SAVE_HISTORY_FAILED: &str = "SaveHistoryFailed";
    pub const ROLLED_BACK: &str = "RolledBack";
    pub const ROLLBACK_FAILED: &str = "RollbackFailed";
    pub const DEPLOY_INTERRUPTED: &str = "DeployInterrupted";
    pub const SIGN_OFF_REJECTED: &str = "SignOffRejected";
    pub const PROMOTE_FAILED: &str = "PromoteFailed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Normal => f.write_str("Normal"),
            Severity::Warning => f.write_str("Warning"),
        }
    }
}

/// Sink for operator-visible outcomes. Implementations must be callable from concurrent deploy
/// attempts.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn event(&self, severity: Severity, reason: &str, message: &str);

    fn inc_count(&self, metric: &str);
}

/// In-process counters, shared between recorders and served by the web server.
#[derive(Debug, Default)]
pub struct Counters {
    values: Mutex<BTreeMap<String, u64>>,
}

#[derive(Debug, Serialize)]
pub struct CounterSnapshot(BTreeMap<String, u64>);

impl Counters {
    pub fn inc(&self, metric: &str) {
        match self.values.lock() {
            Ok(mut values) => *values.entry(metric.to_string()).or_default() += 1,
            Err(poisoned) => *poisoned.into_inner().entry(metric.to_string()).or_default() += 1,
        }
    }

    pub fn get(&self, metric: &str) -> u64 {
        self.snapshot().0.get(metric).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let values = match self.values.lock() {
            Ok(values) => values.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        CounterSnapshot(values)
    }
}

/// Publishes Kubernetes events against one ContainerVersion and counts into [`Counters`].
pub struct KubeRecorder {
    publisher: EventPublisher,
    reference: ObjectReference,
    counters: Arc<Counters>,
}

impl KubeRecorder {
    pub fn new(client: Client, reference: ObjectReference, counters: Arc<Counters>) -> Self {
        let reporter = Reporter {
            controller: REPORTER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            publisher: EventPublisher::new(client, reporter),
            reference,
            counters,
        }
    }
}

#[async_trait]
impl Recorder for KubeRecorder {
    async fn event(&self, severity: Severity, reason: &str, message: &str) {
        let object = self.reference.name.as_deref().unwrap_or_default();
        info!(severity = %severity, reason = reason, object = object, "{}", message);

        let event = Event {
            type_: match severity {
                Severity::Normal => EventType::Normal,
                Severity::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Deploy".to_string(),
            secondary: None,
        };
        if let Err(e) = self.publisher.publish(&event, &self.reference).await {
            warn!("Failed to publish {} event for {}: {}", reason, object, e);
        }
    }

    fn inc_count(&self, metric: &str) {
        self.counters.inc(metric);
    }
}
