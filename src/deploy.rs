//! Deploy strategies.
//!
//! [`SimpleDeployer`] patches the target's pod spec to the new version and leaves the rolling
//! to the workload's own controller. With rollback enabled it waits for the target's grace
//! period, checks health, and patches the previous version back when the target is unhealthy.
//!
//! Only a failed initial patch is returned as an error. Rollback and history problems are
//! reported through events and counters.

use crate::crd::ContainerVersion;
use crate::error::{Error, Result};
use crate::events::{Recorder, Severity, reason};
use crate::history::{HistoryProvider, Record};
use crate::image_reference::ImageReference;
use crate::retry::{RetryPolicy, retry_on_conflict};
use crate::target::RolloutTarget;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Container;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How a deploy attempt that applied its patch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The new version is running and, if checked, healthy.
    Deployed,
    /// The target was unhealthy and now runs the previous version again.
    RolledBack,
    /// The target was unhealthy and patching the previous version back failed.
    RollbackFailed,
    /// Shutdown arrived during the rollback wait; health was never checked.
    Interrupted,
}

/// A rollout strategy.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Roll `target` to `version` of the ContainerVersion's image.
    async fn deploy(
        &self,
        cv: &ContainerVersion,
        version: &str,
        target: &dyn RolloutTarget,
    ) -> Result<DeployOutcome>;
}

#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub conflict_retry: RetryPolicy,
    pub record_history: bool,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            conflict_retry: RetryPolicy::conflict(),
            record_history: true,
        }
    }
}

pub struct SimpleDeployer {
    namespace: String,
    history: Arc<dyn HistoryProvider>,
    recorder: Arc<dyn Recorder>,
    options: DeployOptions,
    shutdown: CancellationToken,
}

impl SimpleDeployer {
    pub fn new(
        namespace: &str,
        history: Arc<dyn HistoryProvider>,
        recorder: Arc<dyn Recorder>,
        options: DeployOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            history,
            recorder,
            options,
            shutdown,
        }
    }

    async fn patch(
        &self,
        cv: &ContainerVersion,
        target: &dyn RolloutTarget,
        container: &Container,
        version: &str,
    ) -> Result<()> {
        let operation = format!("patch {} {}", target.kind(), target.name());
        retry_on_conflict(&self.options.conflict_retry, &operation, move || {
            target.patch_pod_spec(cv, container, version)
        })
        .await
    }

    /// Waits out the grace period and reverts the target when it comes back unhealthy.
    async fn verify(
        &self,
        cv: &ContainerVersion,
        version: &str,
        target: &dyn RolloutTarget,
        container: &Container,
    ) -> DeployOutcome {
        let name = target.name();
        let grace = match target.rollback_after() {
            Some(grace) if cv.spec.rollback_enabled => grace,
            _ => return DeployOutcome::Deployed,
        };

        info!(
            "Waiting {:?} before checking health of {} {}",
            grace,
            target.kind(),
            name
        );
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                warn!("Shutting down, abandoning health check of {} {}", target.kind(), name);
                return DeployOutcome::Interrupted;
            }
            _ = tokio::time::sleep(grace) => {}
        }

        if target.progress_health().await {
            info!("{} {} is healthy on version {}", target.kind(), name, version);
            return DeployOutcome::Deployed;
        }

        let image = container.image.as_deref().unwrap_or_default();
        let previous = match ImageReference::version_of(image) {
            Ok(previous) => previous,
            Err(e) => {
                warn!(
                    "Cannot roll back {} {}, previous image {} has no version: {}",
                    target.kind(),
                    name,
                    image,
                    e
                );
                return DeployOutcome::RollbackFailed;
            }
        };

        warn!(
            "{} {} is unhealthy on version {}, rolling back to {}",
            target.kind(),
            name,
            version,
            previous
        );
        match self.patch(cv, target, container, &previous).await {
            Ok(()) => DeployOutcome::RolledBack,
            Err(e) => {
                warn!(
                    "Failed to roll back {} {} from version {} to {}: {}",
                    target.kind(),
                    name,
                    version,
                    previous,
                    e
                );
                DeployOutcome::RollbackFailed
            }
        }
    }

    async fn report(&self, outcome: DeployOutcome, version: &str, target: &dyn RolloutTarget) {
        let name = target.name();
        match outcome {
            DeployOutcome::Deployed => {
                if self.options.record_history {
                    let record = Record {
                        kind: target.kind().to_string(),
                        name: name.clone(),
                        version: version.to_string(),
                        time: Utc::now(),
                    };
                    if let Err(e) = self.history.add(&self.namespace, &name, &record).await {
                        warn!("Failed to record history of {}: {}", name, e);
                        self.recorder
                            .inc_count(&format!("{}.history.save.failure", name));
                        self.recorder
                            .event(
                                Severity::Warning,
                                reason::SAVE_HISTORY_FAILED,
                                "Failed to record update history",
                            )
                            .await;
                    }
                }

                info!("Update completed: target={}", name);
                self.recorder.inc_count(&format!("{}.sync.success", name));
                self.recorder
                    .event(
                        Severity::Normal,
                        reason::SUCCESS,
                        &format!("Updated {} {} to version {}", target.kind(), name, version),
                    )
                    .await;
            }
            DeployOutcome::RolledBack => {
                self.recorder
                    .inc_count(&format!("{}.rollback.success", name));
                self.recorder
                    .event(
                        Severity::Warning,
                        reason::ROLLED_BACK,
                        &format!(
                            "{} {} was unhealthy on version {} and has been rolled back",
                            target.kind(),
                            name,
                            version
                        ),
                    )
                    .await;
            }
            DeployOutcome::RollbackFailed => {
                self.recorder
                    .inc_count(&format!("{}.rollback.failure", name));
                self.recorder
                    .event(
                        Severity::Warning,
                        reason::ROLLBACK_FAILED,
                        &format!(
                            "{} {} is unhealthy on version {} and could not be rolled back",
                            target.kind(),
                            name,
                            version
                        ),
                    )
                    .await;
            }
            DeployOutcome::Interrupted => {
                self.recorder
                    .event(
                        Severity::Warning,
                        reason::DEPLOY_INTERRUPTED,
                        &format!(
                            "Health check of {} {} on version {} abandoned during shutdown",
                            target.kind(),
                            name,
                            version
                        ),
                    )
                    .await;
            }
        }
    }
}

#[async_trait]
impl Deployer for SimpleDeployer {
    async fn deploy(
        &self,
        cv: &ContainerVersion,
        version: &str,
        target: &dyn RolloutTarget,
    ) -> Result<DeployOutcome> {
        let name = target.name();
        info!(
            "Performing simple deployment on {} {} with version {}",
            target.kind(),
            name,
            version
        );

        let pod_spec = target.pod_spec();
        let Some(container) = pod_spec
            .containers
            .iter()
            .find(|c| c.name == cv.spec.container)
        else {
            return Err(Error::ContainerNotFound {
                kind: target.kind(),
                name,
                container: cv.spec.container.clone(),
            });
        };

        if let Err(e) = self.patch(cv, target, container, version).await {
            let err = Error::PatchFailed {
                kind: target.kind(),
                name: name.clone(),
                source: Box::new(e),
            };
            warn!(
                "Failed to update container version after maximum retries: version={}, target={}, error={}",
                version, name, err
            );
            self.recorder.inc_count(&format!("{}.sync.failure", name));
            self.recorder
                .event(
                    Severity::Warning,
                    reason::SYNC_FAILED,
                    &format!("Failed to deploy version {} to {}: {}", version, name, err),
                )
                .await;
            return Err(err);
        }

        let outcome = self.verify(cv, version, target, container).await;
        self.report(outcome, version, target).await;
        Ok(outcome)
    }
}
