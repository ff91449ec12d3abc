//! Brings every workload matched by a ContainerVersion to the desired version.

use crate::crd::{ContainerVersion, SyncResult};
use crate::deploy::{DeployOutcome, Deployer};
use crate::error::{Error, Result};
use crate::events::{Recorder, Severity, reason};
use crate::image_reference::ImageReference;
use crate::target::{Kind, RolloutTarget, WorkloadSource};
use futures::future::join_all;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Already running the desired version, nothing was patched.
    UpToDate,
    Deployed(DeployOutcome),
    /// The initial patch failed.
    DeployFailed,
    /// The container or its current version could not be determined.
    Unresolved,
}

impl CandidateOutcome {
    pub fn is_synced(&self) -> bool {
        matches!(
            self,
            CandidateOutcome::UpToDate | CandidateOutcome::Deployed(DeployOutcome::Deployed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: Kind,
    pub name: String,
    pub outcome: CandidateOutcome,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub candidates: Vec<Candidate>,
    /// Kinds whose workloads could not be listed.
    pub list_failures: Vec<Kind>,
    pub results: Vec<SyncResult>,
}

impl SyncReport {
    /// True when every workload runs the desired version and every kind could be listed.
    pub fn all_synced(&self) -> bool {
        self.list_failures.is_empty() && self.candidates.iter().all(|c| c.outcome.is_synced())
    }

    pub fn unsynced(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| !c.outcome.is_synced())
            .count()
    }
}

pub struct VersionSynchronizer {
    source: Arc<dyn WorkloadSource>,
    deployer: Arc<dyn Deployer>,
    recorder: Arc<dyn Recorder>,
}

impl VersionSynchronizer {
    pub fn new(
        source: Arc<dyn WorkloadSource>,
        deployer: Arc<dyn Deployer>,
        recorder: Arc<dyn Recorder>,
    ) -> Self {
        Self {
            source,
            deployer,
            recorder,
        }
    }

    /// Runs one pass for `cv` over every workload kind. Failures are isolated to the kind or
    /// workload they occur in.
    pub async fn sync(&self, cv: &ContainerVersion, version: &str) -> SyncReport {
        let mut report = SyncReport::default();
        let mut mismatched: Vec<(Box<dyn RolloutTarget>, String)> = Vec::new();

        for kind in Kind::ALL {
            let targets = match self.source.list(kind, cv).await {
                Ok(targets) => targets,
                Err(e) => {
                    warn!("Failed to list {} for {}: {}", kind, cv.name_any(), e);
                    self.recorder
                        .event(
                            Severity::Warning,
                            reason::LIST_FAILED,
                            &format!("Failed to list {} workloads: {}", kind, e),
                        )
                        .await;
                    report.list_failures.push(kind);
                    continue;
                }
            };
            debug!("Found {} {} candidates for {}", targets.len(), kind, cv.name_any());

            for target in targets {
                match current_version(cv, target.as_ref()) {
                    Ok(current) if current == version => {
                        debug!(
                            "{} {} already runs version {}",
                            kind,
                            target.name(),
                            version
                        );
                        report.results.push(sync_result(cv, target.as_ref(), &current));
                        report.candidates.push(Candidate {
                            kind,
                            name: target.name(),
                            outcome: CandidateOutcome::UpToDate,
                        });
                    }
                    Ok(current) => mismatched.push((target, current)),
                    Err(e) => {
                        let name = target.name();
                        warn!("Skipping {} {}: {}", kind, name, e);
                        self.recorder.inc_count(&format!("{}.sync.failure", name));
                        self.recorder
                            .event(
                                Severity::Warning,
                                reason::CANDIDATE_FAILED,
                                &format!("{} {}: {}", kind, name, e),
                            )
                            .await;
                        report.candidates.push(Candidate {
                            kind,
                            name,
                            outcome: CandidateOutcome::Unresolved,
                        });
                    }
                }
            }
        }

        let deploys = mismatched.iter().map(|(target, current)| async move {
            info!(
                "{} {} runs version {}, deploying {}",
                target.kind(),
                target.name(),
                current,
                version
            );
            self.deployer.deploy(cv, version, target.as_ref()).await
        });
        let results = join_all(deploys).await;

        for ((target, current), result) in mismatched.iter().zip(results) {
            let (outcome, running) = match result {
                Ok(DeployOutcome::RolledBack) => (
                    CandidateOutcome::Deployed(DeployOutcome::RolledBack),
                    current.as_str(),
                ),
                // interrupted and failed rollbacks leave the new version in place
                Ok(outcome) => (CandidateOutcome::Deployed(outcome), version),
                Err(e) => {
                    warn!("Deploy to {} {} failed: {}", target.kind(), target.name(), e);
                    (CandidateOutcome::DeployFailed, current.as_str())
                }
            };
            report.results.push(sync_result(cv, target.as_ref(), running));
            report.candidates.push(Candidate {
                kind: target.kind(),
                name: target.name(),
                outcome,
            });
        }

        report
    }
}

/// Version of the ContainerVersion's container in the target, taken from its image tag.
fn current_version(cv: &ContainerVersion, target: &dyn RolloutTarget) -> Result<String> {
    let pod_spec = target.pod_spec();
    let container = pod_spec
        .containers
        .iter()
        .find(|c| c.name == cv.spec.container)
        .ok_or_else(|| Error::ContainerNotFound {
            kind: target.kind(),
            name: target.name(),
            container: cv.spec.container.clone(),
        })?;
    let image = container.image.as_deref().unwrap_or_default();
    Ok(ImageReference::version_of(image)?)
}

fn sync_result(cv: &ContainerVersion, target: &dyn RolloutTarget, version: &str) -> SyncResult {
    SyncResult {
        namespace: target.namespace(),
        name: target.name(),
        kind: target.kind().to_string(),
        container: cv.spec.container.clone(),
        version: version.to_string(),
        container_version: cv.name_any(),
        tag: cv.spec.tag.clone(),
    }
}
