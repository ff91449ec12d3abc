use super::{FIELD_MANAGER, Kind, RolloutTarget};
use crate::crd::ContainerVersion;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, ResourceExt};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Labels the job controller stamps on its pods and its generated selector. They carry the uid
/// of the old job and must not survive into the replacement.
static GENERATED_LABELS: [&str; 2] = ["controller-uid", "batch.kubernetes.io/controller-uid"];

/// Run-to-completion workloads. A job's pod template is immutable, so a new version means
/// deleting the job and creating it again with the new image.
pub struct JobTarget {
    api: Api<Job>,
    resource: Job,
    rollback_after: Option<Duration>,
}

impl JobTarget {
    pub fn new(api: Api<Job>, resource: Job, grace: Option<Duration>) -> Self {
        Self {
            api,
            resource,
            rollback_after: grace,
        }
    }

    /// Jobs a CronJob (or any other controller) created are left to that controller.
    pub fn is_standalone(job: &Job) -> bool {
        !super::has_controller(&job.metadata)
    }

    async fn create(&self, job: &Job) -> Result<()> {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api.create(&params, job).await?;
        Ok(())
    }

    /// Puts the job as it was before the delete back. Used when its replacement was refused.
    async fn restore(&self, name: &str) {
        match self.create(&fresh_job(&self.resource)).await {
            Ok(()) => info!("Restored Job {} with its previous spec", name),
            Err(e) => error!("Failed to restore Job {} after a refused replacement: {}", name, e),
        }
    }

    async fn delete_existing(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => match Error::from(e) {
                err if err.is_not_found() => {
                    debug!("Job {} already gone", name);
                    Ok(())
                }
                err => Err(err),
            },
        }
    }
}

fn strip_generated_labels(labels: &mut Option<BTreeMap<String, String>>) {
    if let Some(labels) = labels.as_mut() {
        for key in GENERATED_LABELS {
            labels.remove(key);
        }
    }
}

/// `job` as it can be submitted again: same spec, without anything the API server or the job
/// controller filled in.
fn fresh_job(job: &Job) -> Job {
    let mut metadata = ObjectMeta {
        name: job.metadata.name.clone(),
        namespace: job.metadata.namespace.clone(),
        labels: job.metadata.labels.clone(),
        annotations: job.metadata.annotations.clone(),
        ..Default::default()
    };
    strip_generated_labels(&mut metadata.labels);

    let mut spec = job.spec.clone().unwrap_or_default();
    spec.selector = None;
    spec.manual_selector = None;
    if let Some(template_metadata) = spec.template.metadata.as_mut() {
        strip_generated_labels(&mut template_metadata.labels);
    }

    Job {
        metadata,
        spec: Some(spec),
        status: None,
    }
}

/// The job to create in place of `job`, with `container` on `image`.
pub(crate) fn replacement_job(job: &Job, container: &str, image: &str) -> Job {
    let mut replacement = fresh_job(job);
    if let Some(pod_spec) = replacement
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
    {
        pod_spec
            .containers
            .iter_mut()
            .filter(|c| c.name == container)
            .for_each(|c| c.image = Some(image.to_string()));
    }
    replacement
}

#[async_trait]
impl RolloutTarget for JobTarget {
    fn name(&self) -> String {
        self.resource.name_any()
    }

    fn namespace(&self) -> String {
        self.resource.namespace().unwrap_or_default()
    }

    fn kind(&self) -> Kind {
        Kind::Job
    }

    fn pod_spec(&self) -> PodSpec {
        self.resource
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.clone())
            .unwrap_or_default()
    }

    // A 409 from create means the old job is still terminating; it surfaces as a conflict and
    // the caller's retry repeats delete and create. Any other refusal puts the old job back.
    async fn patch_pod_spec(
        &self,
        cv: &ContainerVersion,
        container: &Container,
        version: &str,
    ) -> Result<()> {
        let name = self.name();
        let job = replacement_job(&self.resource, &container.name, &cv.spec.image_for(version));

        info!("Recreating Job {} with version {}", name, version);
        self.delete_existing(&name).await?;
        match self.create(&job).await {
            Err(e) if !e.is_conflict() => {
                warn!("Failed to create Job {} with version {}: {}", name, version, e);
                self.restore(&name).await;
                Err(e)
            }
            result => result,
        }
    }

    fn rollback_after(&self) -> Option<Duration> {
        self.rollback_after
    }

    async fn progress_health(&self) -> bool {
        let name = self.name();
        match self.api.get(&name).await {
            Ok(job) => job_healthy(&job),
            Err(e) => {
                warn!("Failed to fetch Job {} for health check: {}", name, e);
                false
            }
        }
    }
}

fn job_healthy(job: &Job) -> bool {
    let Some(status) = job.status.as_ref() else {
        return true;
    };
    let failed_condition = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Failed" && c.status == "True");
    !failed_condition && status.failed.unwrap_or(0) == 0
}
