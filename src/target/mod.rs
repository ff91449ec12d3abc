//! Rollout targets: one handle per running workload that can read and patch its pod spec.
//!
//! Every workload kind the controller manages is a variant of [`Workload`]. Template-managed
//! kinds share [`TemplateTarget`] and additionally implement [`TemplateRolloutTarget`]; jobs and
//! bare pods have their own patch strategies.

mod job;
mod pod;
mod source;
mod template;

pub use job::JobTarget;
pub use pod::PodTarget;
pub use source::{KubeWorkloadSource, WorkloadSource};
pub use template::{TemplateTarget, WorkloadKind};

#[cfg(test)]
pub use source::MockWorkloadSource;

use crate::crd::ContainerVersion;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

pub(crate) static FIELD_MANAGER: &str = "kube-autodeploy";

/// Waiting reasons that mean a container will not come up without intervention.
static FAILING_WAITING_REASONS: [&str; 3] = ["CrashLoopBackOff", "ImagePullBackOff", "ErrImagePull"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    Pod,
}

impl Kind {
    pub const ALL: [Kind; 5] = [
        Kind::Deployment,
        Kind::StatefulSet,
        Kind::DaemonSet,
        Kind::Job,
        Kind::Pod,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Deployment => "Deployment",
            Kind::StatefulSet => "StatefulSet",
            Kind::DaemonSet => "DaemonSet",
            Kind::Job => "Job",
            Kind::Pod => "Pod",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something deployable: a Deployment, DaemonSet, Job, Pod and so on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RolloutTarget: Send + Sync {
    /// Name of the workload, without the namespace.
    fn name(&self) -> String;

    fn namespace(&self) -> String;

    fn kind(&self) -> Kind;

    /// Pod spec as it was when the workload was fetched.
    fn pod_spec(&self) -> PodSpec;

    /// Point `container` at `<imageRepo>:<version>` using the strategy of this kind.
    async fn patch_pod_spec(
        &self,
        cv: &ContainerVersion,
        container: &Container,
        version: &str,
    ) -> Result<()>;

    /// How long to wait after a patch before checking health. `None` disables rollback.
    fn rollback_after(&self) -> Option<Duration>;

    /// Fetches the live workload and reports whether its rollout is progressing healthily.
    async fn progress_health(&self) -> bool;
}

/// Workloads that manage a set of pods through a pod template.
#[async_trait]
pub trait TemplateRolloutTarget: RolloutTarget {
    fn pod_template_spec(&self) -> PodTemplateSpec;

    /// All workloads of the same kind in this namespace matching `selector`, possibly including
    /// this one.
    async fn select(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Workload>>;

    /// The subset of `pods` managed by this workload.
    fn select_own_pods(&self, pods: &[Pod]) -> Vec<Pod>;

    fn num_replicas(&self) -> i32;

    async fn patch_num_replicas(&self, replicas: i32) -> Result<()>;
}

/// The closed set of workload kinds.
pub enum Workload {
    Deployment(TemplateTarget<Deployment>),
    StatefulSet(TemplateTarget<StatefulSet>),
    DaemonSet(TemplateTarget<DaemonSet>),
    Job(JobTarget),
    Pod(PodTarget),
}

impl Workload {
    fn inner(&self) -> &dyn RolloutTarget {
        match self {
            Workload::Deployment(target) => target,
            Workload::StatefulSet(target) => target,
            Workload::DaemonSet(target) => target,
            Workload::Job(target) => target,
            Workload::Pod(target) => target,
        }
    }
}

#[async_trait]
impl RolloutTarget for Workload {
    fn name(&self) -> String {
        self.inner().name()
    }

    fn namespace(&self) -> String {
        self.inner().namespace()
    }

    fn kind(&self) -> Kind {
        self.inner().kind()
    }

    fn pod_spec(&self) -> PodSpec {
        self.inner().pod_spec()
    }

    async fn patch_pod_spec(
        &self,
        cv: &ContainerVersion,
        container: &Container,
        version: &str,
    ) -> Result<()> {
        self.inner().patch_pod_spec(cv, container, version).await
    }

    fn rollback_after(&self) -> Option<Duration> {
        self.inner().rollback_after()
    }

    async fn progress_health(&self) -> bool {
        self.inner().progress_health().await
    }
}

/// `key1=value1,key2=value2`, the form list calls expect.
pub(crate) fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// True when another workload (a ReplicaSet, a CronJob) controls the object. Such objects are
/// updated through their controller.
pub(crate) fn has_controller(metadata: &ObjectMeta) -> bool {
    metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.controller == Some(true))
}

/// Strategic merge body that sets only the image of one container in a pod spec.
pub(crate) fn container_image_patch(container: &str, image: &str) -> Value {
    json!({
        "spec": {
            "containers": [
                { "name": container, "image": image }
            ]
        }
    })
}

/// Same as [`container_image_patch`], nested under `spec.template`.
pub(crate) fn template_image_patch(container: &str, image: &str) -> Value {
    json!({ "spec": { "template": container_image_patch(container, image) } })
}

/// True when no container of the pod is stuck in a failing waiting state.
pub(crate) fn pod_containers_healthy(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return true;
    };
    status
        .container_statuses
        .iter()
        .flatten()
        .chain(status.init_container_statuses.iter().flatten())
        .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
        .all(|reason| !FAILING_WAITING_REASONS.contains(&reason))
}


#[cfg(test)]
mod tests {
    use super::fixtures::pod;
    use super::*;

    #[test]
    fn test_template_patch_touches_only_the_image() {
        let patch = template_image_patch("app", "registry/app:v2");
        assert_eq!(
            patch,
            json!({
                "spec": { "template": { "spec": { "containers": [
                    { "name": "app", "image": "registry/app:v2" }
                ]}}}
            })
        );
    }

    #[test]
    fn test_crash_looping_pod_is_unhealthy() {
        assert!(pod_containers_healthy(&pod("a", &[], None)));
        assert!(pod_containers_healthy(&pod("a", &[], Some("ContainerCreating"))));
        assert!(!pod_containers_healthy(&pod("a", &[], Some("CrashLoopBackOff"))));
        assert!(!pod_containers_healthy(&pod("a", &[], Some("ErrImagePull"))));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(Kind::DaemonSet.to_string(), "DaemonSet");
        assert_eq!(Kind::ALL.len(), 5);
    }
}
