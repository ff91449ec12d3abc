use super::{FIELD_MANAGER, Kind, RolloutTarget, container_image_patch, pod_containers_healthy};
use crate::crd::ContainerVersion;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use std::time::Duration;
use tracing::{debug, warn};

/// A bare pod. Container images are one of the few pod fields that may change in place, the
/// kubelet restarts the container with the new image.
pub struct PodTarget {
    api: Api<Pod>,
    resource: Pod,
    rollback_after: Option<Duration>,
}

impl PodTarget {
    pub fn new(api: Api<Pod>, resource: Pod, grace: Option<Duration>) -> Self {
        Self {
            api,
            resource,
            rollback_after: grace,
        }
    }

    /// Pods created by another workload are updated through that workload.
    pub fn is_bare(pod: &Pod) -> bool {
        !super::has_controller(&pod.metadata)
    }
}

#[async_trait]
impl RolloutTarget for PodTarget {
    fn name(&self) -> String {
        self.resource.name_any()
    }

    fn namespace(&self) -> String {
        self.resource.namespace().unwrap_or_default()
    }

    fn kind(&self) -> Kind {
        Kind::Pod
    }

    fn pod_spec(&self) -> PodSpec {
        self.resource.spec.clone().unwrap_or_default()
    }

    async fn patch_pod_spec(
        &self,
        cv: &ContainerVersion,
        container: &Container,
        version: &str,
    ) -> Result<()> {
        let name = self.name();
        let patch = container_image_patch(&container.name, &cv.spec.image_for(version));

        debug!("Patching Pod {} with patch {}", name, patch);
        self.api
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Strategic(&patch),
            )
            .await?;
        Ok(())
    }

    fn rollback_after(&self) -> Option<Duration> {
        self.rollback_after
    }

    async fn progress_health(&self) -> bool {
        let name = self.name();
        match self.api.get(&name).await {
            Ok(pod) => pod_healthy(&pod),
            Err(e) => {
                warn!("Failed to fetch Pod {} for health check: {}", name, e);
                false
            }
        }
    }
}

fn pod_healthy(pod: &Pod) -> bool {
    let failed = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Failed");
    !failed && pod_containers_healthy(pod)
}
