use super::{
    FIELD_MANAGER, Kind, RolloutTarget, TemplateRolloutTarget, Workload, label_selector,
    pod_containers_healthy, template_image_patch,
};
use crate::crd::ContainerVersion;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodTemplateSpec};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Kind-specific accessors of a workload that manages pods through a pod template.
pub trait WorkloadKind
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static,
{
    const KIND: Kind;

    fn template(&self) -> Option<&PodTemplateSpec>;

    fn selector(&self) -> BTreeMap<String, String>;

    fn replicas(&self) -> i32;

    /// Merge patch that scales the workload, or `None` when the kind has no replica count.
    fn replicas_patch(replicas: i32) -> Option<Value> {
        Some(json!({ "spec": { "replicas": replicas } }))
    }

    /// Default rollback grace when the ContainerVersion does not set one.
    fn progress_deadline(&self) -> Option<Duration> {
        None
    }

    /// Reports whether the controller for this kind has finished rolling out the current spec.
    fn rollout_healthy(&self) -> bool;

    fn into_workload(target: TemplateTarget<Self>) -> Workload;
}

fn generation_observed(generation: Option<i64>, observed: Option<i64>) -> bool {
    match (generation, observed) {
        (Some(generation), Some(observed)) => observed >= generation,
        (None, _) => true,
        (Some(_), None) => false,
    }
}

impl WorkloadKind for Deployment {
    const KIND: Kind = Kind::Deployment;

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn selector(&self) -> BTreeMap<String, String> {
        self.spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default()
    }

    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/deployment-v1/#DeploymentSpec
    fn replicas(&self) -> i32 {
        self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
    }

    fn progress_deadline(&self) -> Option<Duration> {
        self.spec
            .as_ref()
            .and_then(|s| s.progress_deadline_seconds)
            .and_then(|secs| u64::try_from(secs).ok())
            .map(Duration::from_secs)
    }

    //https://kubernetes.io/docs/concepts/workloads/controllers/deployment/#failed-deployment
    fn rollout_healthy(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        let deadline_exceeded = status.conditions.iter().flatten().any(|c| {
            c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
        });
        let desired = self.replicas();

        !deadline_exceeded
            && generation_observed(self.metadata.generation, status.observed_generation)
            && status.updated_replicas.unwrap_or(0) >= desired
            && status.available_replicas.unwrap_or(0) >= desired
    }

    fn into_workload(target: TemplateTarget<Self>) -> Workload {
        Workload::Deployment(target)
    }
}

impl WorkloadKind for StatefulSet {
    const KIND: Kind = Kind::StatefulSet;

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn selector(&self) -> BTreeMap<String, String> {
        self.spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default()
    }

    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/stateful-set-v1/#StatefulSetSpec
    fn replicas(&self) -> i32 {
        self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
    }

    fn rollout_healthy(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        let desired = self.replicas();

        generation_observed(self.metadata.generation, status.observed_generation)
            && status.updated_replicas.unwrap_or(0) >= desired
            && status.ready_replicas.unwrap_or(0) >= desired
    }

    fn into_workload(target: TemplateTarget<Self>) -> Workload {
        Workload::StatefulSet(target)
    }
}

impl WorkloadKind for DaemonSet {
    const KIND: Kind = Kind::DaemonSet;

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn selector(&self) -> BTreeMap<String, String> {
        self.spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default()
    }

    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/daemon-set-v1/#DaemonSetStatus
    fn replicas(&self) -> i32 {
        self.status
            .as_ref()
            .map(|s| s.desired_number_scheduled)
            .unwrap_or(0)
    }

    // one pod per node, there is nothing to scale
    fn replicas_patch(_replicas: i32) -> Option<Value> {
        None
    }

    fn rollout_healthy(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };

        generation_observed(self.metadata.generation, status.observed_generation)
            && status.updated_number_scheduled.unwrap_or(0) >= status.desired_number_scheduled
            && status.number_unavailable.unwrap_or(0) == 0
    }

    fn into_workload(target: TemplateTarget<Self>) -> Workload {
        Workload::DaemonSet(target)
    }
}

/// Rollout target for Deployments, StatefulSets and DaemonSets. Patches the pod template in
/// place and lets the workload's own controller roll the pods.
pub struct TemplateTarget<K: WorkloadKind> {
    api: Api<K>,
    pods: Api<Pod>,
    resource: K,
    rollback_after: Option<Duration>,
}

impl<K: WorkloadKind> TemplateTarget<K> {
    pub fn new(api: Api<K>, pods: Api<Pod>, resource: K, grace: Option<Duration>) -> Self {
        let rollback_after = grace.or_else(|| resource.progress_deadline());
        Self {
            api,
            pods,
            resource,
            rollback_after,
        }
    }

    pub async fn list(
        api: &Api<K>,
        pods: &Api<Pod>,
        params: &ListParams,
        grace: Option<Duration>,
    ) -> Result<Vec<Self>> {
        let list = api.list(params).await?;
        debug!("Found {} {} candidates", list.items.len(), K::KIND);
        Ok(list
            .items
            .into_iter()
            .map(|resource| Self::new(api.clone(), pods.clone(), resource, grace))
            .collect())
    }

    async fn own_pods_healthy(&self, live: &K) -> bool {
        let selector = live.selector();
        if selector.is_empty() {
            return true;
        }
        let params = ListParams::default().labels(&label_selector(&selector));
        match self.pods.list(&params).await {
            Ok(pods) => self
                .select_own_pods(&pods.items)
                .iter()
                .all(pod_containers_healthy),
            Err(e) => {
                warn!(
                    "Failed to list pods of {} {}: {}",
                    K::KIND,
                    self.resource.name_any(),
                    e
                );
                false
            }
        }
    }
}

fn labels_match(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    !selector.is_empty() && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[async_trait]
impl<K: WorkloadKind> RolloutTarget for TemplateTarget<K> {
    fn name(&self) -> String {
        self.resource.name_any()
    }

    fn namespace(&self) -> String {
        self.resource.namespace().unwrap_or_default()
    }

    fn kind(&self) -> Kind {
        K::KIND
    }

    fn pod_spec(&self) -> PodSpec {
        self.pod_template_spec().spec.unwrap_or_default()
    }

    async fn patch_pod_spec(
        &self,
        cv: &ContainerVersion,
        container: &Container,
        version: &str,
    ) -> Result<()> {
        let name = self.name();
        let patch = template_image_patch(&container.name, &cv.spec.image_for(version));

        debug!("Patching {} {} with patch {}", K::KIND, name, patch);
        self.api
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Strategic(&patch),
            )
            .await?;
        info!(
            "Patched {} {} container {} to version {}",
            K::KIND,
            name,
            container.name,
            version
        );
        Ok(())
    }

    fn rollback_after(&self) -> Option<Duration> {
        self.rollback_after
    }

    async fn progress_health(&self) -> bool {
        let name = self.name();
        let live = match self.api.get(&name).await {
            Ok(live) => live,
            Err(e) => {
                warn!("Failed to fetch {} {} for health check: {}", K::KIND, name, e);
                return false;
            }
        };
        if !live.rollout_healthy() {
            info!("{} {} has not completed its rollout", K::KIND, name);
            return false;
        }
        self.own_pods_healthy(&live).await
    }
}

#[async_trait]
impl<K: WorkloadKind> TemplateRolloutTarget for TemplateTarget<K> {
    fn pod_template_spec(&self) -> PodTemplateSpec {
        self.resource.template().cloned().unwrap_or_default()
    }

    async fn select(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Workload>> {
        let params = ListParams::default().labels(&label_selector(selector));
        let targets = Self::list(&self.api, &self.pods, &params, self.rollback_after).await?;
        Ok(targets.into_iter().map(K::into_workload).collect())
    }

    fn select_own_pods(&self, pods: &[Pod]) -> Vec<Pod> {
        let selector = self.resource.selector();
        let namespace = self.resource.namespace();
        let no_labels = BTreeMap::new();
        pods.iter()
            .filter(|pod| pod.metadata.namespace == namespace)
            .filter(|pod| labels_match(&selector, pod.metadata.labels.as_ref().unwrap_or(&no_labels)))
            .cloned()
            .collect()
    }

    fn num_replicas(&self) -> i32 {
        self.resource.replicas()
    }

    async fn patch_num_replicas(&self, replicas: i32) -> Result<()> {
        let patch = K::replicas_patch(replicas).ok_or(Error::Unsupported("replica patch"))?;
        let name = self.name();
        debug!("Scaling {} {} to {} replicas", K::KIND, name, replicas);
        self.api
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}
