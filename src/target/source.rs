use super::{JobTarget, Kind, PodTarget, RolloutTarget, TemplateTarget, WorkloadKind, label_selector};
use crate::crd::ContainerVersion;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Lists the workloads of one kind that a ContainerVersion applies to.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadSource: Send + Sync {
    async fn list(&self, kind: Kind, cv: &ContainerVersion) -> Result<Vec<Box<dyn RolloutTarget>>>;
}

/// Workloads in the ContainerVersion's namespace, matched by its selector, or by its name when
/// it has none.
pub fn list_params(cv: &ContainerVersion) -> ListParams {
    match cv.spec.selector.as_ref().filter(|s| !s.is_empty()) {
        Some(selector) => ListParams::default().labels(&label_selector(selector)),
        None => ListParams::default().fields(&format!("metadata.name={}", cv.name_any())),
    }
}

pub struct KubeWorkloadSource {
    client: Client,
}

impl KubeWorkloadSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn templates<K: WorkloadKind>(
        &self,
        namespace: &str,
        cv: &ContainerVersion,
    ) -> Result<Vec<Box<dyn RolloutTarget>>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let targets =
            TemplateTarget::list(&api, &pods, &list_params(cv), cv.spec.rollback_grace()).await?;
        Ok(targets
            .into_iter()
            .map(|target| Box::new(K::into_workload(target)) as Box<dyn RolloutTarget>)
            .collect())
    }
}

#[async_trait]
impl WorkloadSource for KubeWorkloadSource {
    async fn list(&self, kind: Kind, cv: &ContainerVersion) -> Result<Vec<Box<dyn RolloutTarget>>> {
        let namespace = cv.namespace().unwrap_or_else(|| self.client.default_namespace().to_string());
        let grace = cv.spec.rollback_grace();

        match kind {
            Kind::Deployment => self.templates::<Deployment>(&namespace, cv).await,
            Kind::StatefulSet => self.templates::<StatefulSet>(&namespace, cv).await,
            Kind::DaemonSet => self.templates::<DaemonSet>(&namespace, cv).await,
            Kind::Job => {
                let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
                let jobs = api.list(&list_params(cv)).await?;
                let (standalone, owned): (Vec<_>, Vec<_>) =
                    jobs.items.into_iter().partition(JobTarget::is_standalone);
                if !owned.is_empty() {
                    debug!(
                        "Ignoring {} jobs managed by other workloads for {}",
                        owned.len(),
                        cv.name_any()
                    );
                }
                Ok(standalone
                    .into_iter()
                    .map(|job| {
                        Box::new(super::Workload::Job(JobTarget::new(api.clone(), job, grace)))
                            as Box<dyn RolloutTarget>
                    })
                    .collect())
            }
            Kind::Pod => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
                let pods = api.list(&list_params(cv)).await?;
                let (bare, owned): (Vec<_>, Vec<_>) =
                    pods.items.into_iter().partition(PodTarget::is_bare);
                if !owned.is_empty() {
                    debug!(
                        "Ignoring {} pods managed by other workloads for {}",
                        owned.len(),
                        cv.name_any()
                    );
                }
                Ok(bare
                    .into_iter()
                    .map(|pod| {
                        Box::new(super::Workload::Pod(PodTarget::new(api.clone(), pod, grace)))
                            as Box<dyn RolloutTarget>
                    })
                    .collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ContainerVersionSpec;
    use crate::target::fixtures::{fake_api, labels};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    fn cv(selector: Option<&[(&str, &str)]>) -> ContainerVersion {
        let mut cv = ContainerVersion::new(
            "web",
            ContainerVersionSpec {
                container: "app".to_string(),
                image_repo: "registry/app".to_string(),
                tag: "v2".to_string(),
                selector: selector.map(labels),
                rollback_enabled: false,
                rollback_grace_seconds: None,
                promote_tags: vec![],
            },
        );
        cv.metadata.namespace = Some("default".to_string());
        cv
    }

    #[test]
    fn test_selector_is_used_for_matching() {
        let params = list_params(&cv(Some(&[("app", "web"), ("tier", "fe")])));
        assert_eq!(params.label_selector.as_deref(), Some("app=web,tier=fe"));
        assert_eq!(params.field_selector, None);
    }

    #[test]
    fn test_name_is_used_without_selector() {
        for cv in [cv(None), cv(Some(&[]))] {
            let params = list_params(&cv);
            assert_eq!(params.field_selector.as_deref(), Some("metadata.name=web"));
            assert_eq!(params.label_selector, None);
        }
    }

    #[tokio::test]
    async fn test_jobs_owned_by_a_cron_job_are_not_listed() {
        let job = |name: &str, owners: serde_json::Value| {
            json!({
                "apiVersion": "batch/v1",
                "kind": "Job",
                "metadata": { "name": name, "namespace": "default", "ownerReferences": owners },
                "spec": { "template": { "spec": { "containers": [
                    { "name": "app", "image": "registry/app:v1" }
                ] } } },
            })
        };
        let list = json!({
            "apiVersion": "batch/v1",
            "kind": "JobList",
            "metadata": {},
            "items": [
                job("web", json!([])),
                job("web-29001", json!([{
                    "apiVersion": "batch/v1",
                    "kind": "CronJob",
                    "name": "web",
                    "uid": "5678",
                    "controller": true,
                }])),
            ],
        });
        let app = Router::new().route(
            "/apis/batch/v1/namespaces/default/jobs",
            get(move || async move { Json(list) }),
        );
        let source = KubeWorkloadSource::new(fake_api(app).await);

        let jobs = source.list(Kind::Job, &cv(Some(&[("app", "web")]))).await.unwrap();

        let names: Vec<String> = jobs.iter().map(|job| job.name()).collect();
        assert_eq!(names, vec!["web"]);
    }
}
