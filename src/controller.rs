use crate::crd::{ContainerVersion, ContainerVersionStatus, SyncPhase};
use crate::deploy::{DeployOptions, SimpleDeployer};
use crate::error::Error;
use crate::events::{KubeRecorder, Recorder, Severity, reason};
use crate::history::{ConfigMapHistory, HistoryProvider};
use crate::registry::{self, RegistryProvider};
use crate::signoff::{SignOffGate, SignOffRequest};
use crate::state::ControllerContext;
use crate::sync::{SyncReport, VersionSynchronizer};
use crate::target::{FIELD_MANAGER, KubeWorkloadSource};
use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use globset::GlobSet;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s controller");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to namespace {}, in-cluster Kubernetes API server with version {}.{}",
        client.default_namespace(),
        api_server_info.major,
        api_server_info.minor
    );
    Ok(client)
}

/// Spawns `pass` on `tracker` so shutdown can wait for it. A tick that finds the previous pass
/// still holding `lock` is skipped, since that pass may still be inside a rollback grace period
/// and must not see its version promoted under it.
pub fn spawn_pass<F>(tracker: &TaskTracker, lock: Arc<Mutex<()>>, pass: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tracker.spawn(async move {
        let Ok(_running) = lock.try_lock_owned() else {
            warn!("Previous reconciliation pass is still running, skipping this one");
            return;
        };
        if let Err(e) = pass.await {
            error!("Error running controller job: {:?}", e);
        }
    });
}

/// One reconciliation pass over every ContainerVersion in the allowed namespaces.
pub async fn run(ctx: ControllerContext) -> anyhow::Result<()> {
    let filter = ctx.config.namespace_filter()?;
    let api: Api<ContainerVersion> = Api::all(ctx.kube_client.clone());
    let container_versions = api
        .list(&ListParams::default())
        .await
        .context("Failed to list ContainerVersions")?;

    let selected: Vec<ContainerVersion> = container_versions
        .items
        .into_iter()
        .filter(|cv| in_scope(filter.as_ref(), cv.namespace().as_deref()))
        .collect();
    info!("Reconciling {} ContainerVersions", selected.len());

    let keys: Vec<String> = selected
        .iter()
        .map(|cv| format!("{}/{}", cv.namespace().unwrap_or_default(), cv.name_any()))
        .collect();
    ctx.shared.retain_resources(&keys).await;

    let ctx = &ctx;
    let passes = selected.iter().map(move |cv| async move {
        if let Err(e) = reconcile(ctx, cv).await {
            error!(
                "Failed to reconcile ContainerVersion {}/{}: {:?}",
                cv.namespace().unwrap_or_default(),
                cv.name_any(),
                e
            );
        }
    });
    join_all(passes).await;

    Ok(())
}

fn in_scope(filter: Option<&GlobSet>, namespace: Option<&str>) -> bool {
    match (filter, namespace) {
        (None, _) => true,
        (Some(filter), Some(namespace)) => filter.is_match(namespace),
        (Some(_), None) => false,
    }
}

async fn reconcile(ctx: &ControllerContext, cv: &ContainerVersion) -> anyhow::Result<()> {
    let namespace = cv
        .namespace()
        .context("ContainerVersion has no namespace")?;
    let name = cv.name_any();
    let api: Api<ContainerVersion> = Api::namespaced(ctx.kube_client.clone(), &namespace);
    let recorder: Arc<dyn Recorder> = Arc::new(KubeRecorder::new(
        ctx.kube_client.clone(),
        cv.object_ref(&()),
        ctx.shared.counters.clone(),
    ));

    let registry = registry::for_repository(&ctx.config, &ctx.http_client, &cv.spec.image_repo)
        .with_context(|| format!("Invalid image repository {}", cv.spec.image_repo))?;

    let versions = match registry.versions(&cv.spec.tag).await {
        Ok(versions) if !versions.is_empty() => versions,
        Ok(_) => {
            let message = format!("Tag {} resolved to no versions", cv.spec.tag);
            patch_status(&api, &name, failed_status(SyncPhase::Failed, &message)).await?;
            anyhow::bail!(message);
        }
        Err(e) => {
            let message = format!("Failed to resolve tag {}: {}", cv.spec.tag, e);
            patch_status(&api, &name, failed_status(SyncPhase::Failed, &message)).await?;
            return Err(e).context(message);
        }
    };
    let version = versions[0].clone();
    debug!("Tag {} of {} resolved to {:?}", cv.spec.tag, name, versions);

    if let Some(sign_off) = &ctx.config.sign_off {
        let gate = SignOffGate::new(ctx.http_client.clone(), sign_off);
        if let Some(message) = check_sign_off(&gate, registry.as_ref(), cv, &versions).await {
            recorder
                .event(Severity::Warning, reason::SIGN_OFF_REJECTED, &message)
                .await;
            patch_status(&api, &name, failed_status(SyncPhase::Rejected, &message)).await?;
            return Ok(());
        }
    }

    let history: Arc<dyn HistoryProvider> = Arc::new(ConfigMapHistory::new(
        ctx.kube_client.clone(),
        &ctx.config.history,
        ctx.config.deploy.conflict_retry.clone(),
    ));
    let deployer = SimpleDeployer::new(
        &namespace,
        history,
        recorder.clone(),
        DeployOptions {
            conflict_retry: ctx.config.deploy.conflict_retry.clone(),
            record_history: ctx.config.history.enabled,
        },
        ctx.shutdown.clone(),
    );
    let synchronizer = VersionSynchronizer::new(
        Arc::new(KubeWorkloadSource::new(ctx.kube_client.clone())),
        Arc::new(deployer),
        recorder.clone(),
    );

    let report = synchronizer.sync(cv, &version).await;

    if report.all_synced() && !cv.spec.promote_tags.is_empty() {
        if let Err(e) = registry.add(&version, &cv.spec.promote_tags).await {
            warn!(
                "Failed to promote version {} of {} to {:?}: {}",
                version, name, cv.spec.promote_tags, e
            );
            recorder
                .event(
                    Severity::Warning,
                    reason::PROMOTE_FAILED,
                    &format!(
                        "Failed to tag version {} as {}: {}",
                        version,
                        cv.spec.promote_tags.join(", "),
                        e
                    ),
                )
                .await;
        }
    }

    patch_status(&api, &name, synced_status(&report, &version)).await?;
    ctx.shared
        .set_resources(&namespace, &name, report.results)
        .await;
    Ok(())
}

/// Returns the rejection message when the gate refuses the version or cannot be reached.
async fn check_sign_off(
    gate: &SignOffGate,
    registry: &dyn RegistryProvider,
    cv: &ContainerVersion,
    versions: &[String],
) -> Option<String> {
    let digest = match registry.get(&versions[0]).await {
        Ok(ids) => ids.get(1).cloned().unwrap_or_default(),
        Err(e) => return Some(format!("Cannot look up version {}: {}", versions[0], e)),
    };
    let request = sign_off_request(cv, versions, digest);

    match gate.approve(&request).await {
        Ok(true) => None,
        Ok(false) => Some(format!("Sign-off refused version {}", versions[0])),
        Err(e) => Some(format!("Sign-off for version {} failed: {}", versions[0], e)),
    }
}

fn sign_off_request(cv: &ContainerVersion, versions: &[String], digest: String) -> SignOffRequest {
    SignOffRequest {
        kcd_name: cv.name_any(),
        kcd_namespace: cv.namespace().unwrap_or_default(),
        kcd_labels: cv.labels().clone(),
        kcd_tag: cv.spec.tag.clone(),
        kcd_image_repo: cv.spec.image_repo.clone(),
        versions: versions.to_vec(),
        digest,
    }
}

fn synced_status(report: &SyncReport, version: &str) -> ContainerVersionStatus {
    let (phase, message) = if report.all_synced() {
        (
            SyncPhase::Synced,
            format!("{} workloads run version {}", report.candidates.len(), version),
        )
    } else {
        let mut message = format!(
            "{} of {} workloads are not on version {}",
            report.unsynced(),
            report.candidates.len(),
            version
        );
        if !report.list_failures.is_empty() {
            let kinds: Vec<&str> = report.list_failures.iter().map(|k| k.as_str()).collect();
            message.push_str(&format!(", failed to list {}", kinds.join(", ")));
        }
        (SyncPhase::PartiallyFailed, message)
    };

    ContainerVersionStatus {
        current_version: Some(version.to_string()),
        phase: Some(phase),
        message: Some(message),
        last_sync_time: Some(Utc::now()),
        resources: report.results.clone(),
    }
}

fn failed_status(phase: SyncPhase, message: &str) -> ContainerVersionStatus {
    ContainerVersionStatus {
        phase: Some(phase),
        message: Some(message.to_string()),
        last_sync_time: Some(Utc::now()),
        ..Default::default()
    }
}

/// A merge patch replacing the whole status. Fields the status leaves out are sent as null, so a
/// failed pass clears the version and resources of an earlier one.
fn status_patch(status: &ContainerVersionStatus) -> Result<Value, Error> {
    let mut value = serde_json::to_value(status)?;
    if let Some(fields) = value.as_object_mut() {
        for field in ["currentVersion", "phase", "message", "lastSyncTime", "resources"] {
            fields.entry(field).or_insert(Value::Null);
        }
    }
    Ok(json!({ "status": value }))
}

async fn patch_status(
    api: &Api<ContainerVersion>,
    name: &str,
    status: ContainerVersionStatus,
) -> Result<(), Error> {
    let patch = status_patch(&status)?;
    debug!("Patching status of ContainerVersion {} with {}", name, patch);
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
