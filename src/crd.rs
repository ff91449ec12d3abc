//! ContainerVersion custom resource.
//!
//! A ContainerVersion declares which image tag a named container should run in every workload
//! matched by its selector.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "autodeploy.io",
    version = "v1",
    kind = "ContainerVersion",
    plural = "containerversions",
    shortname = "cv",
    namespaced,
    status = "ContainerVersionStatus",
    printcolumn = r#"{"name":"Container", "type":"string", "jsonPath":".spec.container"}"#,
    printcolumn = r#"{"name":"Tag", "type":"string", "jsonPath":".spec.tag"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.currentVersion"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ContainerVersionSpec {
    /// Name of the container to keep up to date.
    pub container: String,

    /// Image repository without a tag, e.g. `registry.example.com/team/app`.
    pub image_repo: String,

    /// Tag to follow. It is resolved to a version through the registry on every pass.
    pub tag: String,

    /// Labels of the workloads to update. When absent, only workloads named like this
    /// ContainerVersion are updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<BTreeMap<String, String>>,

    /// Revert to the previous version when the workload is unhealthy after the grace period.
    #[serde(default)]
    pub rollback_enabled: bool,

    /// Grace period before the health check. Falls back to a Deployment's progress deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_grace_seconds: Option<u64>,

    /// Extra tags to point at the version once every workload runs it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub promote_tags: Vec<String>,
}

impl ContainerVersionSpec {
    pub fn rollback_grace(&self) -> Option<Duration> {
        self.rollback_grace_seconds.map(Duration::from_secs)
    }

    /// Image reference a container should carry to run `version`.
    pub fn image_for(&self, version: &str) -> String {
        format!("{}:{}", self.image_repo, version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerVersionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<SyncPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<SyncResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SyncPhase {
    /// Every matched workload runs the desired version.
    Synced,
    /// At least one matched workload could not be brought to the desired version.
    PartiallyFailed,
    /// The sign-off gate refused the version.
    Rejected,
    /// The version could not be resolved.
    Failed,
}

/// One matched workload as observed during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub namespace: String,
    pub name: String,
    pub kind: String,
    pub container: String,
    pub version: String,
    pub container_version: String,
    pub tag: String,
}
