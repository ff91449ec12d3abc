//! Deploy history, one append-only list of records per workload.

use crate::config;
use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, retry_on_conflict};
use crate::target::FIELD_MANAGER;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub kind: String,
    pub name: String,
    pub version: String,
    pub time: DateTime<Utc>,
}

#[async_trait]
pub trait HistoryProvider: Send + Sync {
    async fn add(&self, namespace: &str, name: &str, record: &Record) -> Result<()>;
}

/// Stores history in a ConfigMap per namespace, one key per workload holding a JSON array.
pub struct ConfigMapHistory {
    client: Client,
    config_map_name: String,
    max_records: usize,
    retry: RetryPolicy,
}

impl ConfigMapHistory {
    pub fn new(client: Client, history: &config::History, retry: RetryPolicy) -> Self {
        Self {
            client,
            config_map_name: history.config_map_name.clone(),
            max_records: history.max_records.max(1),
            retry,
        }
    }

    async fn append(
        &self,
        api: &Api<ConfigMap>,
        namespace: &str,
        name: &str,
        record: &Record,
    ) -> Result<()> {
        let existing = api.get_opt(&self.config_map_name).await?;
        let is_new = existing.is_none();
        let mut config_map = existing.unwrap_or_else(|| ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.config_map_name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        let data = config_map.data.get_or_insert_with(BTreeMap::new);
        let updated = append_record(data.get(name).map(String::as_str), record, self.max_records)?;
        data.insert(name.to_string(), updated);

        // resourceVersion from the read makes a concurrent writer fail with a conflict
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        if is_new {
            api.create(&pp, &config_map).await?;
        } else {
            api.replace(&self.config_map_name, &pp, &config_map).await?;
        }
        Ok(())
    }
}

/// Adds `record` to the serialized list, keeping only the newest `max_records`.
fn append_record(existing: Option<&str>, record: &Record, max_records: usize) -> Result<String> {
    let mut records: Vec<Record> = match existing {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)
            .map_err(|e| Error::History(format!("unreadable history entry: {}", e)))?,
        _ => Vec::new(),
    };
    records.push(record.clone());
    if records.len() > max_records {
        records.drain(..records.len() - max_records);
    }
    Ok(serde_json::to_string(&records)?)
}

#[async_trait]
impl HistoryProvider for ConfigMapHistory {
    async fn add(&self, namespace: &str, name: &str, record: &Record) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        debug!(
            "Recording {} {} version {} in {}/{}",
            record.kind, name, record.version, namespace, self.config_map_name
        );
        let api = &api;
        retry_on_conflict(&self.retry, "history append", move || {
            self.append(api, namespace, name, record)
        })
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::fixtures::{api_error, fake_api};
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    /// ConfigMap endpoints of a fake API server. Replaces fail with a conflict while
    /// `put_conflicts` lasts, each time after another writer changed the map.
    #[derive(Default)]
    struct FakeConfigMaps {
        calls: Vec<&'static str>,
        stored: Option<ConfigMap>,
        put_conflicts: usize,
        revision: u32,
    }

    impl FakeConfigMaps {
        fn store(&mut self, mut config_map: ConfigMap) -> ConfigMap {
            self.revision += 1;
            config_map.metadata.resource_version = Some(self.revision.to_string());
            self.stored = Some(config_map.clone());
            config_map
        }
    }

    type ConfigMaps = Arc<Mutex<FakeConfigMaps>>;

    async fn get_config_map(State(maps): State<ConfigMaps>) -> Response {
        let mut maps = maps.lock().unwrap();
        maps.calls.push("GET");
        match maps.stored.clone() {
            Some(config_map) => Json(config_map).into_response(),
            None => api_error(StatusCode::NOT_FOUND, "NotFound"),
        }
    }

    async fn create_config_map(
        State(maps): State<ConfigMaps>,
        Json(config_map): Json<ConfigMap>,
    ) -> Response {
        let mut maps = maps.lock().unwrap();
        maps.calls.push("POST");
        (StatusCode::CREATED, Json(maps.store(config_map))).into_response()
    }

    async fn replace_config_map(
        State(maps): State<ConfigMaps>,
        Json(config_map): Json<ConfigMap>,
    ) -> Response {
        let mut maps = maps.lock().unwrap();
        maps.calls.push("PUT");
        if maps.put_conflicts > 0 {
            maps.put_conflicts -= 1;
            let mut changed = maps.stored.clone().unwrap_or_default();
            changed
                .data
                .get_or_insert_with(BTreeMap::new)
                .insert("worker".to_string(), "[]".to_string());
            maps.store(changed);
            return api_error(StatusCode::CONFLICT, "Conflict");
        }
        Json(maps.store(config_map)).into_response()
    }

    async fn history(maps: ConfigMaps) -> ConfigMapHistory {
        let app = Router::new()
            .route(
                "/api/v1/namespaces/{namespace}/configmaps",
                post(create_config_map),
            )
            .route(
                "/api/v1/namespaces/{namespace}/configmaps/{name}",
                get(get_config_map).put(replace_config_map),
            )
            .with_state(maps);
        ConfigMapHistory::new(
            fake_api(app).await,
            &config::History::default(),
            RetryPolicy::conflict(),
        )
    }

    fn stored_versions(maps: &ConfigMaps, key: &str) -> Vec<String> {
        let maps = maps.lock().unwrap();
        let raw = maps
            .stored
            .as_ref()
            .and_then(|cm| cm.data.as_ref())
            .and_then(|data| data.get(key))
            .cloned()
            .unwrap_or_default();
        let records: Vec<Record> = serde_json::from_str(&raw).unwrap();
        records.into_iter().map(|r| r.version).collect()
    }

    fn record(version: &str) -> Record {
        Record {
            kind: "Deployment".to_string(),
            name: "web".to_string(),
            version: version.to_string(),
            time: Utc.with_ymd_and_hms(2026, 10, 14, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_first_record_starts_a_list() {
        let raw = append_record(None, &record("v1"), 10).unwrap();
        let records: Vec<Record> = serde_json::from_str(&raw).unwrap();
        assert_eq!(records, vec![record("v1")]);
        assert!(raw.contains("\"time\":\"2026-10-14T12:00:00Z\""));
    }

    #[test]
    fn test_records_are_capped_keeping_newest() {
        let mut raw = None;
        for version in ["v1", "v2", "v3", "v4"] {
            raw = Some(append_record(raw.as_deref(), &record(version), 3).unwrap());
        }
        let records: Vec<Record> = serde_json::from_str(&raw.unwrap()).unwrap();
        let versions: Vec<_> = records.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, vec!["v2", "v3", "v4"]);
    }

    #[test]
    fn test_corrupt_entry_is_a_history_error() {
        assert!(matches!(
            append_record(Some("not json"), &record("v1"), 3),
            Err(Error::History(_))
        ));
    }

    #[tokio::test]
    async fn test_history_map_is_created_then_replaced() {
        let maps = ConfigMaps::default();
        let history = history(maps.clone()).await;

        history.add("default", "web", &record("v1")).await.unwrap();
        history.add("default", "web", &record("v2")).await.unwrap();

        assert_eq!(maps.lock().unwrap().calls, vec!["GET", "POST", "GET", "PUT"]);
        assert_eq!(stored_versions(&maps, "web"), vec!["v1", "v2"]);
        let maps = maps.lock().unwrap();
        let stored = maps.stored.as_ref().unwrap();
        assert_eq!(stored.metadata.name.as_deref(), Some("autodeploy-history"));
    }

    #[tokio::test]
    async fn test_conflicting_write_is_reread_and_retried() {
        let maps = ConfigMaps::default();
        let history = history(maps.clone()).await;
        history.add("default", "web", &record("v1")).await.unwrap();
        {
            let mut maps = maps.lock().unwrap();
            maps.calls.clear();
            maps.put_conflicts = 1;
        }

        history.add("default", "web", &record("v2")).await.unwrap();

        assert_eq!(
            maps.lock().unwrap().calls,
            vec!["GET", "PUT", "GET", "PUT"]
        );
        assert_eq!(stored_versions(&maps, "web"), vec!["v1", "v2"]);
        assert!(stored_versions(&maps, "worker").is_empty());
    }
}
