use crate::retry::RetryPolicy;
use crate::secret_string::SecretString;
use anyhow::{Context, Result, bail};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub webserver: Webserver,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Glob patterns for the namespaces whose ContainerVersions are reconciled. Empty means all.
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub registries: Vec<Registry>,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub history: History,
    #[serde(default)]
    pub deploy: Deploy,
    #[serde(default)]
    pub sign_off: Option<SignOff>,
}

#[derive(Debug, Deserialize)]
pub struct Registry {
    pub hostname: String,
    pub username: Option<String>,
    #[serde(default)]
    pub token: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct History {
    pub enabled: bool,
    pub config_map_name: String,
    pub max_records: usize,
}

impl Default for History {
    fn default() -> Self {
        Self {
            enabled: true,
            config_map_name: "autodeploy-history".to_string(),
            max_records: 50,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Deploy {
    pub conflict_retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignOff {
    pub endpoint: String,
    #[serde(default = "default_sign_off_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "RetryPolicy::sign_off")]
    pub retry: RetryPolicy,
}

fn default_schedule() -> String {
    "*/30 * * * * *".to_string()
}

fn default_sign_off_timeout() -> u64 {
    10
}

impl Config {
    pub fn find_registry_for_hostname(&self, hostname: &str) -> Option<&Registry> {
        self.registries
            .iter()
            .find(|registry| registry.hostname.eq_ignore_ascii_case(hostname))
    }

    pub fn namespace_filter(&self) -> Result<Option<GlobSet>> {
        if self.namespaces.is_empty() {
            return Ok(None);
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.namespaces {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("Invalid namespace pattern {}", pattern))?,
            );
        }
        Ok(Some(builder.build().context("Failed to build namespace filter")?))
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;
    config.namespace_filter()?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every variable that is not set.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        bail!("Missing environment variable: {}", missing.join(", "));
    }

    Ok(result.into_owned())
}
