// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::path::Path;
use serde::{Serialize, Deserialize};
use figment::{Figment, Error, providers::{Format, Json, Toml, Yaml, Env, Serialized}};

use crate::constant::ENV_PREFIX;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[allow(unused)]
#[derive(Default)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[allow(unused)]
pub struct LogConfig {
    /// Default filter directive, overridden by the LOG_LEVEL environment variable
    #[serde(default)]
    pub level: String,
    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            json: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[allow(unused)]
pub struct ControllerConfig {
    #[serde(default)]
    pub provider_namespace: String,
    #[serde(default)]
    pub concurrency: u16,
    #[serde(default)]
    pub requeue_after_secs: u64,
    #[serde(default)]
    pub resync_after_secs: u64,
    #[serde(default)]
    pub backoff_base_secs: u64,
    #[serde(default)]
    pub backoff_max_secs: u64,
    #[serde(default)]
    pub heartbeat_period_secs: u64,
    #[serde(default)]
    pub unreachable_grace_secs: u64,
    #[serde(default)]
    pub kubeconfig_secret_key: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            provider_namespace: "relay-system".to_string(),
            concurrency: 4,
            requeue_after_secs: 5,
            resync_after_secs: 300,
            backoff_base_secs: 1,
            backoff_max_secs: 300,
            heartbeat_period_secs: 30,
            unreachable_grace_secs: 120,
            kubeconfig_secret_key: "kubeconfig".to_string(),
        }
    }
}

/// A single group/version/kind plus its plural resource name
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[allow(unused)]
pub struct ResourceKindConfig {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub plural: String,
}

/// Parameters for running a single mirror loop as its own process
#[derive(Debug, Deserialize, Serialize, Clone)]
#[allow(unused)]
pub struct MirrorConfig {
    #[serde(default)]
    pub management: ResourceKindConfig,
    #[serde(default)]
    pub service: ResourceKindConfig,
    #[serde(default)]
    pub service_cluster: String,
    /// Path to a kubeconfig for the service cluster, same-cluster mode when unset
    #[serde(default)]
    pub service_kubeconfig: Option<String>,
    #[serde(default)]
    pub provider_namespace: String,
    #[serde(default)]
    pub webhook_strategy: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        MirrorConfig {
            management: ResourceKindConfig::default(),
            service: ResourceKindConfig::default(),
            service_cluster: String::new(),
            service_kubeconfig: None,
            provider_namespace: "relay-system".to_string(),
            webhook_strategy: "None".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[allow(unused)]
pub struct WebhookConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tls: TLSConfig,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        WebhookConfig {
            host: "0.0.0.0".to_string(),
            port: 8443,
            tls: TLSConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[allow(unused)]
pub struct TLSConfig {
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
}

impl Default for TLSConfig {
    fn default() -> Self {
        TLSConfig {
            cert_file: "/etc/ssl/certs/tls.crt".to_string(),
            key_file: "/etc/ssl/certs/tls.key".to_string(),
        }
    }
}

pub struct AppConfigBuilder {
    figment: Figment,
}

impl AppConfigBuilder {
    pub fn with_file(&mut self, path: &str) -> &mut Self {
        let extension = Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();

        self.figment = match extension {
            "json" => self.figment.clone().merge(Json::file(path)),
            "yaml" | "yml" => self.figment.clone().merge(Yaml::file(path)),
            "toml" => self.figment.clone().merge(Toml::file(path)),
            _ => self.figment.clone(),
        };
        self
    }

    pub fn with_optional_file(&mut self, path: Option<&str>) -> &mut Self {
        if let Some(path) = path {
            self.with_file(path);
        }
        self
    }

    pub fn with_env(&mut self) -> &mut Self {
        self.figment = self.figment.clone().merge(Env::prefixed(&format!("{}__", ENV_PREFIX)).split("__"));
        self
    }

    pub fn with_override_option(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.figment = self.figment.clone().merge(Serialized::default(key, value));
        }
        self
    }

    pub fn build(&self) -> Result<AppConfig, Error> {
        self.figment.extract()
    }
}

impl Default for AppConfigBuilder {
    fn default() -> Self {
        AppConfigBuilder {
            figment: Figment::from(Serialized::defaults(AppConfig::default()))
        }
    }
}
