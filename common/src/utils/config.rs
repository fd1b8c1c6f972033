use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Default, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Local,
    Memory,
    S3,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

#[derive(Clone, Default, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub http_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default)]
    pub s3_bucket: Option<String>,
    #[serde(default)]
    pub s3_region: Option<String>,
    #[serde(default)]
    pub s3_access_key_id: Option<String>,
    #[serde(default)]
    pub s3_secret_access_key: Option<String>,
    #[serde(default)]
    pub s3_endpoint: Option<String>,
    pub webhook_url: String,
    #[serde(default = "default_portal_url")]
    pub portal_url: String,
    #[serde(default)]
    pub portal_proxy: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_notify_max_attempts")]
    pub notify_max_attempts: usize,
    #[serde(default = "default_notify_base_delay_ms")]
    pub notify_base_delay_ms: u64,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_portal_url() -> String {
    "https://www.ups.com/lasso/signin".to_string()
}

fn default_max_pages() -> u32 {
    10
}

fn default_notify_max_attempts() -> usize {
    3
}

fn default_notify_base_delay_ms() -> u64 {
    100
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_kind_defaults_to_local() {
        let config = AppConfig::default();
        assert_eq!(config.storage, StorageKind::Local);
    }

    #[test]
    fn storage_kind_deserializes_lowercase() {
        let kind: StorageKind = serde_json::from_str("\"s3\"").expect("kind");
        assert_eq!(kind, StorageKind::S3);
    }
}
