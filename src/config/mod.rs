//! Server configuration.
//!
//! The schema mirrors the JSON config the deployment tooling generates:
//! per-tool path separators, the database selection, logging/audit paths,
//! server timeouts and the user list with their authorization rules.

mod load;

pub use load::{load, load_from_env, load_from_reader, DEPI_CONFIG_ENV_VAR};

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::DEFAULT_PATH_SEPARATOR;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(rename = "pathSeparator")]
    pub path_separator: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    MemJson,
    Dolt,
}

impl Default for DbType {
    fn default() -> Self {
        DbType::MemJson
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DbConfig {
    #[serde(rename = "type")]
    pub db_type: DbType,
    #[serde(rename = "stateDir")]
    pub state_dir: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(rename = "poolSize")]
    pub pool_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub file: String,
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuditConfig {
    pub directory: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(rename = "authorization_enabled")]
    pub authorization_enabled: bool,
    /// Session idle timeout in seconds; 0 means the 3600 s default.
    #[serde(rename = "default_timeout")]
    pub default_timeout: u64,
    /// Login-token lifetime in seconds; 0 means the 24 h default.
    #[serde(rename = "tokenTimeout")]
    pub token_timeout: i64,
    #[serde(rename = "insecure_port")]
    pub insecure_port: u16,
    #[serde(rename = "secure_port")]
    pub secure_port: u16,
    pub key_pem: String,
    pub cert_pem: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthorizationConfig {
    #[serde(rename = "auth_def_file")]
    pub auth_def_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
    #[serde(rename = "auth_rules")]
    pub auth_rules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub tools: BTreeMap<String, ToolConfig>,
    pub db: DbConfig,
    pub logging: LoggingConfig,
    pub audit: AuditConfig,
    pub server: ServerConfig,
    pub authorization: AuthorizationConfig,
    pub users: Vec<UserConfig>,
}

impl Config {
    /// The path separator configured for a tool, `/` when unconfigured.
    pub fn path_separator(&self, tool_id: &str) -> &str {
        self.tools
            .get(tool_id)
            .map(|t| t.path_separator.as_str())
            .unwrap_or(DEFAULT_PATH_SEPARATOR)
    }

    pub fn session_timeout(&self) -> Duration {
        match self.server.default_timeout {
            0 => Duration::from_secs(3600),
            secs => Duration::from_secs(secs),
        }
    }

    pub fn token_timeout_secs(&self) -> i64 {
        match self.server.token_timeout {
            0 => 24 * 3600,
            secs => secs,
        }
    }

    pub fn state_dir(&self) -> &str {
        if self.db.state_dir.is_empty() {
            ".state"
        } else {
            &self.db.state_dir
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_missing_sections() {
        let cfg: Config = serde_json::from_str("{}").expect("empty config");
        assert_eq!(cfg.path_separator("git"), "/");
        assert_eq!(cfg.session_timeout(), Duration::from_secs(3600));
        assert_eq!(cfg.token_timeout_secs(), 24 * 3600);
        assert_eq!(cfg.state_dir(), ".state");
        assert!(matches!(cfg.db.db_type, DbType::MemJson));
    }

    #[test]
    fn parses_wire_field_names() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "tools": {"gsn": {"pathSeparator": "."}},
                "db": {"type": "dolt", "stateDir": "/var/depi", "poolSize": 4},
                "server": {"tokenTimeout": 60, "default_timeout": 10},
                "users": [{"name": "mark", "password": "pw", "auth_rules": ["CapBranchCreate()"]}]
            }"#,
        )
        .expect("config");
        assert_eq!(cfg.path_separator("gsn"), ".");
        assert_eq!(cfg.path_separator("other"), "/");
        assert!(matches!(cfg.db.db_type, DbType::Dolt));
        assert_eq!(cfg.db.pool_size, 4);
        assert_eq!(cfg.session_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.token_timeout_secs(), 60);
        assert_eq!(cfg.users.len(), 1);
        assert_eq!(cfg.users[0].auth_rules, vec!["CapBranchCreate()"]);
    }
}
