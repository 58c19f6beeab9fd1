use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::capabilities::PermissionScope;
use crate::codec::Address;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BrokerConfig {
    /// Interrupt invocations running longer than this
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub permission_scope: PermissionScope,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: usize,
    #[serde(default = "default_max_stack_size")]
    pub max_stack_size_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: default_memory_limit(),
            max_stack_size_bytes: default_max_stack_size(),
        }
    }
}

fn default_memory_limit() -> usize {
    32 * 1024 * 1024
}

fn default_max_stack_size() -> usize {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StateConfig {
    /// JSON snapshot the in-memory store is loaded from and saved to
    pub snapshot: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IdentityConfig {
    /// Hex address, supports ${ENV_VAR} substitution
    pub caller: Option<String>,
    /// Hex address, supports ${ENV_VAR} substitution
    pub signer: Option<String>,
}

impl BrokerConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

impl IdentityConfig {
    pub fn caller_address(&self) -> anyhow::Result<Address> {
        parse_address("caller", self.caller.as_deref())
    }

    pub fn signer_address(&self) -> anyhow::Result<Address> {
        parse_address("signer", self.signer.as_deref())
    }
}

/// Unset or blank addresses are the zero address.
fn parse_address(field: &str, value: Option<&str>) -> anyhow::Result<Address> {
    match value.map(str::trim) {
        None | Some("") => Ok(Address::default()),
        Some(hex) => Address::from_hex(hex).map_err(|e| anyhow::anyhow!("identity.{field}: {e}")),
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${CALLER_ADDRESS}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.broker.deadline(), None);
        assert_eq!(config.broker.permission_scope, PermissionScope::Service);
        assert_eq!(config.engine.memory_limit_bytes, 32 * 1024 * 1024);
        assert_eq!(config.engine.max_stack_size_bytes, 1024 * 1024);
        assert!(config.state.snapshot.is_none());
        assert_eq!(config.identity.caller_address().unwrap(), Address::default());
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
[broker]
deadline_ms = 250
permission_scope = "query"

[engine]
memory_limit_bytes = 1048576

[state]
snapshot = "./data/state.json"

[identity]
caller = "0x0101010101010101010101010101010101010101"
"#,
        )
        .unwrap();
        assert_eq!(config.broker.deadline(), Some(Duration::from_millis(250)));
        assert_eq!(config.broker.permission_scope, PermissionScope::Query);
        assert_eq!(config.engine.memory_limit_bytes, 1048576);
        assert_eq!(config.engine.max_stack_size_bytes, 1024 * 1024);
        assert_eq!(config.state.snapshot, Some(PathBuf::from("./data/state.json")));
        assert_eq!(config.identity.caller_address().unwrap(), Address([1; 20]));
        assert_eq!(config.identity.signer_address().unwrap(), Address::default());
    }

    #[test]
    fn test_env_vars_are_expanded() {
        std::env::set_var("CONTRACT_BROKER_TEST_SIGNER", "0202020202020202020202020202020202020202");
        let config = Config::parse(
            "[identity]\nsigner = \"${CONTRACT_BROKER_TEST_SIGNER}\"\n",
        )
        .unwrap();
        assert_eq!(config.identity.signer_address().unwrap(), Address([2; 20]));
    }

    #[test]
    fn test_missing_env_var_is_an_error() {
        assert!(Config::parse("[identity]\nsigner = \"${CONTRACT_BROKER_UNSET_VAR}\"\n").is_err());
    }

    #[test]
    fn test_invalid_address_is_reported() {
        let config = Config::parse("[identity]\ncaller = \"abc\"\n").unwrap();
        let err = config.identity.caller_address().unwrap_err();
        assert!(err.to_string().contains("identity.caller"));
    }

    #[test]
    fn test_unknown_scope_is_rejected() {
        assert!(Config::parse("[broker]\npermission_scope = \"root\"\n").is_err());
    }

    #[test]
    fn test_example_config_loads_without_identity_vars() {
        let config = Config::parse(include_str!("../config/broker.example.toml")).unwrap();
        assert_eq!(config.broker.deadline(), Some(Duration::from_millis(5000)));
        assert_eq!(config.identity.caller_address().unwrap(), Address::default());
        assert_eq!(config.identity.signer_address().unwrap(), Address::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.toml");
        std::fs::write(&path, "[broker]\ndeadline_ms = 10\n").unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.broker.deadline_ms, Some(10));
    }
}
