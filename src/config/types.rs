//! Agent configuration structs and defaults.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scheduler::table::OperationTable;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub chassis: Vec<ChassisSettings>,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub ipmi: IpmiSettings,
    #[serde(default)]
    pub store: StoreSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_agent_name() -> String {
    hostname::get()
        .unwrap_or_else(|_| std::ffi::OsString::from("unknown"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String { "info".to_string() }

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            log_level: default_log_level(),
        }
    }
}

/// One chassis manager to poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChassisSettings {
    pub loc_id: u8,
    pub link: LinkSettings,
}

/// How ipmitool reaches a chassis manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "interface", rename_all = "kebab-case")]
pub enum LinkSettings {
    Lanplus {
        host: String,
        #[serde(default = "default_rmcp_port")]
        port: u16,
        user: String,
        password: String,
    },
    Serial {
        device: String,
        #[serde(default = "default_baud")]
        baud: u32,
    },
    /// Local BMC via /dev/ipmi0
    Open,
}

impl LinkSettings {
    /// Still carries the address placeholder from the default config.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, LinkSettings::Lanplus { host, .. } if host.is_empty() || host.contains("[CM_ADDRESS]"))
    }
}

fn default_rmcp_port() -> u16 { 623 }
fn default_baud() -> u32 { 115_200 }

/// Drawer hardware generation; decides which drawer operations run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    /// Single-hop drawer temperature only
    #[default]
    Standard,
    /// Dual-hop aggregated thermal, health and power
    BdcR,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default)]
    pub platform: Platform,
    /// Extra time past an operation's timeout before an outstanding exchange is abandoned
    #[serde(default = "default_response_grace_ms")]
    pub response_grace_ms: u64,
    /// Consecutive presence/liveness failures before a subtree is taken offline
    #[serde(default = "default_offline_after_failures")]
    pub offline_after_failures: u32,
    /// Total sends for write commands (first attempt included)
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
    /// Fixed switch draw added to every drawer's power figure
    #[serde(default = "default_switch_power_watts")]
    pub switch_power_watts: u16,
    /// Rack PUID pushed to BDC-R drawer controllers; 0 until one is assigned
    #[serde(default)]
    pub rack_puid: u32,
    /// Per-operation timeout overrides, keyed by operation name
    #[serde(default)]
    pub timeouts_ms: BTreeMap<String, u64>,
}

fn default_response_grace_ms() -> u64 { 2000 }
fn default_offline_after_failures() -> u32 { 3 }
fn default_write_attempts() -> u32 { 5 }
fn default_switch_power_watts() -> u16 { 70 }

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            response_grace_ms: default_response_grace_ms(),
            offline_after_failures: default_offline_after_failures(),
            write_attempts: default_write_attempts(),
            switch_power_watts: default_switch_power_watts(),
            rack_puid: 0,
            timeouts_ms: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpmiSettings {
    #[serde(default = "default_ipmitool_path")]
    pub ipmitool_path: String,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_ipmitool_path() -> String { "ipmitool".to_string() }
fn default_command_timeout_ms() -> u64 { 5000 }

impl Default for IpmiSettings {
    fn default() -> Self {
        Self {
            ipmitool_path: default_ipmitool_path(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Stdout,
    File,
    Hub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub sink: SinkKind,
    /// JSON-lines output file (file sink)
    #[serde(default)]
    pub path: Option<String>,
    /// Hub WebSocket endpoint (hub sink)
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: f64,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: f64,
    /// Events held while the hub is unreachable; oldest dropped first
    #[serde(default = "default_backlog")]
    pub backlog: usize,
}

fn default_reconnect_interval() -> f64 { 5.0 }
fn default_connection_timeout() -> f64 { 10.0 }
fn default_backlog() -> usize { 1024 }

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            sink: SinkKind::default(),
            path: None,
            server_url: None,
            reconnect_interval: default_reconnect_interval(),
            connection_timeout: default_connection_timeout(),
            backlog: default_backlog(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent: AgentSettings::default(),
            chassis: vec![ChassisSettings {
                loc_id: 1,
                link: LinkSettings::Lanplus {
                    host: "[CM_ADDRESS]".to_string(), // Placeholder forces user configuration
                    port: default_rmcp_port(),
                    user: "admin".to_string(),
                    password: "admin".to_string(),
                },
            }],
            scheduler: SchedulerSettings::default(),
            ipmi: IpmiSettings::default(),
            store: StoreSettings::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chassis.is_empty() {
            return Err(ConfigError::NoChassis);
        }

        let mut seen = HashSet::new();
        for cm in &self.chassis {
            if cm.loc_id == 0 {
                return Err(ConfigError::ZeroLocId);
            }
            if !seen.insert(cm.loc_id) {
                return Err(ConfigError::DuplicateLocId(cm.loc_id));
            }
        }

        for (name, ms) in &self.scheduler.timeouts_ms {
            if !OperationTable::knows(name) {
                return Err(ConfigError::UnknownOperation(name.clone()));
            }
            if *ms == 0 {
                return Err(ConfigError::ZeroTimeout(name.clone()));
            }
        }

        if self.scheduler.write_attempts == 0 {
            return Err(ConfigError::ZeroWriteAttempts);
        }

        match self.store.sink {
            SinkKind::File if self.store.path.is_none() => {
                return Err(ConfigError::MissingStoreField { sink: "file", field: "path" });
            }
            SinkKind::Hub if self.store.server_url.is_none() => {
                return Err(ConfigError::MissingStoreField { sink: "hub", field: "server_url" });
            }
            _ => {}
        }

        Ok(())
    }
}
