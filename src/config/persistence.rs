//! Config file load, save, and migration logic.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::types::{AgentConfig, SchedulerSettings};

/// Rewrite a legacy config file in place. Returns whether anything changed.
pub(crate) fn migrate_config(config_path: &Path) -> Result<bool> {
    if !config_path.exists() {
        return Ok(false);
    }

    let content = std::fs::read_to_string(config_path)?;
    let mut json: serde_json::Value = serde_json::from_str(&content)?;
    let Some(root) = json.as_object_mut() else {
        return Ok(false);
    };
    let mut migrated = false;

    // === RENAMES ===
    if let Some(backend) = root.remove("backend") {
        if root.contains_key("store") {
            info!("Migrated: dropped legacy 'backend' (superseded by 'store')");
        } else {
            root.insert("store".to_string(), backend);
            info!("Migrated: renamed 'backend' to 'store'");
        }
        migrated = true;
    }

    // === REMOVALS ===
    if let Some(scheduler) = root.get_mut("scheduler").and_then(|s| s.as_object_mut()) {
        if scheduler.remove("min_interval_ms").is_some() {
            info!("Migrated: removed 'scheduler.min_interval_ms' (wake times follow operation timeouts)");
            migrated = true;
        }
    }

    // === ADDITIONS ===
    if !root.contains_key("scheduler") {
        root.insert(
            "scheduler".to_string(),
            serde_json::to_value(SchedulerSettings::default())?,
        );
        info!("Migrated: added 'scheduler' with defaults");
        migrated = true;
    }

    if migrated {
        std::fs::write(config_path, serde_json::to_string_pretty(&json)?)?;
        info!("Config migrated to latest version: {:?}", config_path);
    }

    Ok(migrated)
}

/// `config.json` beside the executable.
pub fn default_config_path() -> Result<PathBuf> {
    let exe_dir = std::env::current_exe()?
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Cannot determine executable directory"))?
        .to_path_buf();
    Ok(exe_dir.join("config.json"))
}

pub async fn load_config(path: Option<&str>) -> Result<AgentConfig> {
    let config_path = match path {
        Some(p) => PathBuf::from(p),
        None => default_config_path()?,
    };

    if let Err(e) = migrate_config(&config_path) {
        warn!("Config migration check failed: {}", e);
    }

    if !config_path.exists() {
        info!("Config file {:?} not found, using defaults ('--init-config' writes one)", config_path);
        return Ok(AgentConfig::default());
    }

    let content = tokio::fs::read_to_string(&config_path)
        .await
        .with_context(|| format!("Failed to read {:?}", config_path))?;
    let config: AgentConfig = serde_json::from_str(&content)
        .with_context(|| format!("Invalid config in {:?}", config_path))?;

    if config.chassis.iter().any(|cm| cm.link.is_placeholder()) {
        warn!("Chassis manager address is not configured in {:?}. Polling will fail.", config_path);
    }

    info!("Loaded configuration from: {:?}", config_path);
    Ok(config)
}

pub async fn save_config(config: &AgentConfig, path: &str) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path))?;
    info!("Configuration saved to: {}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::SinkKind;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rack-assetd-{}-{}.json", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_migrate_renames_backend_and_adds_scheduler() {
        let path = scratch("legacy");
        let legacy = serde_json::json!({
            "chassis": [],
            "backend": { "sink": "hub", "server_url": "ws://hub:3000/ws" }
        });
        std::fs::write(&path, legacy.to_string()).expect("write");

        assert!(migrate_config(&path).expect("migrates"));

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert!(json.get("backend").is_none());
        assert_eq!(json["store"]["server_url"], "ws://hub:3000/ws");
        assert_eq!(json["scheduler"]["write_attempts"], 5);

        // Second pass has nothing left to do
        assert!(!migrate_config(&path).expect("migrates"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_migrate_drops_min_interval() {
        let path = scratch("interval");
        std::fs::write(&path, r#"{ "scheduler": { "min_interval_ms": 250, "platform": "bdc-r" } }"#).expect("write");

        assert!(migrate_config(&path).expect("migrates"));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert!(json["scheduler"].get("min_interval_ms").is_none());
        assert_eq!(json["scheduler"]["platform"], "bdc-r");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_is_not_migrated() {
        assert!(!migrate_config(&scratch("absent")).expect("ok"));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let path = scratch("roundtrip");
        let path_str = path.to_string_lossy().to_string();
        let mut config = AgentConfig::default();
        config.store.sink = SinkKind::File;
        config.store.path = Some("/var/log/rack.jsonl".to_string());

        save_config(&config, &path_str).await.expect("saves");
        let loaded = load_config(Some(&path_str)).await.expect("loads");
        assert_eq!(loaded.store.sink, SinkKind::File);
        assert_eq!(loaded.chassis.len(), 1);
        assert!(loaded.validate().is_ok());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_load_rejects_malformed_file() {
        let path = scratch("broken");
        std::fs::write(&path, "{ not json").expect("write");
        let err = load_config(path.to_str()).await.unwrap_err();
        assert!(err.to_string().contains("Invalid config"));
        let _ = std::fs::remove_file(&path);
    }
}
