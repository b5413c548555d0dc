use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::types::{AttributeValue, GuestIdType};


/// Environment configuration: which plugins to stack and the limits the
/// core enforces while they run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Debug message level (0 = none, 9 = maximum)
    pub debug_level: u32,
    /// Plugin stack, bottom (device-facing) first
    pub plugins: Vec<PluginConfig>,
    pub buffer_pool: BufferPoolConfig,
    pub registry: RegistryConfig,
    pub migration: MigrationConfig,
    pub guest: GuestConfig,
}


impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            debug_level: 0,
            plugins: vec![],
            buffer_pool: BufferPoolConfig::default(),
            registry: RegistryConfig::default(),
            migration: MigrationConfig::default(),
            guest: GuestConfig::default(),
        }
    }
}


impl EnvironmentConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid environment configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("in {}", path.display()))
    }
}


/// One entry of the plugin stack
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Built-in module name or path to a shared library
    pub module: String,
    /// Applied with set_attribute before the plugin is initialized
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Free-form options the plugin reads with `config_get`
    pub options: BTreeMap<String, String>,
}


#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Upper bound on inline data held by live pool buffers
    pub max_bytes: u64,
    pub max_buffers: u32,
}


impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024, // 64MB
            max_buffers: 4096,
        }
    }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_handles: u32,
}


impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_handles: 65536 }
    }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Reported to plugins as `vmiop_vmm_migration_supported`
    pub supported: bool,
    /// Bytes of restored state a device may hold queued before it is initialized
    pub write_queue_bytes: u64,
}


impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            supported: true,
            write_queue_bytes: 16 * 1024 * 1024,
        }
    }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    pub id_type: GuestIdType,
    pub domain_id: u32,
    pub uuid: Option<uuid::Uuid>,
    pub page_size: u64,
    pub can_discard_presentation_surface_params: bool,
}


impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            id_type: GuestIdType::DomainId,
            domain_id: 0,
            uuid: None,
            page_size: 4096,
            can_discard_presentation_surface_params: false,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = EnvironmentConfig::from_json_str(
            r#"{
                "debug_level": 3,
                "plugins": [
                    { "module": "display", "attributes": { "vmiop_vgpu_cap": 1 } },
                    { "module": "presentation", "options": { "edid": "00ff" } }
                ],
                "buffer_pool": { "max_buffers": 8 }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.debug_level, 3);
        assert_eq!(cfg.plugins.len(), 2);
        assert_eq!(cfg.plugins[0].attributes["vmiop_vgpu_cap"], AttributeValue::Unsigned(1));
        assert_eq!(cfg.plugins[1].options["edid"], "00ff");
        assert_eq!(cfg.buffer_pool.max_buffers, 8);
        assert_eq!(cfg.buffer_pool.max_bytes, BufferPoolConfig::default().max_bytes);
        assert_eq!(cfg.guest.page_size, 4096);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "guest": {{ "id_type": "uuid", "uuid": "67e55044-10b1-426f-9247-bb680e5fe0c8" }} }}"#
        )
        .unwrap();
        let cfg = EnvironmentConfig::load(file.path()).unwrap();
        assert_eq!(cfg.guest.id_type, GuestIdType::Uuid);
        assert!(cfg.guest.uuid.is_some());
    }

    #[test]
    fn malformed_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = EnvironmentConfig::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains(&file.path().display().to_string()));
    }
}
