//! 插件注册表
//!
//! 插件ID到元数据（含工厂）的静态目录，由宿主在启动时填充

use super::metadata::{PluginDescriptor, PluginMetadata};
use crate::types::PluginId;
use crate::{Result, RuntimeError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// 注册表配置
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// 是否允许重复注册（后注册者覆盖）
    pub allow_duplicates: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            allow_duplicates: true,
        }
    }
}

/// 插件注册表
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<PluginId, Arc<PluginMetadata>>>,
    config: RegistryConfig,
}

impl PluginRegistry {
    /// 创建新的插件注册表
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// 注册插件
    pub fn register(&self, metadata: PluginMetadata) -> Result<()> {
        let plugin_id = metadata.id.clone();
        let mut plugins = self.plugins.write();

        if plugins.contains_key(&plugin_id) {
            if !self.config.allow_duplicates {
                return Err(RuntimeError::DuplicatePlugin { plugin_id });
            }
            warn!("Plugin '{}' re-registered, previous metadata replaced", plugin_id);
        }

        info!(
            "Plugin '{}' v{} registered",
            plugin_id, metadata.version
        );
        plugins.insert(plugin_id, Arc::new(metadata));
        Ok(())
    }

    /// 注销插件，已加载的实例不受影响
    pub fn unregister(&self, plugin_id: &str) -> Result<Arc<PluginMetadata>> {
        self.plugins
            .write()
            .remove(plugin_id)
            .ok_or_else(|| RuntimeError::UnknownPlugin {
                plugin_id: plugin_id.to_string(),
            })
    }

    /// 获取插件元数据
    pub fn get(&self, plugin_id: &str) -> Result<Arc<PluginMetadata>> {
        self.plugins
            .read()
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownPlugin {
                plugin_id: plugin_id.to_string(),
            })
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.plugins.read().contains_key(plugin_id)
    }

    /// 所有插件ID（有序）
    pub fn list(&self) -> Vec<PluginId> {
        let mut ids: Vec<PluginId> = self.plugins.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 所有插件的可序列化描述
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        let mut descriptors: Vec<PluginDescriptor> = self
            .plugins
            .read()
            .values()
            .map(|metadata| metadata.descriptor())
            .collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }
}
