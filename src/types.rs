//! 运行时核心数据类型
//!
//! 租户、插件标识以及实例键

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display};

/// 插件标识符（全局唯一）
pub type PluginId = String;

/// 租户（组织）标识符
pub type TenantId = i64;

/// 插件配置：键值对，值为任意JSON
pub type PluginConfig = HashMap<String, serde_json::Value>;

/// 实例键 - 每个 (插件, 租户) 组合至多存在一个实例
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub plugin_id: PluginId,
    pub tenant_id: TenantId,
}

impl InstanceKey {
    pub fn new(plugin_id: impl Into<PluginId>, tenant_id: TenantId) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            tenant_id,
        }
    }
}

impl Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.plugin_id, self.tenant_id)
    }
}
