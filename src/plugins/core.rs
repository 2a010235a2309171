//! 插件系统核心特征定义
//!
//! 定义每个扩展必须实现的Plugin trait，以及运行时注入给插件的上下文

use crate::services::HostServices;
use crate::types::{PluginConfig, PluginId, TenantId};
use crate::{Result, RuntimeError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 实例状态 - 运行时持有唯一权威的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// 正在服务
    Active,
    /// 已停用，资源和上下文仍然驻留
    Inactive,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Active => write!(f, "ACTIVE"),
            InstanceStatus::Inactive => write!(f, "INACTIVE"),
        }
    }
}

/// 插件上下文 - 每个实例独占一份
///
/// 状态字段由运行时在每次调用前写入，插件只读取它，不自行维护激活标志。
#[derive(Clone)]
pub struct PluginContext {
    tenant_id: TenantId,
    plugin_id: PluginId,
    plugin_version: Version,
    config: PluginConfig,
    status: InstanceStatus,
    services: HostServices,
}

impl PluginContext {
    /// 创建新的插件上下文，初始状态为Active
    ///
    /// 宿主服务被换成该租户的视图，插件无法读写其他租户的数据和缓存键。
    pub fn new(
        tenant_id: TenantId,
        plugin_id: impl Into<PluginId>,
        plugin_version: Version,
        config: PluginConfig,
        services: HostServices,
    ) -> Self {
        Self {
            tenant_id,
            plugin_id: plugin_id.into(),
            plugin_version,
            config,
            status: InstanceStatus::Active,
            services: services.for_tenant(tenant_id),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn plugin_version(&self) -> &Version {
        &self.plugin_version
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }

    /// 当前完整配置
    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// 宿主服务门面
    pub fn services(&self) -> &HostServices {
        &self.services
    }

    /// 获取配置值
    pub fn get_config<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let value = self.config.get(key).ok_or_else(|| {
            RuntimeError::config(format!(
                "Missing config key '{}' for plugin '{}'",
                key, self.plugin_id
            ))
        })?;

        serde_json::from_value(value.clone()).map_err(|e| {
            RuntimeError::config(format!(
                "Failed to deserialize config key '{}': {}",
                key, e
            ))
        })
    }

    /// 获取配置值，缺失时使用默认值
    pub fn get_config_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: DeserializeOwned,
    {
        if self.config.contains_key(key) {
            self.get_config(key)
        } else {
            Ok(default)
        }
    }

    /// 生成按插件隔离的存储键，租户前缀由服务门面负责
    pub fn scoped_key(&self, key: &str) -> String {
        format!("plugin:{}:{}", self.plugin_id, key)
    }

    pub(crate) fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
    }

    pub(crate) fn replace_config(&mut self, config: PluginConfig) {
        self.config = config;
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("tenant_id", &self.tenant_id)
            .field("plugin_id", &self.plugin_id)
            .field("plugin_version", &self.plugin_version)
            .field("status", &self.status)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// 插件调用命令：方法名 + JSON参数列表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginCommand {
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

impl PluginCommand {
    pub fn new(method: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    /// 无参数命令
    pub fn bare(method: impl Into<String>) -> Self {
        Self::new(method, Vec::new())
    }

    /// 从可序列化的参数元组构建命令，元组序列化为JSON数组
    pub fn with_args<A: Serialize>(method: impl Into<String>, args: A) -> Result<Self> {
        let method = method.into();
        let args = match serde_json::to_value(args)? {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Null => Vec::new(),
            single => vec![single],
        };
        Ok(Self { method, args })
    }
}

/// 插件健康状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginHealth {
    /// 是否健康
    pub healthy: bool,
    /// 状态消息
    pub message: String,
    /// 检查时间
    pub checked_at: DateTime<Utc>,
    /// 详细状态信息
    pub details: HashMap<String, serde_json::Value>,
}

impl PluginHealth {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
            checked_at: Utc::now(),
            details: HashMap::new(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            ..Self::healthy(message)
        }
    }

    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

/// 插件能力声明
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCapabilities {
    /// 可调用的方法名
    pub methods: Vec<String>,
    /// 需要的权限
    pub permissions: Vec<String>,
    /// 提供的端点
    pub endpoints: Vec<String>,
    /// 订阅的事件类型
    pub event_subscriptions: Vec<String>,
}

/// 核心插件特征 - 所有扩展必须实现
///
/// 调用顺序由运行时保证：`initialize` 恰好一次且最先调用；`destroy` 至多一次且最后调用。
#[async_trait]
pub trait Plugin: Send + Sync {
    /// 初始化插件，建立所需资源
    async fn initialize(&mut self, context: &PluginContext) -> Result<()>;

    /// 恢复服务，不重新获取资源
    async fn activate(&mut self, _context: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// 暂停服务，不释放资源
    async fn deactivate(&mut self, _context: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// 释放全部资源，必须幂等
    async fn destroy(&mut self, context: &PluginContext) -> Result<()>;

    /// 按方法名分发调用
    async fn execute(
        &mut self,
        context: &PluginContext,
        command: PluginCommand,
    ) -> Result<serde_json::Value>;

    /// 配置热更新钩子，新配置已写入上下文
    async fn on_configuration_change(&mut self, _context: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// 健康检查
    fn health(&self, context: &PluginContext) -> PluginHealth;

    /// 能力声明
    fn capabilities(&self) -> PluginCapabilities;
}
