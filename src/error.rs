//! 插件运行时错误处理系统
//!
//! 统一的错误类型，区分调用方错误与被隔离的插件故障

use crate::types::{PluginId, TenantId};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// 实例不可用的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotActiveReason {
    /// 从未加载或已卸载
    NotLoaded,
    /// 已加载但处于停用状态
    Inactive,
}

impl fmt::Display for NotActiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotActiveReason::NotLoaded => write!(f, "not loaded"),
            NotActiveReason::Inactive => write!(f, "inactive"),
        }
    }
}

/// 生命周期阶段，用于标注钩子失败的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Activate,
    Deactivate,
    Reconfigure,
    Destroy,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecyclePhase::Activate => "activate",
            LifecyclePhase::Deactivate => "deactivate",
            LifecyclePhase::Reconfigure => "reconfigure",
            LifecyclePhase::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

/// 运行时统一错误类型
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Unknown plugin: {plugin_id}")]
    UnknownPlugin { plugin_id: PluginId },

    #[error("Plugin '{plugin_id}' is already registered")]
    DuplicatePlugin { plugin_id: PluginId },

    #[error("Invalid metadata for plugin '{plugin_id}': {message}")]
    InvalidMetadata { plugin_id: PluginId, message: String },

    #[error("Invalid configuration for plugin '{plugin_id}': {message}")]
    InvalidConfiguration { plugin_id: PluginId, message: String },

    #[error("Failed to load plugin '{plugin_id}' for tenant {tenant_id}: {cause}")]
    LoadFailure {
        plugin_id: PluginId,
        tenant_id: TenantId,
        cause: String,
    },

    #[error("Plugin '{plugin_id}' is not active for tenant {tenant_id} ({reason})")]
    NotActive {
        plugin_id: PluginId,
        tenant_id: TenantId,
        reason: NotActiveReason,
    },

    #[error("Plugin '{plugin_id}' failed during '{method}' for tenant {tenant_id}: {cause}")]
    ExecutionFailure {
        plugin_id: PluginId,
        tenant_id: TenantId,
        method: String,
        cause: String,
    },

    #[error("Unknown method: {method}")]
    UnknownMethod { method: String },

    #[error("Invalid arguments for '{method}': {message}")]
    InvalidArguments { method: String, message: String },

    #[error("Plugin '{plugin_id}' failed to {phase} for tenant {tenant_id}: {cause}")]
    LifecycleFailure {
        plugin_id: PluginId,
        tenant_id: TenantId,
        phase: LifecyclePhase,
        cause: String,
    },

    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Plugin error: {message}")]
    Plugin { message: String },

    #[error("Installation not found: {installation_id}")]
    InstallationNotFound { installation_id: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("HTTP error: {message}")]
    Http { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RuntimeError {
    /// 创建插件内部错误
    pub fn plugin(message: impl Into<String>) -> Self {
        Self::Plugin {
            message: message.into(),
        }
    }

    /// 创建配置错误
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// 是否为"实例不可用"错误（未加载或已停用）
    pub fn is_not_active(&self) -> bool {
        matches!(self, RuntimeError::NotActive { .. })
    }

    /// 是否为调用方错误，调用层应映射为用户可见的响应而不是告警
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            RuntimeError::UnknownPlugin { .. }
                | RuntimeError::NotActive { .. }
                | RuntimeError::UnknownMethod { .. }
                | RuntimeError::InvalidArguments { .. }
                | RuntimeError::InvalidConfiguration { .. }
                | RuntimeError::InstallationNotFound { .. }
        )
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, RuntimeError>;
