//! 插件宿主配置管理
//!
//! 支持YAML和TOML配置文件，按扩展名选择格式

use crate::plugins::lifecycle::RuntimeConfig;
use crate::plugins::registry::RegistryConfig;
use crate::services::installations::InstallationRecord;
use crate::services::module_manager::DEFAULT_TRIAL_DAYS;
use crate::{Result, RuntimeError};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// 宿主配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// 运行时设置
    pub runtime: RuntimeSection,
    /// 日志配置
    pub logging: LoggingConfig,
    /// 启动时恢复的安装记录
    #[serde(default)]
    pub installations: Vec<InstallationRecord>,
}

/// 运行时设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// 宿主名称
    pub name: String,
    /// 扩展调用超时（毫秒），不设置表示不限制
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
    /// 是否拒绝重复注册
    #[serde(default)]
    pub strict_registration: bool,
    /// 试用天数
    #[serde(default = "default_trial_days")]
    pub trial_days: i64,
}

fn default_trial_days() -> i64 {
    DEFAULT_TRIAL_DAYS
}

impl RuntimeSection {
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            call_timeout: self.call_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            allow_duplicates: !self.strict_registration,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: LogLevel,
    /// 是否输出ANSI颜色
    #[serde(default = "default_ansi")]
    pub ansi: bool,
    /// 是否输出日志target
    #[serde(default)]
    pub with_target: bool,
}

fn default_ansi() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            ansi: true,
            with_target: false,
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_tracing(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let mut sample = InstallationRecord::new(1, "rates", Version::new(1, 2, 0));
        sample
            .settings
            .insert("base_currency".to_string(), serde_json::json!("USD"));

        Self {
            runtime: RuntimeSection {
                name: "lms-plugin-host".to_string(),
                call_timeout_ms: Some(5_000),
                strict_registration: false,
                trial_days: DEFAULT_TRIAL_DAYS,
            },
            logging: LoggingConfig::default(),
            installations: vec![sample],
        }
    }
}

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// 按扩展名判断格式
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            other => Err(RuntimeError::config(format!(
                "Unsupported config file extension: {:?}",
                other
            ))),
        }
    }

    fn parse(&self, content: &str) -> Result<RuntimeSettings> {
        match self {
            ConfigFormat::Yaml => serde_yaml::from_str(content)
                .map_err(|e| RuntimeError::config(format!("Failed to parse config file: {}", e))),
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| RuntimeError::config(format!("Failed to parse config file: {}", e))),
        }
    }

    fn render(&self, settings: &RuntimeSettings) -> Result<String> {
        match self {
            ConfigFormat::Yaml => serde_yaml::to_string(settings)
                .map_err(|e| RuntimeError::config(format!("Failed to serialize config: {}", e))),
            ConfigFormat::Toml => toml::to_string_pretty(settings)
                .map_err(|e| RuntimeError::config(format!("Failed to serialize config: {}", e))),
        }
    }
}

/// 配置管理器
#[derive(Debug)]
pub struct SettingsManager {
    settings: RuntimeSettings,
}

impl SettingsManager {
    /// 从文件加载配置
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RuntimeError::config(format!("Failed to read config file: {}", e)))?;

        Ok(Self {
            settings: format.parse(&content)?,
        })
    }

    /// 创建默认配置
    pub fn new_default() -> Self {
        Self {
            settings: RuntimeSettings::default(),
        }
    }

    /// 保存配置到文件
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = ConfigFormat::from_path(path)?.render(&self.settings)?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| RuntimeError::config(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut RuntimeSettings {
        &mut self.settings
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        let runtime = &self.settings.runtime;
        if runtime.name.trim().is_empty() {
            return Err(RuntimeError::config("Host name cannot be empty"));
        }
        if runtime.call_timeout_ms == Some(0) {
            return Err(RuntimeError::config("Call timeout must be positive when set"));
        }
        if runtime.trial_days < 0 {
            return Err(RuntimeError::config("Trial days cannot be negative"));
        }

        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        for record in &self.settings.installations {
            if record.plugin_id.trim().is_empty() {
                return Err(RuntimeError::config(format!(
                    "Installation {} has an empty plugin id",
                    record.installation_id
                )));
            }
            if !ids.insert(record.installation_id) {
                return Err(RuntimeError::config(format!(
                    "Duplicate installation id {}",
                    record.installation_id
                )));
            }
            if !keys.insert(record.key()) {
                return Err(RuntimeError::config(format!(
                    "Plugin '{}' installed twice for tenant {}",
                    record.plugin_id, record.tenant_id
                )));
            }
        }

        tracing::info!("Configuration validation passed");
        Ok(())
    }
}

/// 生成默认配置文件
pub async fn generate_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    SettingsManager::new_default().save_to_file(path).await
}
