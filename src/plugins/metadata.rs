//! 插件元数据管理
//!
//! 元数据在注册后不可变，持有插件工厂、声明的能力以及配置Schema

use super::core::{Plugin, PluginCapabilities};
use crate::types::{PluginConfig, PluginId};
use crate::{Result, RuntimeError};
use jsonschema::JSONSchema;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;

/// 插件工厂 - 每次调用构造一个全新的插件对象
pub type PluginFactory = Arc<dyn Fn() -> Result<Box<dyn Plugin>> + Send + Sync>;

/// 插件元数据
#[derive(Clone)]
pub struct PluginMetadata {
    /// 插件ID
    pub id: PluginId,
    /// 显示名称
    pub name: String,
    /// 语义化版本
    pub version: Version,
    /// 描述
    pub description: String,
    /// 声明需要的权限
    pub required_permissions: Vec<String>,
    /// 提供的端点
    pub endpoints: Vec<String>,
    /// 订阅的事件类型
    pub event_subscriptions: Vec<String>,
    /// 配置Schema（JSON Schema）
    pub config_schema: Option<JsonValue>,
    /// 默认配置，加载时被调用方配置覆盖
    pub default_config: PluginConfig,
    factory: PluginFactory,
    compiled_schema: Option<Arc<JSONSchema>>,
}

/// 可序列化的元数据视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: PluginId,
    pub name: String,
    pub version: Version,
    pub description: String,
    pub capabilities: PluginCapabilities,
    pub config_schema: Option<JsonValue>,
}

impl PluginMetadata {
    /// 创建元数据构建器
    pub fn builder(id: impl Into<PluginId>, name: impl Into<String>, version: Version) -> MetadataBuilder {
        MetadataBuilder::new(id.into(), name.into(), version)
    }

    /// 通过工厂构造插件对象
    pub fn create_plugin(&self) -> Result<Box<dyn Plugin>> {
        (self.factory)()
    }

    /// 默认配置与调用方配置合并，调用方优先
    pub fn merged_config(&self, overrides: PluginConfig) -> PluginConfig {
        let mut merged = self.default_config.clone();
        merged.extend(overrides);
        merged
    }

    /// 按Schema校验配置，未声明Schema时总是通过
    pub fn validate_config(&self, config: &PluginConfig) -> Result<()> {
        let Some(schema) = &self.compiled_schema else {
            return Ok(());
        };

        let instance = serde_json::to_value(config)?;
        if let Err(errors) = schema.validate(&instance) {
            let message = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(RuntimeError::InvalidConfiguration {
                plugin_id: self.id.clone(),
                message,
            });
        }
        Ok(())
    }

    /// 由元数据声明推导的能力（不含方法列表，方法由插件自身声明）
    pub fn declared_capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            methods: Vec::new(),
            permissions: self.required_permissions.clone(),
            endpoints: self.endpoints.clone(),
            event_subscriptions: self.event_subscriptions.clone(),
        }
    }

    pub fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            capabilities: self.declared_capabilities(),
            config_schema: self.config_schema.clone(),
        }
    }
}

impl fmt::Debug for PluginMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginMetadata")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version.to_string())
            .field("required_permissions", &self.required_permissions)
            .field("endpoints", &self.endpoints)
            .field("event_subscriptions", &self.event_subscriptions)
            .field("has_schema", &self.config_schema.is_some())
            .finish_non_exhaustive()
    }
}

/// 元数据构建器
pub struct MetadataBuilder {
    id: PluginId,
    name: String,
    version: Version,
    description: String,
    required_permissions: Vec<String>,
    endpoints: Vec<String>,
    event_subscriptions: Vec<String>,
    config_schema: Option<JsonValue>,
    default_config: PluginConfig,
    factory: Option<PluginFactory>,
}

impl MetadataBuilder {
    fn new(id: PluginId, name: String, version: Version) -> Self {
        Self {
            id,
            name,
            version,
            description: String::new(),
            required_permissions: Vec::new(),
            endpoints: Vec::new(),
            event_subscriptions: Vec::new(),
            config_schema: None,
            default_config: PluginConfig::new(),
            factory: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.required_permissions.push(permission.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn subscribes_to(mut self, event_type: impl Into<String>) -> Self {
        self.event_subscriptions.push(event_type.into());
        self
    }

    pub fn config_schema(mut self, schema: JsonValue) -> Self {
        self.config_schema = Some(schema);
        self
    }

    pub fn default_config(mut self, key: &str, value: JsonValue) -> Self {
        self.default_config.insert(key.to_string(), value);
        self
    }

    /// 设置工厂
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// 设置共享的工厂
    pub fn shared_factory(mut self, factory: PluginFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// 构建并校验元数据
    pub fn build(self) -> Result<PluginMetadata> {
        let invalid = |message: String| RuntimeError::InvalidMetadata {
            plugin_id: self.id.clone(),
            message,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("plugin id cannot be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("plugin name cannot be empty".to_string()));
        }
        let factory = match &self.factory {
            Some(factory) => factory.clone(),
            None => return Err(invalid("plugin factory is required".to_string())),
        };

        let compiled_schema = match &self.config_schema {
            Some(schema) => {
                let compiled = JSONSchema::compile(schema)
                    .map_err(|e| invalid(format!("config schema does not compile: {}", e)))?;
                Some(Arc::new(compiled))
            }
            None => None,
        };

        let metadata = PluginMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            required_permissions: self.required_permissions.clone(),
            endpoints: self.endpoints.clone(),
            event_subscriptions: self.event_subscriptions.clone(),
            config_schema: self.config_schema.clone(),
            default_config: self.default_config.clone(),
            factory,
            compiled_schema,
        };

        if !metadata.default_config.is_empty() {
            metadata.validate_config(&metadata.default_config).map_err(|e| {
                invalid(format!("default configuration rejected by schema: {}", e))
            })?;
        }

        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::builtin::CurrencyRatesPlugin;
    use serde_json::json;

    fn schema() -> JsonValue {
        json!({
            "type": "object",
            "properties": {
                "precision": {"type": "integer", "minimum": 0, "maximum": 8}
            }
        })
    }

    #[test]
    fn test_builder_requires_factory() {
        let result = PluginMetadata::builder("widget", "Widget", Version::new(1, 0, 0)).build();
        assert!(matches!(result, Err(RuntimeError::InvalidMetadata { .. })));
    }

    #[test]
    fn test_builder_rejects_empty_id() {
        let result = PluginMetadata::builder(" ", "Widget", Version::new(1, 0, 0))
            .factory(|| Ok(Box::new(CurrencyRatesPlugin::new()) as Box<dyn Plugin>))
            .build();
        assert!(matches!(result, Err(RuntimeError::InvalidMetadata { .. })));
    }

    #[test]
    fn test_schema_validation() {
        let metadata = PluginMetadata::builder("widget", "Widget", Version::new(1, 0, 0))
            .factory(|| Ok(Box::new(CurrencyRatesPlugin::new()) as Box<dyn Plugin>))
            .config_schema(schema())
            .default_config("precision", json!(2))
            .build()
            .unwrap();

        let mut good = PluginConfig::new();
        good.insert("precision".to_string(), json!(4));
        assert!(metadata.validate_config(&good).is_ok());

        let mut bad = PluginConfig::new();
        bad.insert("precision".to_string(), json!("four"));
        let err = metadata.validate_config(&bad).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_default_config_must_satisfy_schema() {
        let result = PluginMetadata::builder("widget", "Widget", Version::new(1, 0, 0))
            .factory(|| Ok(Box::new(CurrencyRatesPlugin::new()) as Box<dyn Plugin>))
            .config_schema(schema())
            .default_config("precision", json!(99))
            .build();
        assert!(matches!(result, Err(RuntimeError::InvalidMetadata { .. })));
    }

    #[test]
    fn test_merged_config_prefers_overrides() {
        let metadata = PluginMetadata::builder("widget", "Widget", Version::new(1, 0, 0))
            .factory(|| Ok(Box::new(CurrencyRatesPlugin::new()) as Box<dyn Plugin>))
            .default_config("precision", json!(2))
            .default_config("base_currency", json!("USD"))
            .build()
            .unwrap();

        let mut overrides = PluginConfig::new();
        overrides.insert("precision".to_string(), json!(6));
        let merged = metadata.merged_config(overrides);

        assert_eq!(merged["precision"], json!(6));
        assert_eq!(merged["base_currency"], json!("USD"));
    }

    #[test]
    fn test_descriptor_serialization() {
        let metadata = PluginMetadata::builder("widget", "Widget", Version::new(1, 4, 2))
            .description("Shows things")
            .permission("cache:write")
            .endpoint("/widget")
            .subscribes_to("course.published")
            .factory(|| Ok(Box::new(CurrencyRatesPlugin::new()) as Box<dyn Plugin>))
            .build()
            .unwrap();

        let serialized = serde_json::to_string(&metadata.descriptor()).unwrap();
        let deserialized: PluginDescriptor = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized.version, Version::new(1, 4, 2));
        assert_eq!(deserialized.capabilities.permissions, vec!["cache:write"]);
        assert_eq!(deserialized.capabilities.event_subscriptions, vec!["course.published"]);
    }
}
