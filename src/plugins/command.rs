//! 插件命令处理表
//!
//! 将方法名映射到带类型参数的处理函数。未知方法和参数形状错误在分发时统一报告为调用方错误。

use super::core::{PluginCommand, PluginContext};
use crate::{Result, RuntimeError};
use serde::de::{DeserializeOwned, Deserializer, Error as DeError, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

type Handler<P> = Box<dyn Fn(&mut P, &PluginContext, Vec<Value>) -> Result<Value> + Send + Sync>;

/// 无参数方法的参数类型，要求参数列表为空
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoArgs;

impl<'de> Deserialize<'de> for NoArgs {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let items = Vec::<IgnoredAny>::deserialize(deserializer)?;
        if items.is_empty() {
            Ok(NoArgs)
        } else {
            Err(D::Error::invalid_length(items.len(), &"no arguments"))
        }
    }
}

/// 命令处理表
///
/// 参数元组从命令的JSON参数数组反序列化，例如 `(String, String, Decimal)`。
pub struct CommandTable<P> {
    handlers: BTreeMap<String, Handler<P>>,
}

impl<P: 'static> CommandTable<P> {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// 注册处理函数，同名方法后注册者覆盖先注册者
    pub fn handler<A, R, F>(mut self, method: &str, handler: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&mut P, &PluginContext, A) -> Result<R> + Send + Sync + 'static,
    {
        let name = method.to_string();
        let erased = move |plugin: &mut P, context: &PluginContext, args: Vec<Value>| {
            let parsed: A = serde_json::from_value(Value::Array(args)).map_err(|e| {
                RuntimeError::InvalidArguments {
                    method: name.clone(),
                    message: e.to_string(),
                }
            })?;
            let output = handler(plugin, context, parsed)?;
            Ok(serde_json::to_value(output)?)
        };
        self.handlers.insert(method.to_string(), Box::new(erased));
        self
    }

    /// 分发命令
    pub fn dispatch(
        &self,
        plugin: &mut P,
        context: &PluginContext,
        command: PluginCommand,
    ) -> Result<Value> {
        let handler = self
            .handlers
            .get(&command.method)
            .ok_or_else(|| RuntimeError::UnknownMethod {
                method: command.method.clone(),
            })?;
        handler(plugin, context, command.args)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// 已注册的方法名（有序）
    pub fn methods(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

impl<P: 'static> Default for CommandTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> fmt::Debug for CommandTable<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTable")
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
