//! 内置插件

pub mod currency_rates;

pub use currency_rates::{CurrencyRatesPlugin, PluginCounters};

use super::registry::PluginRegistry;
use crate::Result;
use std::sync::Arc;

/// 注册全部内置插件
pub fn register_builtin_plugins(registry: &PluginRegistry) -> Result<()> {
    registry.register(currency_rates::metadata(Arc::new(PluginCounters::default()))?)?;
    Ok(())
}
