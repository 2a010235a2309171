//! 汇率插件
//!
//! 市场中的示例模块：按租户配置的汇率表做货币换算。
//! 汇率以基准货币计价，"1 基准货币 = rate 目标货币"。

use crate::plugins::command::{CommandTable, NoArgs};
use crate::plugins::core::{
    InstanceStatus, Plugin, PluginCapabilities, PluginCommand, PluginContext, PluginHealth,
};
use crate::plugins::metadata::PluginMetadata;
use crate::error::NotActiveReason;
use crate::{Result, RuntimeError};
use async_trait::async_trait;
use rust_decimal::Decimal;
use semver::Version;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// 插件ID
pub const PLUGIN_ID: &str = "rates";

const CACHE_KEY: &str = "rates";

/// 生命周期钩子调用计数，多个实例可共享同一份
#[derive(Debug, Default)]
pub struct PluginCounters {
    initialized: AtomicUsize,
    activated: AtomicUsize,
    deactivated: AtomicUsize,
    reconfigured: AtomicUsize,
    destroyed: AtomicUsize,
}

impl PluginCounters {
    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn activated(&self) -> usize {
        self.activated.load(Ordering::SeqCst)
    }

    pub fn deactivated(&self) -> usize {
        self.deactivated.load(Ordering::SeqCst)
    }

    pub fn reconfigured(&self) -> usize {
        self.reconfigured.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// 换算状态
#[derive(Debug, Default)]
struct RateTable {
    base_currency: String,
    rates: BTreeMap<String, Decimal>,
    precision: u32,
}

impl RateTable {
    fn from_context(ctx: &PluginContext) -> Result<Self> {
        let base_currency: String = ctx.get_config_or("base_currency", "USD".to_string())?;
        let precision: u32 = ctx.get_config_or("precision", 2)?;
        let mut rates: BTreeMap<String, Decimal> = ctx.get_config_or("rates", BTreeMap::new())?;

        if let Some((currency, _)) = rates.iter().find(|(_, rate)| **rate <= Decimal::ZERO) {
            return Err(RuntimeError::config(format!(
                "Rate for '{}' must be positive",
                currency
            )));
        }
        rates.insert(base_currency.clone(), Decimal::ONE);

        Ok(Self {
            base_currency,
            rates,
            precision,
        })
    }

    fn rate(&self, currency: &str) -> Result<Decimal> {
        self.rates
            .get(currency)
            .copied()
            .ok_or_else(|| RuntimeError::InvalidArguments {
                method: "convert".to_string(),
                message: format!("unsupported currency '{}'", currency),
            })
    }

    fn convert(&self, from: &str, to: &str, amount: Decimal) -> Result<Decimal> {
        let from_rate = self.rate(from)?;
        let to_rate = self.rate(to)?;
        let converted = amount
            .checked_div(from_rate)
            .and_then(|base| base.checked_mul(to_rate))
            .ok_or_else(|| RuntimeError::plugin(format!("overflow converting {} {}", amount, from)))?;
        Ok(converted.round_dp(self.precision))
    }

    fn snapshot(&self) -> Value {
        let rates: BTreeMap<&String, String> = self
            .rates
            .iter()
            .map(|(currency, rate)| (currency, rate.to_string()))
            .collect();
        json!({
            "base_currency": self.base_currency,
            "precision": self.precision,
            "rates": rates,
        })
    }
}

/// 汇率插件
pub struct CurrencyRatesPlugin {
    table: RateTable,
    commands: Arc<CommandTable<RateTable>>,
    counters: Arc<PluginCounters>,
    initialized: bool,
}

impl CurrencyRatesPlugin {
    pub fn new() -> Self {
        Self::with_counters(Arc::new(PluginCounters::default()))
    }

    pub fn with_counters(counters: Arc<PluginCounters>) -> Self {
        Self {
            table: RateTable::default(),
            commands: Arc::new(Self::commands()),
            counters,
            initialized: false,
        }
    }

    fn commands() -> CommandTable<RateTable> {
        CommandTable::new()
            .handler(
                "convert",
                |table: &mut RateTable, _ctx, (from, to, amount): (String, String, Decimal)| {
                    table.convert(&from, &to, amount)
                },
            )
            .handler("rates", |table: &mut RateTable, _ctx, _: NoArgs| {
                Ok(table.snapshot())
            })
            .handler("supported", |table: &mut RateTable, _ctx, _: NoArgs| {
                Ok(table.rates.keys().cloned().collect::<Vec<String>>())
            })
    }

    async fn publish_snapshot(&self, ctx: &PluginContext) -> Result<()> {
        ctx.services()
            .cache()
            .put(&ctx.scoped_key(CACHE_KEY), self.table.snapshot(), None)
            .await
    }
}

impl Default for CurrencyRatesPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for CurrencyRatesPlugin {
    async fn initialize(&mut self, ctx: &PluginContext) -> Result<()> {
        self.table = RateTable::from_context(ctx)?;
        self.publish_snapshot(ctx).await?;
        self.initialized = true;
        PluginCounters::bump(&self.counters.initialized);

        info!(
            "Currency rates initialized for tenant {} with base {} and {} rate(s)",
            ctx.tenant_id(),
            self.table.base_currency,
            self.table.rates.len()
        );
        Ok(())
    }

    async fn activate(&mut self, _ctx: &PluginContext) -> Result<()> {
        PluginCounters::bump(&self.counters.activated);
        Ok(())
    }

    async fn deactivate(&mut self, _ctx: &PluginContext) -> Result<()> {
        PluginCounters::bump(&self.counters.deactivated);
        Ok(())
    }

    async fn destroy(&mut self, ctx: &PluginContext) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;
        ctx.services().cache().evict(&ctx.scoped_key(CACHE_KEY)).await?;
        self.table = RateTable::default();
        PluginCounters::bump(&self.counters.destroyed);
        debug!("Currency rates released for tenant {}", ctx.tenant_id());
        Ok(())
    }

    async fn execute(&mut self, ctx: &PluginContext, command: PluginCommand) -> Result<Value> {
        if ctx.status() != InstanceStatus::Active {
            return Err(RuntimeError::NotActive {
                plugin_id: ctx.plugin_id().to_string(),
                tenant_id: ctx.tenant_id(),
                reason: NotActiveReason::Inactive,
            });
        }
        self.commands.dispatch(&mut self.table, ctx, command)
    }

    async fn on_configuration_change(&mut self, ctx: &PluginContext) -> Result<()> {
        self.table = RateTable::from_context(ctx)?;
        self.publish_snapshot(ctx).await?;
        PluginCounters::bump(&self.counters.reconfigured);
        Ok(())
    }

    fn health(&self, ctx: &PluginContext) -> PluginHealth {
        let health = if self.initialized {
            PluginHealth::healthy("rates loaded")
        } else {
            PluginHealth::unhealthy("not initialized")
        };
        health
            .with_detail("status", json!(ctx.status().to_string()))
            .with_detail("currencies", json!(self.table.rates.len()))
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            methods: self.commands.methods(),
            permissions: vec!["cache:write".to_string()],
            ..PluginCapabilities::default()
        }
    }
}

/// 配置Schema
pub fn config_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "base_currency": {"type": "string", "pattern": "^[A-Z]{3}$"},
            "precision": {"type": "integer", "minimum": 0, "maximum": 8},
            "rates": {
                "type": "object",
                "propertyNames": {"pattern": "^[A-Z]{3}$"},
                "additionalProperties": {"type": "string", "pattern": "^[0-9]+(\\.[0-9]+)?$"}
            }
        }
    })
}

/// 构建插件元数据，工厂产生的实例共享传入的计数器
pub fn metadata(counters: Arc<PluginCounters>) -> Result<PluginMetadata> {
    PluginMetadata::builder(PLUGIN_ID, "Currency Rates", Version::new(1, 2, 0))
        .description("Converts amounts between currencies using tenant-configured rates")
        .permission("cache:write")
        .endpoint("/api/plugins/rates/convert")
        .config_schema(config_schema())
        .default_config("base_currency", json!("USD"))
        .default_config("precision", json!(2))
        .default_config(
            "rates",
            json!({"EUR": "0.92", "GBP": "0.79", "JPY": "149.50"}),
        )
        .factory(move || {
            Ok(Box::new(CurrencyRatesPlugin::with_counters(counters.clone())) as Box<dyn Plugin>)
        })
        .build()
}
