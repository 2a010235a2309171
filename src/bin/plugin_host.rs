//! 插件宿主 - 配置驱动运行
//!
//! 注册内置插件，按配置中的安装记录恢复实例，输出实例摘要后关闭

use anyhow::Context;
use lms_plugin_runtime::config::{generate_default_config_file, SettingsManager};
use lms_plugin_runtime::{
    initialize, reconcile, register_builtin_plugins, EventNotifier, HostServices, LoggingListener,
    ModuleManager, PluginRegistry, PluginRuntime, RecordingListener, RUNTIME_NAME, VERSION,
};
use std::collections::BTreeSet;
use std::env;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "plugin_host.yaml";

/// 程序入口点
#[tokio::main]
async fn main() {
    if let Err(e) = run_main().await {
        eprintln!("plugin_host failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.as_slice() {
        [_] => run(SettingsManager::new_default()).await,
        [_, command] if command == "init" => init(DEFAULT_CONFIG_PATH).await,
        [_, command, path] if command == "init" => init(path).await,
        [_, path] => {
            let manager = SettingsManager::load_from_file(path)
                .await
                .with_context(|| format!("loading settings from {}", path))?;
            run(manager).await
        }
        _ => {
            print_usage();
            Ok(())
        }
    }
}

async fn init(path: &str) -> anyhow::Result<()> {
    generate_default_config_file(path)
        .await
        .with_context(|| format!("writing default settings to {}", path))?;
    println!("Default settings written to {}", path);
    Ok(())
}

async fn run(manager: SettingsManager) -> anyhow::Result<()> {
    manager.validate()?;
    let settings = manager.settings();
    initialize(&settings.logging)?;
    info!("Starting {} v{} as '{}'", RUNTIME_NAME, VERSION, settings.runtime.name);

    let registry = Arc::new(PluginRegistry::new(settings.runtime.registry_config()));
    register_builtin_plugins(&registry)?;

    let notifier = Arc::new(EventNotifier::new());
    notifier.subscribe(Arc::new(LoggingListener));
    let audit = Arc::new(RecordingListener::new("host-audit"));
    notifier.subscribe(audit.clone());

    let runtime = Arc::new(PluginRuntime::new(
        registry,
        notifier,
        HostServices::in_memory(),
        settings.runtime.runtime_config(),
    ));
    let modules = ModuleManager::new(runtime.clone(), settings.runtime.trial_days);
    modules.import(settings.installations.clone());

    let report = reconcile(&runtime, &modules).await?;
    for failure in &report.failed {
        warn!(
            "Installation {} ({}) not restored: {}",
            failure.installation_id, failure.key, failure.error
        );
    }

    for descriptor in runtime.registry().descriptors() {
        info!(
            "Registered plugin '{}' v{}: {}",
            descriptor.id, descriptor.version, descriptor.name
        );
    }

    let tenants: BTreeSet<i64> = settings.installations.iter().map(|r| r.tenant_id).collect();
    for tenant_id in tenants {
        for instance in runtime.list_for_tenant(tenant_id) {
            let health = runtime.health(&instance.plugin_id, tenant_id).await?;
            info!(
                "Tenant {}: '{}' v{} {} (healthy: {}, {})",
                tenant_id,
                instance.plugin_id,
                instance.plugin_version,
                instance.status,
                health.healthy,
                health.message
            );
        }
    }

    let unloaded = runtime.shutdown().await?;
    info!(
        "Host stopped: {} instance(s) unloaded, {} lifecycle event(s) recorded",
        unloaded,
        audit.events().len()
    );
    Ok(())
}

fn print_usage() {
    println!("{} v{}", RUNTIME_NAME, VERSION);
    println!();
    println!("Usage:");
    println!("  plugin_host                  run with default settings");
    println!("  plugin_host <settings>       run with a .yaml/.yml/.toml settings file");
    println!("  plugin_host init [path]      write default settings (default: {})", DEFAULT_CONFIG_PATH);
}
