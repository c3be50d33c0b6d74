use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cinder::config::{Config, InstanceConfig};
use cinder::instance::InstanceCore;
use cinder::manager::Manager;
use cinder::store::Store;
use cinder::transport::TlsConfig;

/// A multi-network IRC bot with dynamically loaded command modules.
#[derive(Debug, Parser)]
#[command(name = "cinder", version, about)]
struct Args {
    /// Path of the configuration file.
    #[arg(short, long, default_value = "cinder.toml")]
    config: PathBuf,
}

fn build_instance(
    name: &str,
    cfg: &InstanceConfig,
    modules_dir: &std::path::Path,
) -> anyhow::Result<Arc<InstanceCore>> {
    let store = Store::open(&cfg.database)
        .with_context(|| format!("opening database {}", cfg.database.display()))?;
    let core = Arc::new(InstanceCore::new(
        name,
        &cfg.nick,
        &cfg.pattern,
        cfg.auth.clone(),
        store,
        modules_dir.to_path_buf(),
    ));

    for (channel, chan_cfg) in &cfg.channels {
        let modules = chan_cfg
            .modules
            .resolve(modules_dir)
            .with_context(|| format!("resolving modules for {channel}"))?;

        let bindings: Vec<_> = modules
            .iter()
            .map(|module| {
                let config = chan_cfg
                    .config
                    .get(module)
                    .cloned()
                    .unwrap_or_default();
                (module.clone(), config)
            })
            .collect();
        core.add_channel(channel, &bindings);

        for module in &modules {
            if core.modules.by_name(module).is_some() {
                continue;
            }
            let result = {
                let store = core.store.lock();
                core.modules.load(module, &store)
            };
            if let Err(err) = result {
                warn!(instance = name, module = module.as_str(), %err, "module failed to load");
            }
        }
    }

    Ok(core)
}

async fn shutdown_signal() {
    let handlers = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::user_defined1()),
    );
    let (Ok(mut interrupt), Ok(mut terminate), Ok(mut user1)) = handlers else {
        error!("failed to install signal handlers");
        return std::future::pending::<()>().await;
    };

    tokio::select! {
        _ = interrupt.recv() => info!("received interrupt"),
        _ = terminate.recv() => info!("received terminate"),
        _ = user1.recv() => info!("received restart request"),
    }
    info!("shutting down ...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if config.instance.is_empty() {
        anyhow::bail!("no instances configured");
    }

    let mut manager = Manager::new();
    let mut pending = Vec::new();

    for (name, instance_cfg) in &config.instance {
        info!(
            instance = %name,
            nick = %instance_cfg.nick,
            host = %instance_cfg.host,
            port = instance_cfg.port,
            ssl = instance_cfg.ssl,
            "instance configured"
        );
        let core = build_instance(name, instance_cfg, &config.modules_dir)?;
        let idx = manager.add_instance(core);
        pending.push((idx, name.clone(), instance_cfg.clone()));
    }

    for (idx, name, cfg) in pending {
        let tls = cfg.ssl.then(|| TlsConfig {
            trust_file: cfg.trust.clone(),
        });
        if let Err(err) = manager.connect(idx, &cfg.host, cfg.port, tls.as_ref()).await {
            // The instance stays registered but not ready; a restart
            // reattempts the connection.
            error!(instance = %name, %err, "connect failed");
        }
    }

    manager.run(shutdown_signal()).await;
    Ok(())
}
