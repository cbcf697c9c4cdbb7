//! rack-assetd entry point: CLI dispatch, signal handlers, async runtime.

mod actions;
mod app;
mod config;
mod error;
mod ops;
mod presence;
mod protocol;
mod scheduler;
mod store;
mod tree;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{error, info, warn};

use app::cli::Args;
use app::logging::{init_tracing, level_filter, reload_level};
use config::persistence::{load_config, save_config};
use config::types::{AgentConfig, SinkKind};
use protocol::ipmitool::{IpmiLink, IpmitoolLink, LinkTransport};
use scheduler::table::OperationTable;
use scheduler::Scheduler;
use store::hub::{HubLink, HubStore};
use store::jsonl::JsonLinesStore;
use store::StateStore;

#[tokio::main]
async fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => err.exit(),
    };

    // Priority: 1. --log-level flag, 2. LOG_LEVEL env, 3. config file, 4. info
    let explicit_level = args
        .log_level
        .clone()
        .or_else(|| std::env::var("LOG_LEVEL").ok());
    let filter = match explicit_level.as_deref() {
        Some(level) => level_filter(level).unwrap_or_else(|| {
            eprintln!(
                "Invalid log level '{}'. Using INFO. Valid levels: TRACE, DEBUG, INFO, WARN, ERROR, CRITICAL",
                level
            );
            "info"
        }),
        None => "info",
    };
    init_tracing(filter, args.log_json);

    if let Some(path) = args.init_config.as_deref() {
        save_config(&AgentConfig::default(), path).await?;
        println!("Default configuration written to {}", path);
        return Ok(());
    }

    let config = load_config(args.config.as_deref()).await?;
    if explicit_level.is_none() {
        match level_filter(&config.agent.log_level) {
            Some(level) => {
                if let Err(e) = reload_level(level) {
                    warn!("Failed to apply configured log level: {}", e);
                }
            }
            None => warn!("Invalid log level '{}' in config, keeping INFO", config.agent.log_level),
        }
    }
    config.validate().context("Invalid configuration")?;

    let table = OperationTable::standard(config.scheduler.platform)
        .with_timeouts(&config.scheduler.timeouts_ms);

    if args.check {
        println!(
            "Configuration OK: {} chassis manager(s), {:?} platform, {} operations, {:?} sink",
            config.chassis.len(),
            config.scheduler.platform,
            table.len(),
            config.store.sink
        );
        return Ok(());
    }

    if args.print_table {
        print_table(&table);
        return Ok(());
    }

    info!("rack-assetd v{} starting ({})", env!("CARGO_PKG_VERSION"), std::env::consts::OS);

    let loc_ids: Vec<u8> = config.chassis.iter().map(|cm| cm.loc_id).collect();
    let links: Vec<Arc<dyn IpmiLink>> = config
        .chassis
        .iter()
        .map(|cm| Arc::new(IpmitoolLink::new(cm.link.clone(), &config.ipmi)) as Arc<dyn IpmiLink>)
        .collect();

    let (completion_tx, mut completion_rx) = unbounded_channel();
    let (action_tx, action_rx) = unbounded_channel();

    let (store, hub): (Arc<dyn StateStore>, Option<HubLink>) = match config.store.sink {
        SinkKind::Stdout => (Arc::new(JsonLinesStore::stdout()), None),
        SinkKind::File => {
            let path = config.store.path.as_deref().unwrap_or_default();
            let sink = JsonLinesStore::file(path)
                .with_context(|| format!("Failed to open event file {}", path))?;
            info!("Writing asset events to {}", path);
            (Arc::new(sink), None)
        }
        SinkKind::Hub => {
            let (sink, events) = HubStore::channel();
            let link = HubLink::new(
                config.store.clone(),
                config.agent.name.clone(),
                loc_ids.clone(),
                events,
                action_tx.clone(),
            );
            (Arc::new(sink), Some(link))
        }
    };
    let hub_task = hub.map(|link| {
        tokio::spawn(async move {
            if let Err(e) = link.run().await {
                error!("Hub link error: {}", e);
            }
        })
    });

    let transport = Arc::new(LinkTransport::new(links));
    let mut scheduler = Scheduler::new(
        table,
        config.scheduler.clone(),
        &loc_ids,
        store,
        transport,
        completion_tx,
    );

    if args.once {
        info!("Running one round per chassis manager");
        scheduler.run_once(&mut completion_rx).await;
        drop(scheduler);
        drop(action_tx);

        // Give the hub a chance to drain what the round produced
        if let Some(task) = hub_task {
            let grace = std::time::Duration::from_secs_f64(config.store.connection_timeout);
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("Hub did not drain within {:.1}s", config.store.connection_timeout);
            }
        }
        info!("Round complete");
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    spawn_sighup_reload(args.config.clone(), explicit_level.is_some())?;

    // The hub holds its own sender; ours is only needed while it lives
    drop(action_tx);

    tokio::select! {
        _ = scheduler.run(completion_rx, action_rx) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Shutdown signal received (Ctrl+C)");
        }
    }

    if let Some(task) = hub_task {
        task.abort();
    }
    info!("rack-assetd shutdown complete");
    Ok(())
}

/// Re-read the config on SIGHUP and apply its log level.
#[cfg(target_os = "linux")]
fn spawn_sighup_reload(config_path: Option<String>, pinned: bool) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup()).context("Failed to set up SIGHUP handler")?;
    tokio::spawn(async move {
        while sighup.recv().await.is_some() {
            info!("SIGHUP received, reloading log level configuration");
            if pinned {
                info!("Log level set on the command line or LOG_LEVEL, leaving it unchanged");
                continue;
            }

            match load_config(config_path.as_deref()).await {
                Ok(new_config) => {
                    let level = level_filter(&new_config.agent.log_level).unwrap_or("info");
                    match reload_level(level) {
                        Ok(_) => info!("Log level reloaded: {}", level.to_uppercase()),
                        Err(e) => error!("Failed to reload log level: {}", e),
                    }
                }
                Err(e) => error!("Failed to reload config: {}", e),
            }
        }
    });
    Ok(())
}

fn print_table(table: &OperationTable) {
    println!("{:>3}  {:<20} {:<12} {:>8}  {}", "#", "operation", "node", "timeout", "once");
    for (index, op) in table.iter().enumerate() {
        println!(
            "{:>3}  {:<20} {:<12} {:>6}ms  {}",
            index + 1,
            op.kind.name(),
            format!("{:?}", op.node),
            op.timeout.as_millis(),
            if op.once { "yes" } else { "no" }
        );
    }
}
