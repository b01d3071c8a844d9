//! # label-backup
//! The backup agent binary: wires discovery, scheduling, garbage collection,
//! notifications, and the admin endpoints together, then runs the reconcile
//! and signal loop.

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::{Arc, RwLock};

use label_backup::{
    admin::{self, AdminState},
    config::{current, Config, SharedConfig},
    discovery::Watcher,
    gc,
    logger::init_logger,
    reconciler,
    scheduler::Scheduler,
    webhook::Notifier,
};
use mimalloc::MiMalloc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let dotenv = dotenvy::dotenv();

    let _logger = match init_logger() {
        Ok(guards) => guards,
        Err(error) => {
            eprintln!("Could not initialize logger: {error}");
            return;
        }
    };

    if dotenv.is_err() {
        // Variables may already be in the environment.
        debug!("No .env file found");
    }

    info!("Label backup agent starting...");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!("Could not load configuration: {error}");
            return;
        }
    };
    if let Err(error) = config.validate() {
        error!("Configuration validation failed: {error}");
        return;
    }

    let config = Arc::new(config);
    let shared_config: SharedConfig = Arc::new(RwLock::new(Arc::clone(&config)));

    let root = CancellationToken::new();

    // Discovery
    let watcher = match Watcher::new() {
        Ok(watcher) => Arc::new(watcher),
        Err(error) => {
            error!("Could not initialize discovery watcher: {error}");
            return;
        }
    };
    tokio::spawn({
        let watcher = Arc::clone(&watcher);
        let cancel = root.child_token();
        async move { watcher.run(cancel).await }
    });

    // Notifier and scheduler
    let mut notifier = match Notifier::new(&config.webhook) {
        Ok(notifier) => Arc::new(notifier),
        Err(error) => {
            error!("Could not create webhook sender: {error}");
            return;
        }
    };
    let mut scheduler = Scheduler::new(Arc::clone(&config), Arc::clone(&notifier));

    // Nightly GC
    tokio::spawn(gc::run_daily(
        Arc::clone(&watcher),
        Arc::clone(&shared_config),
        root.child_token(),
    ));

    // Admin endpoints
    tokio::spawn({
        let state = AdminState {
            watcher: Arc::clone(&watcher),
            config: Arc::clone(&shared_config),
        };
        let addr = config.admin_listen_addr;
        let cancel = root.child_token();
        async move {
            if let Err(error) = admin::serve(state, addr, cancel).await {
                error!("Admin server failed: {error}");
            }
        }
    });

    info!("Discovery watcher and scheduler started. Monitoring containers...");

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sigint) => sigint,
        Err(error) => {
            error!("Could not install SIGINT handler: {error}");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            error!("Could not install SIGTERM handler: {error}");
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(sighup) => sighup,
        Err(error) => {
            error!("Could not install SIGHUP handler: {error}");
            return;
        }
    };

    let mut ticker = tokio::time::interval(current(&shared_config).reconcile_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                reconciler::reconcile(&watcher, &scheduler);
            }
            _ = sigint.recv() => {
                info!("Shutdown signal received, stopping agent...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Shutdown signal received, stopping agent...");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration...");

                let new_config = match Config::from_env() {
                    Ok(new_config) => new_config,
                    Err(error) => {
                        error!("Configuration reload failed: {error}");
                        continue;
                    }
                };
                if let Err(error) = new_config.validate() {
                    error!("Configuration validation failed during reload: {error}");
                    continue;
                }

                let new_config = Arc::new(new_config);
                *shared_config
                    .write()
                    .expect("config lock is never poisoned") = Arc::clone(&new_config);

                // Tear down and rebuild the notifier and scheduler with the
                // new configuration. Discovery and the registry are
                // preserved; specs are re-scheduled on the next tick.
                notifier.stop().await;
                scheduler.stop().await;

                notifier = match Notifier::new(&new_config.webhook) {
                    Ok(new_notifier) => Arc::new(new_notifier),
                    Err(error) => {
                        error!("Could not recreate webhook sender: {error}");
                        return;
                    }
                };
                scheduler = Scheduler::new(Arc::clone(&new_config), Arc::clone(&notifier));

                ticker = tokio::time::interval(new_config.reconcile_interval);

                info!("Configuration reloaded");
            }
        }
    }

    // Shutdown order: discovery and GC via the root token, then the
    // scheduler, then the notifier drains its queue.
    root.cancel();
    scheduler.stop().await;
    notifier.stop().await;

    info!("Label backup agent stopped.");
}
