//! Container discovery.
//!
//! The watcher keeps the registry a consistent projection of the runtime's
//! container state: an initial scan seeds it, then a filtered event stream
//! keeps it current. The registry is the single source of truth the
//! reconciler feeds into the scheduler.

use core::time::Duration;
use std::{
    collections::HashMap,
    sync::RwLock,
};

use bollard::{
    container::{InspectContainerOptions, ListContainersOptions},
    models::EventMessage,
    system::EventsOptions,
    Docker,
};
use futures_util::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    context::short_id,
    spec::{parse_labels, BackupSpec},
};

/// The backup specifications for discovered containers, keyed by container id.
pub type Registry = HashMap<String, BackupSpec>;

const INSPECT_TIMEOUT: Duration = Duration::from_secs(5);

const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Watches container runtime events and maintains the registry.
pub struct Watcher {
    docker: Docker,
    registry: RwLock<Registry>,
}

impl Watcher {
    /// Connect to the local container runtime.
    pub fn new() -> Result<Self, DiscoveryError> {
        let docker =
            Docker::connect_with_local_defaults().map_err(DiscoveryError::Connect)?;

        info!("Container event watcher initialized");

        Ok(Self {
            docker,
            registry: RwLock::new(Registry::new()),
        })
    }

    /// A connectivity probe, used before reconnect attempts and by the
    /// readiness endpoint.
    pub async fn ping(&self) -> Result<(), DiscoveryError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(DiscoveryError::Ping)
    }

    /// An independent copy of the current registry.
    pub fn registry_snapshot(&self) -> Registry {
        self.registry
            .read()
            .expect("registry lock is never poisoned")
            .clone()
    }

    /// Run the watcher until cancelled: scan existing containers, then follow
    /// the event stream, reconnecting with exponential backoff on errors.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = RECONNECT_INITIAL;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            if let Err(error) = self.ping().await {
                warn!("Container runtime unreachable: {error}");
                if !self.wait_backoff(&cancel, &mut backoff).await {
                    return;
                }
                continue;
            }

            self.scan_existing(&cancel).await;
            backoff = RECONNECT_INITIAL;

            let filters =
                HashMap::from([("type".to_owned(), vec!["container".to_owned()])]);
            let mut events = self.docker.events(Some(EventsOptions::<String> {
                filters,
                ..Default::default()
            }));

            info!("Listening for container events...");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Container event listener stopping");
                        return;
                    }
                    event = events.next() => match event {
                        Some(Ok(event)) => self.handle_event(event).await,
                        Some(Err(error)) => {
                            error!("Container event stream failed: {error}");
                            break;
                        }
                        None => {
                            info!("Container event stream closed");
                            break;
                        }
                    }
                }
            }

            if !self.wait_backoff(&cancel, &mut backoff).await {
                return;
            }
        }
    }

    /// Sleep for the current backoff. Returns false when cancelled.
    async fn wait_backoff(&self, cancel: &CancellationToken, backoff: &mut Duration) -> bool {
        debug!("Reconnecting to the container runtime in {backoff:?}");

        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(*backoff) => {}
        }

        *backoff = (*backoff * 2).min(RECONNECT_CAP);
        true
    }

    /// Seed the registry from the containers that already exist.
    async fn scan_existing(&self, cancel: &CancellationToken) {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let containers = match self.docker.list_containers(Some(options)).await {
            Ok(containers) => containers,
            Err(error) => {
                error!("Failed to list existing containers: {error}");
                return;
            }
        };

        info!("Found {} existing containers", containers.len());

        for container in containers {
            if cancel.is_cancelled() {
                return;
            }

            let Some(id) = container.id else { continue };
            self.inspect_and_apply(&id).await;
        }
    }

    async fn handle_event(&self, event: EventMessage) {
        let Some(actor) = event.actor else { return };
        let Some(id) = actor.id else { return };
        let action = event.action.unwrap_or_default();

        debug!(
            "Container event {action} for {} ({})",
            short_id(&id),
            actor
                .attributes
                .as_ref()
                .and_then(|attributes| attributes.get("name").cloned())
                .unwrap_or_default(),
        );

        match action.as_str() {
            "start" | "create" | "update" => self.inspect_and_apply(&id).await,
            "destroy" | "die" | "kill" | "stop" => {
                let removed = {
                    let mut registry = self
                        .registry
                        .write()
                        .expect("registry lock is never poisoned");
                    registry.remove(&id).is_some()
                };

                if removed {
                    info!(
                        "Unregistered backup spec for {} after {action} event",
                        short_id(&id)
                    );
                }
            }
            // pause/unpause and the rest do not change backup necessity.
            _ => {}
        }
    }

    /// Inspect a container and upsert or evict its registry entry based on
    /// the parse result. Inspection failures are logged and skipped so a
    /// flaky daemon cannot poison the registry.
    async fn inspect_and_apply(&self, id: &str) {
        let inspect = tokio::time::timeout(
            INSPECT_TIMEOUT,
            self.docker
                .inspect_container(id, None::<InspectContainerOptions>),
        )
        .await;

        let inspect = match inspect {
            Ok(Ok(inspect)) => inspect,
            Ok(Err(error)) => {
                error!("Failed to inspect container {}: {error}", short_id(id));
                return;
            }
            Err(_) => {
                error!(
                    "Inspecting container {} timed out after {INSPECT_TIMEOUT:?}",
                    short_id(id)
                );
                return;
            }
        };

        let name = inspect.name.unwrap_or_default();
        let labels = inspect
            .config
            .and_then(|config| config.labels)
            .unwrap_or_default();

        let mut registry = self
            .registry
            .write()
            .expect("registry lock is never poisoned");

        match parse_labels(&labels, id, &name) {
            Some(spec) => {
                info!(
                    "Registered backup spec for {} ({}): {} every '{}' to {}",
                    spec.container_name,
                    short_id(id),
                    spec.kind,
                    spec.cron,
                    spec.dest,
                );
                registry.insert(id.to_owned(), spec);
            }
            None => {
                if registry.remove(id).is_some() {
                    info!(
                        "Unregistered backup spec for {}: labels removed, disabled, or invalid",
                        short_id(id)
                    );
                }
            }
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to connect to the container runtime:\n{0}")]
    Connect(#[source] bollard::errors::Error),

    #[error("Container runtime ping failed:\n{0}")]
    Ping(#[source] bollard::errors::Error),
}
