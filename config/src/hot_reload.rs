//! # Configuration Hot Reload
//!
//! Watches the configuration file and republishes the binding policy when it
//! changes, so the next grant reads the new mode without a restart.

use crate::file_loader::load_from_file;
use authz_core::{BindMode, BindPolicySource};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration reload event.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigReloadEvent {
    Ready,

    /// Configuration file changed
    Changed(PathBuf),

    /// Configuration file was removed
    Removed(PathBuf),

    /// Watcher setup failed
    Error { path: PathBuf, error: String }
}

/// Watch a configuration file for changes and emit reload events.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Monitors the configuration file with the `notify` crate and forwards
/// changes as [`ConfigReloadEvent`]s. The watcher stops once the receiver is
/// dropped.
///
/// ## Usage
/// ```rust,no_run
/// use config::{hot_reload::ConfigReloadEvent, watch_config};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (_tx, mut rx) = watch_config(std::path::Path::new("authz.toml")).await?;
///     while let Some(event) = rx.recv().await {
///         if let ConfigReloadEvent::Changed(path) = event {
///             println!("Config changed: {:?}", path);
///         }
///     }
///     Ok(())
/// }
/// ```
///
/// ## Event Types
/// - `Ready`: Watcher installed
/// - `Changed`: File created or modified
/// - `Removed`: File deleted
/// - `Error`: Watcher could not be installed
pub async fn watch_config(
    config_path: &Path
) -> Result<
    (
        mpsc::Sender<ConfigReloadEvent>,
        mpsc::Receiver<ConfigReloadEvent>
    ),
    Box<dyn std::error::Error>
> {
    let config_path = config_path.to_path_buf();

    if !config_path.exists() {
        return Err(Box::new(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Config file not found: {:?}", config_path)
        )));
    }

    let (tx, rx) = mpsc::channel(100);
    let events = tx.clone();

    tokio::spawn(async move {
        let (raw_tx, mut raw_rx) = mpsc::channel::<notify::Result<Event>>(100);
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.blocking_send(res);
            },
            notify::Config::default()
        )
        .and_then(|mut w| {
            w.watch(&config_path, RecursiveMode::NonRecursive)
                .map(|()| w)
        });

        // Held until the loop ends; dropping it stops the OS watch.
        let _watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                let message = format!("Failed to watch config file: {}", e);
                error!("{}", message);
                let _ = events
                    .send(ConfigReloadEvent::Error {
                        path: config_path,
                        error: message
                    })
                    .await;
                return;
            }
        };

        info!("Watching config file: {:?}", config_path);
        let _ = events.send(ConfigReloadEvent::Ready).await;

        loop {
            let raw = tokio::select! {
                () = events.closed() => {
                    debug!("Receiver dropped, stopping watcher for {:?}", config_path);
                    break;
                }
                raw = raw_rx.recv() => raw
            };

            let Some(raw) = raw else {
                break;
            };

            let event = match raw {
                Ok(event) => event,
                Err(e) => {
                    warn!("Watch error: {}", e);
                    continue;
                }
            };

            let Some(path) = event.paths.first().cloned() else {
                continue;
            };

            let reload_event = match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => ConfigReloadEvent::Changed(path),
                EventKind::Remove(_) => ConfigReloadEvent::Removed(path),
                other => {
                    debug!("Ignoring event: {:?}", other);
                    continue;
                }
            };

            if events.send(reload_event).await.is_err() {
                break;
            }
        }
    });

    Ok((tx, rx))
}

/// A binding policy that can be swapped at runtime.
///
/// The engine reads it on every grant, so a reload takes effect for the next
/// grant while grants already past policy resolution keep the mode they read.
#[derive(Debug, Clone, Default)]
pub struct SharedBindPolicy {
    mode: Arc<RwLock<BindMode>>
}

impl SharedBindPolicy {
    pub fn new(mode: BindMode) -> Self {
        Self {
            mode: Arc::new(RwLock::new(mode))
        }
    }

    /// Publishes a new mode. Returns the previous one.
    pub fn set(&self, mode: BindMode) -> BindMode {
        std::mem::replace(&mut *self.mode.write(), mode)
    }
}

impl BindPolicySource for SharedBindPolicy {
    fn bind_mode(&self) -> BindMode {
        *self.mode.read()
    }
}

/// Reloads the binding policy from `config_path` whenever the file changes.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Keeps a [`SharedBindPolicy`] in step with the configuration file. A file
/// that fails to parse or validate is logged and ignored; the last good mode
/// stays in effect.
///
/// ## Usage
/// ```rust,no_run
/// use config::{SharedBindPolicy, spawn_policy_reload};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let policy = SharedBindPolicy::default();
///     let _reload = spawn_policy_reload(std::path::Path::new("authz.toml"), policy.clone()).await?;
///     Ok(())
/// }
/// ```
pub async fn spawn_policy_reload(
    config_path: &Path,
    policy: SharedBindPolicy
) -> Result<JoinHandle<()>, Box<dyn std::error::Error>> {
    let (_tx, mut rx) = watch_config(config_path).await?;
    let path = config_path.to_path_buf();

    Ok(tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ConfigReloadEvent::Changed(_) => reload_policy(&path, &policy),
                ConfigReloadEvent::Removed(removed) => {
                    warn!(
                        "Config file removed, keeping bind mode {}: {:?}",
                        policy.bind_mode(),
                        removed
                    );
                }
                ConfigReloadEvent::Error { path, error } => {
                    error!("Config watcher failed for {:?}: {}", path, error);
                    break;
                }
                ConfigReloadEvent::Ready => {}
            }
        }
    }))
}

fn reload_policy(path: &Path, policy: &SharedBindPolicy) {
    let config = match load_from_file(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("Ignoring unreadable config {:?}: {}", path, e);
            return;
        }
    };

    if let Err(e) = crate::validation::validate(&config) {
        warn!("Ignoring invalid config {:?}: {}", path, e);
        return;
    }

    let mode = config.permissions_user_mapping.bind_id;
    let previous = policy.set(mode);
    if previous != mode {
        info!(previous = %previous, current = %mode, "Bind mode reloaded");
    }
}
