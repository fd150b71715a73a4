/// Config file loader with validation and hot-reload support.
///
/// Reads the gateway config from a single YAML (or JSON) file, validates on
/// load, watches the file for changes via `notify`, and publishes each valid
/// revision through a `tokio::sync::watch` channel. Invalid edits are logged
/// and the previous config stays current.
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;

use crate::config::{find_tool_collision, GatewayConfig};
use crate::errors::GatewayError;

/// Loads, validates, and watches the gateway configuration file.
pub struct ConfigLoader {
    /// Path of the config file.
    path: PathBuf,
    /// Watch sender for broadcasting config changes.
    tx: watch::Sender<GatewayConfig>,
    /// File watcher handle (kept alive to maintain the watch).
    _watcher: Option<RecommendedWatcher>,
}

impl ConfigLoader {
    /// Load and validate the config file, returning a `ConfigLoader` along with
    /// a `watch::Receiver` for subscribing to config changes.
    ///
    /// Call `watch()` afterwards to start hot-reload file watching.
    pub fn load(path: &Path) -> Result<(Self, watch::Receiver<GatewayConfig>), GatewayError> {
        let config = Self::load_file(path)?;
        Self::validate(&config)?;

        let (tx, rx) = watch::channel(config);

        Ok((
            Self {
                path: path.to_path_buf(),
                tx,
                _watcher: None,
            },
            rx,
        ))
    }

    /// Path of the watched config file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start watching the config file for changes.
    ///
    /// The parent directory is watched so that editors which replace the file
    /// (write-to-temp then rename) are still noticed.
    pub fn watch(&mut self) -> Result<(), GatewayError> {
        let path = self.path.clone();
        let tx = self.tx.clone();
        let watch_dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let touches_config = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if !touches_config
                        || !matches!(
                            event.kind,
                            EventKind::Create(_) | EventKind::Modify(_)
                        )
                    {
                        return;
                    }
                    match Self::load_file(&path).and_then(|config| {
                        Self::validate(&config)?;
                        Ok(config)
                    }) {
                        Ok(config) => {
                            let changed = tx.send_if_modified(|current| {
                                if *current == config {
                                    false
                                } else {
                                    *current = config;
                                    true
                                }
                            });
                            if changed {
                                tracing::info!(path = %path.display(), "config reloaded successfully");
                            }
                        }
                        Err(e) => {
                            tracing::warn!("config reload failed after file change, keeping previous config: {e}");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("file watcher error: {e}");
                }
            }
        })
        .map_err(|e| GatewayError::Config(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::Config(format!("failed to watch config file: {e}")))?;

        self._watcher = Some(watcher);
        tracing::info!(path = %self.path.display(), "started watching config file");
        Ok(())
    }

    /// Read and parse the config file without validating it.
    pub fn load_file(path: &Path) -> Result<GatewayConfig, GatewayError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&content)
            .map_err(|e| GatewayError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Parse config text (YAML or JSON).
    pub fn parse(content: &str) -> Result<GatewayConfig, GatewayError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Validate the config for internal consistency.
    ///
    /// Checks:
    /// - Every backend selects exactly one transport, with valid parameters
    /// - No tool name is claimed by two backends
    /// - Gateway duration settings parse
    pub fn validate(config: &GatewayConfig) -> Result<(), GatewayError> {
        for (name, spec) in &config.servers {
            spec.validate(name)?;
        }
        if let Some((tool, first, second)) = find_tool_collision(&config.servers) {
            return Err(GatewayError::Config(format!(
                "tool '{tool}' is claimed by both backend '{first}' and backend '{second}'"
            )));
        }
        config.gateway.timeouts()?;
        if config.gateway.container_runtime.trim().is_empty() {
            return Err(GatewayError::Config(
                "gateway.container_runtime must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
