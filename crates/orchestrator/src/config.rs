use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::rules::RuleName;

const CONFIG_DIR: &str = ".cadence";
const CONFIG_FILE: &str = "config.json";

/// Per-participant engine settings stored in .cadence/config.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Id this participant reports under
    pub participant_id: String,
    /// Observers watch a session without counting toward thresholds
    pub observer: bool,
    /// Advancement rule used when neither the plan nor the position names one
    pub default_rule: String,
    /// Run gameover as soon as the sequence ends
    pub auto_gameover: bool,
    /// Messages kept while paused; older ones are dropped first
    pub pause_buffer_limit: usize,
    /// Capacity of the lifecycle event bus
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            participant_id: Uuid::new_v4().to_string(),
            observer: false,
            default_rule: RuleName::Solo.as_str().to_string(),
            auto_gameover: false,
            pause_buffer_limit: 256,
            event_capacity: 1000,
        }
    }
}

impl EngineConfig {
    pub fn for_participant(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            ..Self::default()
        }
    }

    /// Read config from a working directory
    pub async fn read(dir: &Path) -> Self {
        let config_path = dir.join(CONFIG_DIR).join(CONFIG_FILE);

        if !config_path.exists() {
            debug!(path = %config_path.display(), "Config file does not exist, using defaults");
            return Self::default();
        }

        match fs::read_to_string(&config_path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => {
                    debug!(path = %config_path.display(), "Config loaded");
                    config
                }
                Err(e) => {
                    warn!(path = %config_path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "Failed to read config file, using defaults");
                Self::default()
            }
        }
    }

    /// Write config to a working directory
    pub async fn write(&self, dir: &Path) -> std::io::Result<()> {
        let config_dir = dir.join(CONFIG_DIR);
        let config_path = config_dir.join(CONFIG_FILE);

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).await?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        fs::write(&config_path, content).await?;
        debug!(path = %config_path.display(), "Config saved");

        Ok(())
    }
}
