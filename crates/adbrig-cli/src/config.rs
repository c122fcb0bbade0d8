use std::{fs, io, path::PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CliConfig {
    /// Application-supplied adb location, consulted after the env override.
    pub adb_path: Option<String>,
    /// Serial used when none is given on the command line.
    pub default_serial: Option<String>,
}

pub fn load() -> CliConfig {
    let path = config_path();
    match fs::read_to_string(&path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("Failed to parse {}: {}", path.display(), err);
                CliConfig::default()
            }
        },
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), err);
            }
            CliConfig::default()
        }
    }
}

pub fn save(config: &CliConfig) -> io::Result<()> {
    adbrig_util::write_json_atomic(&config_path(), config)
}

fn config_path() -> PathBuf {
    adbrig_util::state_file_path(CONFIG_FILE_NAME)
}
