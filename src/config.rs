// src/config.rs
// Host settings and render-mode footswitch scripts. Engine geometry is fixed
// at build time; nothing here changes how the looper itself behaves.

use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::audio::{DEFAULT_MEMORY_BYTES, EngineConfig};

pub const DEFAULT_SETTINGS_FILE: &str = "autolooper.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LooperSettings {
    /// Input device name; the host default when unset.
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    /// Size of the external loop memory in bytes.
    pub memory_bytes: usize,
    /// Address of a `serve-ram` instance to page into instead of local RAM.
    pub ram_server: Option<String>,
    pub log_file: PathBuf,
    pub debug: bool,
}

impl Default for LooperSettings {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            memory_bytes: DEFAULT_MEMORY_BYTES,
            ram_server: None,
            log_file: PathBuf::from("debug.log"),
            debug: false,
        }
    }
}

impl LooperSettings {
    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let config = self.engine_config();
        if config.max_loop_length() < config.min_loop_length() {
            return Err(ConfigError::Invalid(format!(
                "memory_bytes = {} cannot hold the shortest loop",
                self.memory_bytes
            )));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default().with_memory_bytes(self.memory_bytes)
    }
}

/// One scripted footswitch press, in seconds from the start of the input.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Press {
    pub at: f64,
    pub duration: f64,
}

/// Footswitch timeline for offline rendering:
///
/// ```toml
/// [[press]]
/// at = 0.5
/// duration = 0.05
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FootswitchScript {
    #[serde(default, rename = "press")]
    pub presses: Vec<Press>,
}

impl FootswitchScript {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let script: Self = toml::from_str(text)?;
        for press in &script.presses {
            if !(press.at >= 0.0 && press.duration > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "press at {}s for {}s is not a valid press",
                    press.at, press.duration
                )));
            }
        }
        Ok(script)
    }

    /// Switch level for each of `len` samples.
    pub fn levels(&self, len: usize, sample_rate: u32) -> Vec<bool> {
        let rate = sample_rate as f64;
        let mut levels = vec![false; len];
        for press in &self.presses {
            let start = ((press.at * rate) as usize).min(len);
            let end = (((press.at + press.duration) * rate) as usize).min(len);
            levels[start..end].fill(true);
        }
        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_settings_file_gives_defaults() {
        let settings = LooperSettings::load("/nonexistent/autolooper.toml").unwrap();
        assert_eq!(settings, LooperSettings::default());
        assert_eq!(settings.engine_config().memory_bytes, DEFAULT_MEMORY_BYTES);
    }

    #[test]
    fn test_partial_settings_keep_defaults() {
        let settings = LooperSettings::from_toml(
            r#"
output_device = "Scarlett 2i2"
ram_server = "127.0.0.1:7070"
"#,
        )
        .unwrap();
        assert_eq!(settings.output_device.as_deref(), Some("Scarlett 2i2"));
        assert_eq!(settings.ram_server.as_deref(), Some("127.0.0.1:7070"));
        assert_eq!(settings.memory_bytes, DEFAULT_MEMORY_BYTES);
        assert!(!settings.debug);
    }

    #[test]
    fn test_tiny_memory_is_rejected() {
        let err = LooperSettings::from_toml("memory_bytes = 1024").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(matches!(
            LooperSettings::from_toml("memory_bytes = \"lots\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_script_levels() {
        let script = FootswitchScript::from_toml(
            r#"
[[press]]
at = 0.001
duration = 0.002

[[press]]
at = 0.009
duration = 1.0
"#,
        )
        .unwrap();
        assert_eq!(script.presses.len(), 2);

        let levels = script.levels(10, 1000);
        assert_eq!(
            levels,
            vec![false, true, true, false, false, false, false, false, false, true]
        );
    }

    #[test]
    fn test_script_rejects_bad_press() {
        let err = FootswitchScript::from_toml("[[press]]\nat = -1.0\nduration = 0.1\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
        assert!(FootswitchScript::from_toml("").unwrap().presses.is_empty());
    }
}
