use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {config_path}: {source}")]
    ConfigReadError {
        config_path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {config_path}: {source}")]
    ConfigParseError {
        config_path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid config file at {config_path}: {reason}")]
    Invalid { config_path: PathBuf, reason: String },
}

/// Highlight separation and click targets, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySection {
    pub nudge_px: i32,
    pub hit_strip_px: f32,
}

impl Default for OverlaySection {
    fn default() -> Self {
        Self {
            nudge_px: 3,
            hit_strip_px: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionSection {
    pub debounce_ms: u64,
}

impl Default for SelectionSection {
    fn default() -> Self {
        Self { debounce_ms: 150 }
    }
}

/// Size of one terminal cell in layout pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutSection {
    pub cell_width: f32,
    pub line_height: f32,
}

impl Default for LayoutSection {
    fn default() -> Self {
        Self {
            cell_width: 8.0,
            line_height: 16.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub overlay: OverlaySection,
    pub selection: SelectionSection,
    pub layout: LayoutSection,
    /// Where the reader writes its log. Defaults to next to the config file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Option<Self>, ConfigError> {
        let config_path = config_path.as_ref();
        if !config_path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(config_path).map_err(|source| {
            ConfigError::ConfigReadError {
                config_path: config_path.to_path_buf(),
                source,
            }
        })?;

        let mut config: Config =
            toml::from_str(&content).map_err(|source| ConfigError::ConfigParseError {
                config_path: config_path.to_path_buf(),
                source,
            })?;

        config.validate().map_err(|reason| ConfigError::Invalid {
            config_path: config_path.to_path_buf(),
            reason,
        })?;

        // Expand shell variables and tilde in the log path
        config.log_file = config
            .log_file
            .map(|p| Self::expand_path(&p).unwrap_or(p));

        Ok(Some(config))
    }

    pub fn load() -> Result<Option<Self>, ConfigError> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, config_path: P) -> anyhow::Result<()> {
        let config_path = config_path.as_ref();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        self.save_to_path(&config_path)
    }

    pub fn config_dir() -> PathBuf {
        PathBuf::from(shellexpand::tilde("~/.config/marginalia").as_ref())
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// The configured log file, or `marginalia.log` in the config directory.
    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("marginalia.log"))
    }

    /// Check the constants are usable. Highlights of different kinds are only
    /// kept clickably apart when each nudge clears a whole hit-strip.
    pub fn validate(&self) -> Result<(), String> {
        let overlay = &self.overlay;
        if overlay.hit_strip_px <= 0.0 {
            return Err(format!(
                "overlay.hit_strip_px must be positive, got {}",
                overlay.hit_strip_px
            ));
        }
        if (overlay.nudge_px as f32) < overlay.hit_strip_px {
            return Err(format!(
                "overlay.nudge_px ({}) must be at least overlay.hit_strip_px ({})",
                overlay.nudge_px, overlay.hit_strip_px
            ));
        }
        if self.layout.cell_width <= 0.0 || self.layout.line_height <= 0.0 {
            return Err("layout.cell_width and layout.line_height must be positive".to_string());
        }
        if overlay.hit_strip_px > self.layout.line_height {
            return Err(format!(
                "overlay.hit_strip_px ({}) cannot exceed layout.line_height ({})",
                overlay.hit_strip_px, self.layout.line_height
            ));
        }
        Ok(())
    }

    fn expand_path(path: &Path) -> Option<PathBuf> {
        let path_str = path.to_string_lossy();
        match shellexpand::full(&path_str) {
            Ok(expanded) => Some(PathBuf::from(expanded.as_ref())),
            Err(_) => None,
        }
    }
}
