use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TidelineConfig {
    #[serde(default)]
    pub accumulator: AccumulatorConfig,
    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatorConfig {
    /// Upper bound on timeline events retained per room.
    #[serde(default = "default_max_timeline_entries")]
    pub max_timeline_entries: usize,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            max_timeline_entries: default_max_timeline_entries(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Maximum number of events a window keeps visible.
    #[serde(default = "default_window_limit")]
    pub window_limit: usize,
    /// Events loaded by `load` when the caller does not say otherwise.
    #[serde(default = "default_initial_size")]
    pub initial_size: usize,
    /// Default cap on network fetches per `paginate` call.
    #[serde(default = "default_request_limit")]
    pub request_limit: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_limit: default_window_limit(),
            initial_size: default_initial_size(),
            request_limit: default_request_limit(),
        }
    }
}

const fn default_max_timeline_entries() -> usize {
    50
}

const fn default_window_limit() -> usize {
    1000
}

const fn default_initial_size() -> usize {
    20
}

const fn default_request_limit() -> u32 {
    1
}

impl TidelineConfig {
    /// Reject values the engine cannot work with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first zero-valued limit.
    pub fn validate(&self) -> Result<()> {
        if self.accumulator.max_timeline_entries == 0 {
            bail!("accumulator.max_timeline_entries must be > 0");
        }
        if self.window.window_limit == 0 {
            bail!("window.window_limit must be > 0");
        }
        if self.window.initial_size > self.window.window_limit {
            bail!(
                "window.initial_size ({}) exceeds window.window_limit ({})",
                self.window.initial_size,
                self.window.window_limit
            );
        }
        Ok(())
    }
}

/// Default location: `<config dir>/tideline/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tideline/config.toml"))
}

/// Load and validate a config file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or fails validation.
pub fn load_config(path: &Path) -> Result<TidelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config = toml::from_str::<TidelineConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config in {}", path.display()))?;
    Ok(config)
}

/// Resolve the effective config.
///
/// Precedence: explicit path (must exist), then the default location if it
/// exists, then built-in defaults.
///
/// # Errors
///
/// Returns an error if a config file exists but is unreadable or invalid.
pub fn resolve_config(explicit: Option<&Path>) -> Result<TidelineConfig> {
    if let Some(path) = explicit {
        return load_config(path);
    }

    match default_config_path() {
        Some(path) if path.exists() => load_config(&path),
        _ => Ok(TidelineConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = TidelineConfig::default();
        assert_eq!(config.accumulator.max_timeline_entries, 50);
        assert_eq!(config.window.window_limit, 1000);
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[window]\nwindow_limit = 64").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.window.window_limit, 64);
        assert_eq!(config.window.initial_size, 20);
        assert_eq!(config.accumulator, AccumulatorConfig::default());
    }

    #[test]
    fn zero_limit_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[accumulator]\nmax_timeline_entries = 0").unwrap();

        let err = load_config(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("max_timeline_entries"));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_config(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
