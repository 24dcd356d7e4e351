use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use thiserror::Error;

/// Tunable constants for the GJK queries.
///
/// The defaults assume game-world scale (meters). Worlds at a very different scale
/// should load their own values rather than rely on these.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GjkSettings {
    /// Relative gap between the upper and lower distance bounds at which
    /// `distance` reports convergence.
    pub rel_error: f32,
    /// Absolute distance below which two shapes count as touching.
    pub abs_tolerance: f32,
    /// Squared length under which a search direction is treated as zero.
    pub zero_epsilon: f32,
    /// Iteration cap per query. A query gives up once its iteration count
    /// exceeds this value, so up to `max_iterations + 1` vertices get inserted.
    pub max_iterations: u32,
    /// Margin added around a convex's bounds when deciding which working partners
    /// get a collision state.
    pub state_margin: f32,
}

impl Default for GjkSettings {
    fn default() -> Self {
        Self {
            rel_error: 1e-5,
            abs_tolerance: 1e-3,
            zero_epsilon: 1e-20,
            max_iterations: 15,
            state_margin: 1.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Deserialization Error: {0}")]
    Serde(#[from] toml::de::Error),

    #[error("Serialization Error: {0}")]
    SerdeSer(#[from] toml::ser::Error),

    #[error("Invalid setting `{name}`: {reason}")]
    Invalid { name: &'static str, reason: &'static str },
}

impl GjkSettings {
    /// Parses settings from TOML text. Missing keys fall back to the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, SettingsError> {
        let settings: GjkSettings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a specified file path.
    pub fn load_from_file(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Saves settings to a specified file path, ensuring the directory exists.
    pub fn save_to_file(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Loads settings from `path`, falling back to the defaults if the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            log::debug!("GJK settings not found at {}. Using defaults.", path.display());
            return Self::default();
        }

        match Self::load_from_file(path) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!(
                    "Failed to load GJK settings from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(self.rel_error > 0.0) {
            return Err(SettingsError::Invalid {
                name: "rel_error",
                reason: "must be positive",
            });
        }
        if !(self.abs_tolerance >= 0.0) {
            return Err(SettingsError::Invalid {
                name: "abs_tolerance",
                reason: "must not be negative",
            });
        }
        if !(self.zero_epsilon >= 0.0) {
            return Err(SettingsError::Invalid {
                name: "zero_epsilon",
                reason: "must not be negative",
            });
        }
        if !(self.state_margin >= 0.0) {
            return Err(SettingsError::Invalid {
                name: "state_margin",
                reason: "must not be negative",
            });
        }
        if self.max_iterations == 0 {
            return Err(SettingsError::Invalid {
                name: "max_iterations",
                reason: "must allow at least one iteration",
            });
        }
        Ok(())
    }
}
