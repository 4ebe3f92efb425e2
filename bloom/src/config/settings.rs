use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// UI-state preferences persisted next to the configuration file
/// (`bloom.settings.json`).
///
/// The core never requires this file - absence, or a failure to parse it,
/// simply yields defaults. Writes are best-effort.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSettings {
    /// Insight main window width, in pixels.
    #[serde(default)]
    pub main_window_width: Option<u32>,
    /// Insight main window height, in pixels.
    #[serde(default)]
    pub main_window_height: Option<u32>,
    /// Whether the target registers pane is open.
    #[serde(default)]
    pub registers_pane_visible: bool,
    /// Whether the RAM inspection pane is open.
    #[serde(default)]
    pub ram_inspection_pane_visible: bool,
    /// Whether the EEPROM inspection pane is open.
    #[serde(default)]
    pub eeprom_inspection_pane_visible: bool,
    /// Key of the last selected target variant.
    #[serde(default)]
    pub selected_variant_key: Option<String>,
}

impl ProjectSettings {
    /// The sidecar path for a given configuration file path.
    pub fn path_for_config(config_path: &Path) -> PathBuf {
        config_path.with_file_name("bloom.settings.json")
    }

    /// Loads settings from `path`, falling back to defaults when the file is
    /// absent or unreadable.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|error| {
                tracing::warn!(
                    "Failed to parse project settings file \"{}\" - falling back to defaults. \
                     Error: {error}",
                    path.display()
                );
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Persists the settings to `path`. Failures are logged, never fatal.
    pub fn save(&self, path: &Path) {
        let raw = match serde_json::to_string_pretty(self) {
            Ok(raw) => raw,
            Err(error) => {
                tracing::error!("Failed to serialize project settings: {error}");
                return;
            }
        };

        if let Err(error) = std::fs::write(path, raw) {
            tracing::error!(
                "Failed to write project settings file \"{}\": {error}",
                path.display()
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn absent_file_yields_defaults() {
        let settings = ProjectSettings::load(Path::new("/nonexistent/bloom.settings.json"));
        assert!(settings.main_window_width.is_none());
        assert!(!settings.registers_pane_visible);
    }

    #[test]
    fn sidecar_path_sits_next_to_the_config() {
        let path = ProjectSettings::path_for_config(Path::new("/project/bloom.yaml"));
        assert_eq!(path, PathBuf::from("/project/bloom.settings.json"));
    }
}
