//! Project configuration (`bloom.yaml`).
//!
//! The configuration file lives in the working directory and carries a map of
//! named environments, each selecting a debug tool, a target and a debug
//! server, plus behavioral flags. Unknown keys are warned about and ignored;
//! missing required keys are fatal.

mod settings;

pub use settings::ProjectSettings;

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use bloom_target::PhysicalInterface;

use crate::error::Error;

/// The keys renamed in v1.0.0. Both forms are recognised so we can warn with
/// a migration pointer instead of silently ignoring the old key.
const RENAMED_KEYS: &[(&str, &str)] = &[("debugTool", "tool"), ("debugServer", "server")];

fn default_true() -> bool {
    true
}

fn default_power_cycle_delay() -> u64 {
    250
}

/// The top-level structure of `bloom.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Named environments. At least one is required.
    pub environments: BTreeMap<String, EnvironmentConfig>,
    /// Project-wide debug server configuration, overridable per environment.
    #[serde(default)]
    pub server: Option<ServerConfig>,
    /// Project-wide Insight GUI configuration, overridable per environment.
    #[serde(default)]
    pub insight: Option<InsightConfig>,
    /// Enables debug-level log output.
    #[serde(default)]
    pub debug_logging: bool,

    #[serde(flatten)]
    unknown_keys: BTreeMap<String, serde_yaml::Value>,
}

/// One environment: a (tool, target, server) selection plus behavior flags.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    /// The debug tool to use.
    pub tool: ToolConfig,
    /// The target to debug.
    pub target: TargetConfig,
    /// Debug server configuration for this environment. Falls back to the
    /// project-wide `server` block.
    #[serde(default)]
    pub server: Option<ServerConfig>,
    /// Insight configuration for this environment.
    #[serde(default)]
    pub insight: Option<InsightConfig>,
    /// Shut Bloom down when the debug session ends, instead of suspending.
    #[serde(default)]
    pub shutdown_post_debug_session: bool,

    #[serde(flatten)]
    unknown_keys: BTreeMap<String, serde_yaml::Value>,
}

/// Debug tool selection.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolConfig {
    /// Registry name of the tool ("atmel-ice", "wch-link-e", "simulator", ...).
    pub name: String,
    /// Release the tool and suspend the target controller when the debug
    /// session ends.
    #[serde(default)]
    pub release_post_debug_session: bool,

    #[serde(flatten)]
    unknown_keys: BTreeMap<String, serde_yaml::Value>,
}

/// Target selection and per-target behavior flags.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Name of the target ("atmega328p", "ch32v003", ...).
    pub name: String,
    /// The physical interface between tool and target.
    pub physical_interface: PhysicalInterface,
    /// Resume target execution once the controller has activated it.
    #[serde(default = "default_true")]
    pub resume_on_startup: bool,
    /// Permit hardware breakpoints.
    #[serde(default = "default_true")]
    pub hardware_breakpoints: bool,
    /// Cache program memory reads while debugging.
    #[serde(default = "default_true")]
    pub program_memory_cache: bool,
    /// Write only the flash blocks that differ when programming.
    #[serde(default = "default_true")]
    pub delta_programming: bool,
    /// Reserve one hardware breakpoint slot for single-stepping.
    #[serde(default)]
    pub reserve_stepping_breakpoint: bool,
    /// Permit Bloom to manage the DWEN fuse bit (debugWIRE targets).
    #[serde(default)]
    pub manage_dwen_fuse_bit: bool,
    /// Permit Bloom to manage the OCDEN fuse bit (JTAG targets).
    #[serde(default)]
    pub manage_ocden_fuse_bit: bool,
    /// Cycle target power after a DWEN fuse update.
    #[serde(default)]
    pub cycle_target_power_post_dwen_update: bool,
    /// Milliseconds to hold power off (and wait after power-up) when cycling
    /// target power.
    #[serde(default = "default_power_cycle_delay")]
    pub target_power_cycle_delay_ms: u64,
    /// Program the EESAVE fuse before a chip erase, so EEPROM survives.
    #[serde(default = "default_true")]
    pub preserve_eeprom: bool,

    #[serde(flatten)]
    unknown_keys: BTreeMap<String, serde_yaml::Value>,
}

/// Debug server selection. The server component itself consumes the
/// flattened remainder; the core only needs to know one is configured.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Name of the debug server implementation ("avr-gdb-rsp", ...).
    pub name: String,

    /// Server-specific options (listen address, port, ...), consumed by the
    /// server component itself.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Insight GUI configuration. Consumed by the Insight component; carried here
/// so the config file round-trips in one place.
#[derive(Debug, Clone, Deserialize)]
pub struct InsightConfig {
    /// Open the Insight window on startup.
    #[serde(default)]
    pub activate_on_startup: bool,
    /// Shut Bloom down when the Insight window is closed.
    #[serde(default)]
    pub shutdown_on_close: bool,
    /// Key of the target variant to preselect.
    #[serde(default)]
    pub default_variant_key: Option<String>,
}

impl ProjectConfig {
    /// Loads and validates `bloom.yaml` from `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            Error::InvalidConfig(format!(
                "failed to read configuration file \"{}\": {error}",
                path.display()
            ))
        })?;

        Self::parse(&raw)
    }

    /// Parses and validates configuration document contents.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let config: ProjectConfig = serde_yaml::from_str(raw)
            .map_err(|error| Error::InvalidConfig(format!("malformed configuration: {error}")))?;

        if config.environments.is_empty() {
            return Err(Error::InvalidConfig(
                "no environments found - please review the bloom.yaml configuration file".to_owned(),
            ));
        }

        config.warn_unknown_keys();
        Ok(config)
    }

    /// Resolves an environment by name.
    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig, Error> {
        self.environments.get(name).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "environment \"{name}\" not found in configuration - available environments: {}",
                self.environments.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    /// The debug server configuration for `environment`, falling back to the
    /// project-wide block. A missing server configuration is fatal.
    pub fn server_config<'a>(
        &'a self,
        environment: &'a EnvironmentConfig,
    ) -> Result<&'a ServerConfig, Error> {
        environment.server.as_ref().or(self.server.as_ref()).ok_or_else(|| {
            Error::InvalidConfig(
                "no debug server configuration found - add a 'server' block to the environment \
                 or to the top level of bloom.yaml"
                    .to_owned(),
            )
        })
    }

    fn warn_unknown_keys(&self) {
        warn_keys("configuration", &self.unknown_keys);

        for (name, environment) in &self.environments {
            warn_keys(&format!("environment \"{name}\""), &environment.unknown_keys);
            warn_keys(&format!("environment \"{name}\" tool"), &environment.tool.unknown_keys);
            warn_keys(&format!("environment \"{name}\" target"), &environment.target.unknown_keys);
        }
    }
}

fn warn_keys(context: &str, keys: &BTreeMap<String, serde_yaml::Value>) {
    for key in keys.keys() {
        if let Some((_, replacement)) =
            RENAMED_KEYS.iter().find(|(renamed, _)| *renamed == key.as_str())
        {
            tracing::warn!(
                "The '{key}' key was renamed to '{replacement}' in v1.0.0. Please update your \
                 bloom.yaml configuration."
            );
            continue;
        }

        tracing::warn!("Unknown key '{key}' in {context} - the key will be ignored.");
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    const CONFIG: &str = r#"
environments:
  default:
    shutdown_post_debug_session: true
    tool:
      name: "atmel-ice"
    target:
      name: "atmega328p"
      physical_interface: "debug_wire"
      manage_dwen_fuse_bit: true
server:
  name: "avr-gdb-rsp"
  ipAddress: "127.0.0.1"
  port: 1442
"#;

    #[test]
    fn parses_a_complete_document() {
        let config = ProjectConfig::parse(CONFIG).unwrap();
        let environment = config.environment("default").unwrap();

        assert_eq!(environment.tool.name, "atmel-ice");
        assert_eq!(environment.target.name, "atmega328p");
        assert_eq!(environment.target.physical_interface, PhysicalInterface::DebugWire);
        assert!(environment.shutdown_post_debug_session);
        assert!(environment.target.manage_dwen_fuse_bit);
        assert_eq!(config.server_config(environment).unwrap().name, "avr-gdb-rsp");
    }

    #[test]
    fn flag_defaults() {
        let config = ProjectConfig::parse(CONFIG).unwrap();
        let target = &config.environment("default").unwrap().target;

        assert!(target.resume_on_startup);
        assert!(target.hardware_breakpoints);
        assert!(target.program_memory_cache);
        assert!(target.delta_programming);
        assert!(!target.reserve_stepping_breakpoint);
        assert!(!target.manage_ocden_fuse_bit);
        assert!(!target.cycle_target_power_post_dwen_update);
        assert!(target.preserve_eeprom);
    }

    #[test]
    fn missing_environments_is_fatal() {
        let error = ProjectConfig::parse("server:\n  name: \"avr-gdb-rsp\"\n").unwrap_err();
        assert!(matches!(error, Error::InvalidConfig(_)));
    }

    #[test]
    fn missing_tool_is_fatal() {
        let raw = r#"
environments:
  default:
    target:
      name: "atmega328p"
      physical_interface: "updi"
"#;
        assert!(matches!(ProjectConfig::parse(raw), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn missing_server_is_fatal() {
        let raw = r#"
environments:
  default:
    tool:
      name: "simulator"
    target:
      name: "atmega328p"
      physical_interface: "updi"
"#;
        let config = ProjectConfig::parse(raw).unwrap();
        let environment = config.environment("default").unwrap();
        assert!(matches!(config.server_config(environment), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn invalid_physical_interface_is_fatal() {
        let raw = r#"
environments:
  default:
    tool:
      name: "simulator"
    target:
      name: "atmega328p"
      physical_interface: "spi"
"#;
        assert!(matches!(ProjectConfig::parse(raw), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn unknown_environment_lookup_fails() {
        let config = ProjectConfig::parse(CONFIG).unwrap();
        assert!(matches!(config.environment("missing"), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let raw = r#"
environments:
  default:
    tool:
      name: "simulator"
    target:
      name: "atmega328p"
      physical_interface: "updi"
      typoed_flag: true
    mystery: 42
"#;
        // Unknown keys warn but never fail the parse.
        assert!(ProjectConfig::parse(raw).is_ok());
    }
}
