use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use bloom::config::{ProjectConfig, ProjectSettings};
use bloom::event::{EventKind, EventListener};
use bloom::signal_handler::SignalHandler;
use bloom::target_controller::{TargetController, TargetControllerState};
use bloom::{EventBus, EventPayload, TargetRegistry, ToolRegistry};

/// How long to wait for worker threads to wind down after shutdown.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

const CONFIG_TEMPLATE: &str = r#"environments:
  default:
    tool:
      name: "simulator"
    target:
      name: "atmega328p"
      physical_interface: "debug_wire"

server:
  name: "avr-gdb-rsp"
  ip_address: "127.0.0.1"
  port: 1442
"#;

#[derive(Parser)]
#[command(
    name = "bloom",
    version,
    about = "A debug server for AVR8 and WCH RISC-V microcontrollers"
)]
struct Cli {
    /// A reserved command ("help", "init", "version") or the name of the
    /// environment to launch.
    #[arg(default_value = "default")]
    command_or_environment: String,

    /// Path to the project configuration file.
    #[arg(long, default_value = "bloom.yaml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command_or_environment.as_str() {
        "help" => {
            Cli::command().print_help()?;
            Ok(())
        }
        "init" => init(&cli.config),
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        environment => launch(&cli.config, environment),
    }
}

/// Writes a starter configuration file into the working directory.
fn init(config_path: &PathBuf) -> anyhow::Result<()> {
    if config_path.exists() {
        bail!("\"{}\" already exists - refusing to overwrite it", config_path.display());
    }

    std::fs::write(config_path, CONFIG_TEMPLATE)
        .with_context(|| format!("failed to write \"{}\"", config_path.display()))?;

    println!("Created \"{}\"", config_path.display());
    Ok(())
}

fn launch(config_path: &PathBuf, environment_name: &str) -> anyhow::Result<()> {
    let raw_config = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read \"{}\"", config_path.display()))?;

    // The logger has to be up before the full config parse, so that parse
    // warnings are visible - but the debug_logging flag lives in the config.
    // Peek at just that key first.
    let debug_logging = serde_yaml::from_str::<serde_yaml::Value>(&raw_config)
        .ok()
        .and_then(|document| document.get("debug_logging")?.as_bool())
        .unwrap_or(false);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if debug_logging { "debug" } else { "info" })
        }))
        .init();

    let config = ProjectConfig::parse(&raw_config)?;

    tracing::info!("Selected environment: \"{environment_name}\"");

    let environment = config.environment(environment_name)?.clone();
    let server_config = config.server_config(&environment)?.clone();
    tracing::info!("Selected debug server: \"{}\"", server_config.name);

    // UI-state preferences live in a sidecar next to the config. Optional.
    let settings_path = ProjectSettings::path_for_config(config_path);
    let _settings = ProjectSettings::load(&settings_path);

    let bus = Arc::new(EventBus::new());

    let signal_handler = SignalHandler::new(bus.clone())?;
    let signals_handle = signal_handler.handle();
    let signal_thread = std::thread::Builder::new()
        .name("SH".to_owned())
        .spawn(move || signal_handler.run())?;

    let controller = TargetController::new(
        environment,
        bus.clone(),
        ToolRegistry::new(),
        TargetRegistry::new(),
    );

    // The application observes controller state transitions to know when
    // everything has wound down.
    let listener = EventListener::new("ApplicationEventListener");
    listener.subscribe(EventKind::TargetControllerStateChanged);
    bus.register(listener.clone());

    let controller_thread =
        std::thread::Builder::new().name("TC".to_owned()).spawn(move || controller.run())?;

    loop {
        let Some(event) = listener.wait_for(
            &[EventKind::TargetControllerStateChanged],
            Some(SHUTDOWN_JOIN_TIMEOUT),
            None,
        ) else {
            if controller_thread.is_finished() {
                break;
            }
            continue;
        };

        if let EventPayload::TargetControllerStateChanged(TargetControllerState::Stopped) =
            &event.payload
        {
            break;
        }
    }

    if controller_thread.join().is_err() {
        tracing::error!("The TargetController thread panicked");
    }

    signals_handle.close();
    if signal_thread.join().is_err() {
        tracing::error!("The signal handler thread panicked");
    }

    tracing::info!("Bloom shut down");
    Ok(())
}
