//! IoT device console.
//!
//! Usage:
//!   iot-console --device d1 --username u --password p watch
//!   iot-console --device d1 send dimmer --level 40
//!   iot-console commands
//!   iot-console --device d1 --mock panel

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use iot_device_console::command::{CommandDispatcher, DeviceCommand, HttpCommandBackend};
use iot_device_console::config::{self, Config};
use iot_device_console::error::{ConsoleError, Result};
use iot_device_console::panel::{Confirm, ControlPanel, PanelEvent};
use iot_device_console::telemetry::{Credentials, MqttWsTransport, SubscriptionManager};
use log::{error, info, warn};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Parser)]
#[command(name = "iot-console")]
#[command(about = "Live telemetry and commands for a single IoT device")]
struct Cli {
    /// Device to follow and command
    #[arg(long, short, env = "DEVICE_ID", default_value = "")]
    device: String,

    /// MQTT username issued for the device
    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    /// MQTT password issued for the device
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Broker host issued with the credentials (overrides MQTT_BROKER_HOST)
    #[arg(long, env = "DEVICE_BROKER_HOST")]
    broker_host: Option<String>,

    /// Use synthetic readings instead of the broker
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream live readings until Ctrl+C
    Watch,
    /// Send one command to the device
    Send {
        /// Wire name, e.g. led_on, relay1_off, dimmer, restart
        command: String,

        /// Dimmer level (sent as {"level": n})
        #[arg(long)]
        level: Option<i64>,

        /// Raw JSON params
        #[arg(long, conflicts_with = "level")]
        params: Option<String>,
    },
    /// List commands the backend advertises
    Commands,
    /// Interactive control panel on stdin
    Panel,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    config::load_dotenv();
    init_logger();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    config.mock.enabled |= cli.mock;

    if let Err(e) = run(cli, config).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    match &cli.command {
        Commands::Watch => watch(&cli, config).await,
        Commands::Send {
            command,
            level,
            params,
        } => {
            let params = match (level, params) {
                (Some(level), _) => Some(json!({ "level": level })),
                (None, Some(raw)) => Some(serde_json::from_str::<Value>(raw)?),
                (None, None) => None,
            };
            send(&cli, &config, DeviceCommand::from_wire(command, params)).await
        }
        Commands::Commands => list_commands(&config).await,
        Commands::Panel => panel(&cli, config).await,
    }
}

fn credentials(cli: &Cli) -> Option<Credentials> {
    let (username, password) = (cli.username.as_ref()?, cli.password.as_ref()?);
    let credentials = Credentials::new(username, password);
    Some(match &cli.broker_host {
        Some(host) => credentials.with_broker_host(host),
        None => credentials,
    })
}

fn dispatcher(config: &Config) -> Result<Arc<CommandDispatcher>> {
    let backend = HttpCommandBackend::new(&config.backend)?;
    Ok(Arc::new(CommandDispatcher::new(Arc::new(backend))))
}

fn manager(config: Config) -> Arc<SubscriptionManager> {
    Arc::new(SubscriptionManager::new(
        Arc::new(MqttWsTransport::new()),
        config.mqtt,
        config.mock,
    ))
}

async fn watch(cli: &Cli, config: Config) -> Result<()> {
    let manager = manager(config);
    let mut status = manager.watch_status();
    let mut readings = manager.watch_readings();

    manager.connect(&cli.device, credentials(cli)).await;
    info!("Watching {}. Press Ctrl+C to exit.", cli.device);

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match current.error {
                    Some(e) => warn!("Connection {}: {}", current.state, e),
                    None => info!("Connection {}", current.state),
                }
            }
            changed = readings.changed() => {
                if changed.is_err() {
                    break;
                }
                let reading = readings.borrow_and_update().clone();
                if let Some(reading) = reading {
                    println!("{}", serde_json::to_string(&reading)?);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    manager.disconnect().await;
    Ok(())
}

async fn send(cli: &Cli, config: &Config, command: DeviceCommand) -> Result<()> {
    if cli.device.trim().is_empty() {
        return Err(ConsoleError::MissingDeviceId);
    }

    let dispatcher = dispatcher(config)?;
    match dispatcher.execute(&cli.device, command).await {
        Some(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        None => {
            let message = dispatcher
                .state()
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "Command failed".to_string());
            Err(ConsoleError::Backend(message))
        }
    }
}

async fn list_commands(config: &Config) -> Result<()> {
    let commands = dispatcher(config)?.get_available_commands().await;
    if commands.is_empty() {
        warn!("Backend advertised no commands");
    }
    for command in commands {
        match command.description {
            Some(description) => println!("{:<16} {}", command.name, description),
            None => println!("{}", command.name),
        }
    }
    Ok(())
}

type StdinLines = Arc<AsyncMutex<Lines<BufReader<Stdin>>>>;

/// y/N prompt reading from the same stdin as the panel loop.
struct StdinConfirm {
    lines: StdinLines,
}

#[async_trait]
impl Confirm for StdinConfirm {
    async fn confirm(&self, prompt: &str) -> bool {
        let mut stdout = tokio::io::stdout();
        let _ = stdout.write_all(format!("{} [y/N] ", prompt).as_bytes()).await;
        let _ = stdout.flush().await;

        match self.lines.lock().await.next_line().await {
            Ok(Some(answer)) => matches!(answer.trim(), "y" | "Y" | "yes"),
            _ => false,
        }
    }
}

const PANEL_HELP: &str = "\
Commands:
  on | off | toggle          LED
  relay1|relay2|both on|off  relays
  dimmer <0-100>             dimmer level
  read | status              read sensors / device status
  restart                    restart the device (asks first)
  send <name> [json]         any other command
  view                       show the panel
  help | quit";

async fn panel(cli: &Cli, config: Config) -> Result<()> {
    if cli.device.trim().is_empty() && !config.mock.enabled {
        return Err(ConsoleError::MissingDeviceId);
    }

    let dispatcher = dispatcher(&config)?;
    let manager = manager(config);
    manager.connect(&cli.device, credentials(cli)).await;

    let lines: StdinLines = Arc::new(AsyncMutex::new(BufReader::new(tokio::io::stdin()).lines()));
    let panel = ControlPanel::new(
        cli.device.trim(),
        dispatcher,
        manager.clone(),
        Arc::new(StdinConfirm {
            lines: lines.clone(),
        }),
    );

    let mut events = panel.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PanelEvent::Success(message) => println!("ok: {}", message),
                PanelEvent::Error(message) => println!("error: {}", message),
            }
        }
    });

    println!("{}", PANEL_HELP);
    loop {
        let line = tokio::select! {
            line = async { lines.lock().await.next_line().await } => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let mut words = line.split_whitespace();
        let Some(action) = words.next() else { continue };
        let arg = words.next();

        match (action, arg) {
            ("on", None) => {
                panel.led_on().await;
            }
            ("off", None) => {
                panel.led_off().await;
            }
            ("toggle", None) => {
                panel.led_toggle().await;
            }
            ("relay1", Some(state)) => {
                panel.relay1(state == "on").await;
            }
            ("relay2", Some(state)) => {
                panel.relay2(state == "on").await;
            }
            ("both", Some(state)) => {
                panel.relay_both(state == "on").await;
            }
            ("dimmer", Some(level)) => match level.parse::<i64>() {
                Ok(level) => {
                    panel.dimmer(level).await;
                }
                Err(_) => println!("error: dimmer level must be a number"),
            },
            ("read", None) => {
                panel.read_sensors().await;
            }
            ("status", None) => {
                panel.get_status().await;
            }
            ("restart", None) => {
                panel.restart().await;
            }
            ("send", Some(name)) => {
                let rest = line.splitn(3, char::is_whitespace).nth(2).map(str::trim);
                match rest.filter(|r| !r.is_empty()).map(serde_json::from_str::<Value>) {
                    Some(Err(e)) => println!("error: invalid params: {}", e),
                    Some(Ok(params)) => {
                        panel.custom(name, Some(params)).await;
                    }
                    None => {
                        panel.custom(name, None).await;
                    }
                }
            }
            ("view", None) => print!("{}", panel.view()),
            ("help", _) => println!("{}", PANEL_HELP),
            ("quit" | "exit", _) => break,
            _ => println!("unknown command, type help"),
        }
    }

    drop(panel);
    printer.abort();
    manager.disconnect().await;
    Ok(())
}
