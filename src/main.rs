use std::path::PathBuf;

use anyhow::{Context, Result};
use ble_robot_bridge_lib::commands::{self, CommandError};
use ble_robot_bridge_lib::core::bluetooth::Direction;
use ble_robot_bridge_lib::{AppState, BridgeConfig, BridgeEvent, logging};
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const CONFIG_DIR_ENV: &str = "ROBOT_BRIDGE_CONFIG_DIR";

const HELP: &str = "\
commands:
  scan              scan for robots
  list              list discovered robots
  connect <n|id>    connect to a robot by list index or id
  disconnect        drop the current connection
  w a s d x         move forward, left, stop, right, back
  send <token>      send a command, e.g. fwd-500
  url <url>         handle a web bridge navigation
  run <file>        run a script file
  abort             abort the running script
  status            show connection and script state
  log               show recent status lines
  quit              exit";

fn config_dir() -> PathBuf {
    std::env::var_os(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Prints notifications as they arrive.
fn spawn_printer(state: &AppState) {
    let mut rx = state.events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(BridgeEvent::Status(message)) => println!("* {}", message),
                Ok(BridgeEvent::DeviceDiscovered(device)) => {
                    println!("+ {} ({})", device.display_name(), device.id)
                }
                Ok(BridgeEvent::ScanCompleted) => println!("* scan finished, type 'list'"),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn print_send_result<E: std::fmt::Display>(result: Result<(), E>) {
    if let Err(e) = result {
        println!("! {}", e);
    }
}

/// Runs one console line. Returns `false` when the user asked to quit.
async fn dispatch(line: &str, state: &AppState) -> Result<bool> {
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    match verb {
        "" => {}
        "help" | "?" => println!("{}", HELP),
        "quit" | "exit" => return Ok(false),
        "scan" => print_send_result(commands::start_scan(state).await),
        "list" => {
            let devices = commands::list_devices(state);
            if devices.is_empty() {
                println!("no robots found yet");
            }
            for (index, device) in devices.iter().enumerate() {
                println!("{:>2}. {} ({})", index + 1, device.display_name(), device.id);
            }
        }
        "connect" => {
            let devices = commands::list_devices(state);
            let id = match rest.parse::<usize>() {
                Ok(n) if n >= 1 && n <= devices.len() => devices[n - 1].id.to_string(),
                _ => rest.to_string(),
            };
            if id.is_empty() {
                println!("usage: connect <n|id>");
            } else {
                print_send_result(commands::connect_to_device(&id, state).await);
            }
        }
        "disconnect" => commands::disconnect(state).await,
        "send" => print_send_result(commands::send_text(rest, state).await),
        "url" => match commands::handle_bridge_url(rest, state).await {
            Some(result) => print_send_result(result),
            None => println!("not a bridge url, it would load normally"),
        },
        "run" => {
            let source = tokio::fs::read_to_string(rest)
                .await
                .with_context(|| format!("reading script {}", rest))?;
            match commands::run_script(&source, state).await {
                Ok(run_id) => println!("script run {} started", run_id),
                Err(e) => println!("! {}", e),
            }
        }
        "abort" => print_send_result(commands::abort_script(state).await),
        "status" => {
            let connection = &state.connection;
            match connection.connected_device() {
                Some(device) => println!("{:?}: {}", connection.phase(), device.display_name()),
                None => println!("{:?}", connection.phase()),
            }
            println!(
                "script: {:?} ({}), last outcome: {:?}",
                state.runner.status(),
                state.runner.engine_name(),
                state.runner.last_outcome()
            );
        }
        "log" => {
            for entry in state.status_log.recent() {
                println!("{} {}", entry.timestamp, entry.message);
            }
        }
        other => {
            let mut chars = other.chars();
            match (chars.next().and_then(Direction::from_char), chars.next()) {
                (Some(direction), None) => {
                    print_send_result(commands::press_direction(direction, state).await)
                }
                _ => print_send_result::<CommandError>(commands::send_text(line, state).await),
            }
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let dir = config_dir();
    let config = BridgeConfig::load_config(&dir).await?;
    if logging::init_logging(&config.log.level).is_err() {
        eprintln!("Logger was already initialised");
    }

    info!("Starting robot bridge with config from {:?}", dir);
    let state = AppState::new(config).await?;
    spawn_printer(&state);
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match dispatch(line.trim(), &state).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                warn!("{:#}", e);
                println!("! {:#}", e);
            }
        }
    }

    state.shutdown().await;
    Ok(())
}
