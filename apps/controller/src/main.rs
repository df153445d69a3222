use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use broker_integration::MqttConnector;
use clap::Parser;
use client_core::{Dispatcher, Session, SessionEvent};
use shared::domain::Direction;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod input;

use config::load_settings;
use input::{parse_input, ControlInput, InputError, HELP};

#[derive(Parser, Debug)]
#[command(about = "Drive a vehicle over MQTT from the terminal")]
struct Args {
    /// TOML settings file; defaults to ./controller.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Broker as mqtt://host:port; overrides --host/--port.
    #[arg(long)]
    broker_url: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    topic: Option<String>,
    #[arg(long)]
    connect_timeout_ms: Option<u64>,
    /// Used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(host) = args.host {
        settings.broker_host = host;
    }
    if let Some(port) = args.port {
        settings.broker_port = port;
    }
    if let Some(url) = args.broker_url.as_deref() {
        settings.set_broker_url(url)?;
    }
    if let Some(topic) = args.topic {
        settings.topic = topic;
    }
    if let Some(timeout) = args.connect_timeout_ms {
        settings.connect_timeout_ms = timeout;
    }

    let session = Session::new(Arc::new(MqttConnector::new()), settings.session_options());
    let event_task = tokio::spawn(report_session_events(session.subscribe_events()));
    let dispatcher = Dispatcher::new(Arc::clone(&session));

    let handle = session
        .start(settings.endpoint(), settings.topic.clone())
        .context("failed to start controller session")?;
    info!(
        client_id = %handle.client_id(),
        endpoint = %settings.endpoint(),
        topic = %settings.topic,
        "controller: started, type 'help' for commands"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut held: Option<Direction> = None;
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("controller: interrupted");
                break;
            }
            line = lines.next_line() => line.context("failed to read input")?,
        };
        let Some(line) = line else {
            break;
        };

        match parse_input(&line) {
            Ok(ControlInput::Press(direction)) => {
                held = Some(direction);
                dispatcher.on_press_start(direction);
            }
            Ok(ControlInput::Release(direction)) => {
                dispatcher.on_release(direction.or(held.take()));
            }
            Ok(ControlInput::Status) => {
                let stats = dispatcher.stats();
                println!(
                    "state={} sent={} dropped_not_connected={} failed={}",
                    session.state(),
                    stats.sent,
                    stats.dropped_not_connected,
                    stats.failed
                );
            }
            Ok(ControlInput::Reconnect) => {
                if let Err(err) = session.start(settings.endpoint(), settings.topic.clone()) {
                    warn!(error = %err, "controller: reconnect rejected");
                }
            }
            Ok(ControlInput::Help) => println!("{HELP}"),
            Ok(ControlInput::Quit) => break,
            Err(InputError::Empty) => {}
            Err(err) => warn!(error = %err, "controller: ignored input"),
        }
    }

    session.stop().await;
    event_task.abort();

    let stats = dispatcher.stats();
    info!(
        sent = stats.sent,
        dropped_not_connected = stats.dropped_not_connected,
        failed = stats.failed,
        "controller: stopped"
    );
    Ok(())
}

async fn report_session_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Connected { client_id, target }) => {
                println!("connected as {client_id} to {target}");
            }
            Ok(SessionEvent::Message(message)) => {
                println!("<- {} {}", message.topic, message.payload_text());
            }
            Ok(SessionEvent::Error(err)) => error!(error = %err, "controller: session error"),
            Ok(SessionEvent::Closed) => println!("disconnected"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "controller: session events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
