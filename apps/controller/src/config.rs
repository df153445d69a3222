use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use client_core::SessionOptions;
use serde::Deserialize;
use shared::domain::{Endpoint, DEFAULT_MQTT_PORT};
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "controller.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub broker_host: String,
    pub broker_port: u16,
    pub topic: String,
    pub connect_timeout_ms: u64,
    pub keep_alive_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker_host: "broker.emqx.io".into(),
            broker_port: DEFAULT_MQTT_PORT,
            topic: "/Sing/car".into(),
            connect_timeout_ms: 5_000,
            keep_alive_secs: 30,
        }
    }
}

impl Settings {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.broker_host.clone(), self.broker_port)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
        }
    }

    pub fn set_broker_url(&mut self, raw: &str) -> anyhow::Result<()> {
        let endpoint =
            Endpoint::parse(raw).with_context(|| format!("invalid broker url '{raw}'"))?;
        self.broker_host = endpoint.host;
        self.broker_port = endpoint.port;
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    broker_url: Option<String>,
    broker_host: Option<String>,
    broker_port: Option<u16>,
    topic: Option<String>,
    connect_timeout_ms: Option<u64>,
    keep_alive_secs: Option<u64>,
}

/// Defaults, then `controller.toml` (or the explicit `path`, which must
/// exist), then environment variables.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    match fs::read_to_string(&path) {
        Ok(raw) => apply_file(&mut settings, &raw)
            .with_context(|| format!("failed to load config file '{}'", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound && !explicit => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file '{}'", path.display()))
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok())?;
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw)?;

    if let Some(url) = file_cfg.broker_url {
        settings.set_broker_url(&url)?;
    }
    if let Some(host) = file_cfg.broker_host {
        settings.broker_host = host;
    }
    if let Some(port) = file_cfg.broker_port {
        settings.broker_port = port;
    }
    if let Some(topic) = file_cfg.topic {
        settings.topic = topic;
    }
    if let Some(timeout) = file_cfg.connect_timeout_ms {
        settings.connect_timeout_ms = timeout;
    }
    if let Some(keep_alive) = file_cfg.keep_alive_secs {
        settings.keep_alive_secs = keep_alive;
    }

    Ok(())
}

fn apply_env(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = lookup("CONTROLLER_BROKER_URL") {
        settings.set_broker_url(&v)?;
    }
    if let Some(v) = lookup("APP__BROKER_HOST") {
        settings.broker_host = v;
    }
    if let Some(v) = lookup("APP__BROKER_PORT") {
        match v.parse() {
            Ok(port) => settings.broker_port = port,
            Err(_) => warn!(value = %v, "config: ignoring invalid APP__BROKER_PORT"),
        }
    }
    if let Some(v) = lookup("APP__TOPIC") {
        settings.topic = v;
    }
    if let Some(v) = lookup("APP__CONNECT_TIMEOUT_MS") {
        match v.parse() {
            Ok(timeout) => settings.connect_timeout_ms = timeout,
            Err(_) => warn!(value = %v, "config: ignoring invalid APP__CONNECT_TIMEOUT_MS"),
        }
    }
    if let Some(v) = lookup("APP__KEEP_ALIVE_SECS") {
        match v.parse() {
            Ok(keep_alive) => settings.keep_alive_secs = keep_alive,
            Err(_) => warn!(value = %v, "config: ignoring invalid APP__KEEP_ALIVE_SECS"),
        }
    }

    Ok(())
}
