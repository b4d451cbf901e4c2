use crate::cache::SessionCache;
use crate::content::{ContentCatalog, ContentError};
use crate::device::{ConnectionSettings, Connector, DeviceError, TvConnection};
use crate::discovery::{Discover, DiscoveryError};
use crate::model::InboundMessage;
use crate::store::{ConfigStore, StoreError};
use crate::wake::WakeSignal;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const MAX_VOLUME: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("invalid params for {command}: {reason}")]
    InvalidParams {
        command: &'static str,
        reason: String,
    },
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    PowerOn,
    PowerOff,
    VolumeUp,
    VolumeDown,
    SetVolume(u8),
    Mute(bool),
    ChannelUp,
    ChannelDown,
    OpenChannel(String),
    OpenApp { title: String, params: Option<Value> },
    CloseApp(String),
    PlayMedia,
    StopMedia,
    PauseMedia,
    FastForwardMedia,
    RewindMedia,
    OpenYoutube(String),
    OpenNetflix(String),
    Reset,
}

impl Command {
    // Parses a command name and its positional arguments. Extra arguments are ignored.
    pub fn parse(name: &str, params: &[Value]) -> Result<Self, DispatchError> {
        let command = match name {
            "powerOn" => Self::PowerOn,
            "powerOff" => Self::PowerOff,
            "volumeUp" => Self::VolumeUp,
            "volumeDown" => Self::VolumeDown,
            "setVolume" => Self::SetVolume(volume_arg("setVolume", params.first())?),
            "mute" => Self::Mute(bool_arg("mute", params.first())?),
            "channelUp" => Self::ChannelUp,
            "channelDown" => Self::ChannelDown,
            "openChannel" => Self::OpenChannel(string_arg("openChannel", params.first())?),
            "openApp" => Self::OpenApp {
                title: string_arg("openApp", params.first())?,
                params: params.get(1).filter(|v| !v.is_null()).cloned(),
            },
            "closeApp" => Self::CloseApp(string_arg("closeApp", params.first())?),
            "playMedia" | "play" => Self::PlayMedia,
            "stopMedia" | "stop" => Self::StopMedia,
            "pauseMedia" | "pause" => Self::PauseMedia,
            "fastForwardMedia" | "fastForward" => Self::FastForwardMedia,
            "rewindMedia" | "rewind" => Self::RewindMedia,
            "openYoutube" => Self::OpenYoutube(string_arg("openYoutube", params.first())?),
            "openNetflix" => Self::OpenNetflix(string_arg("openNetflix", params.first())?),
            "reset" => Self::Reset,
            other => return Err(DispatchError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PowerOn => "powerOn",
            Self::PowerOff => "powerOff",
            Self::VolumeUp => "volumeUp",
            Self::VolumeDown => "volumeDown",
            Self::SetVolume(_) => "setVolume",
            Self::Mute(_) => "mute",
            Self::ChannelUp => "channelUp",
            Self::ChannelDown => "channelDown",
            Self::OpenChannel(_) => "openChannel",
            Self::OpenApp { .. } => "openApp",
            Self::CloseApp(_) => "closeApp",
            Self::PlayMedia => "playMedia",
            Self::StopMedia => "stopMedia",
            Self::PauseMedia => "pauseMedia",
            Self::FastForwardMedia => "fastForwardMedia",
            Self::RewindMedia => "rewindMedia",
            Self::OpenYoutube(_) => "openYoutube",
            Self::OpenNetflix(_) => "openNetflix",
            Self::Reset => "reset",
        }
    }
}

fn invalid(command: &'static str, reason: impl Into<String>) -> DispatchError {
    DispatchError::InvalidParams {
        command,
        reason: reason.into(),
    }
}

fn string_arg(command: &'static str, arg: Option<&Value>) -> Result<String, DispatchError> {
    match arg {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(invalid(command, "title must not be empty")),
        Some(other) => Err(invalid(command, format!("expected a string, got {other}"))),
        None => Err(invalid(command, "missing title")),
    }
}

fn bool_arg(command: &'static str, arg: Option<&Value>) -> Result<bool, DispatchError> {
    match arg {
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(invalid(command, format!("expected a boolean, got {other}"))),
        None => Err(invalid(command, "missing flag")),
    }
}

fn volume_arg(command: &'static str, arg: Option<&Value>) -> Result<u8, DispatchError> {
    let level = match arg {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        Some(_) => None,
        None => return Err(invalid(command, "missing level")),
    };
    match level {
        Some(level) if level <= MAX_VOLUME => Ok(level as u8),
        _ => Err(invalid(
            command,
            format!("level must be an integer in 0..={MAX_VOLUME}"),
        )),
    }
}

// Builds the connection for a session: the stored device if the user has one,
// otherwise a fresh discovery whose result is stored for next time.
pub struct Provisioner {
    session_name: String,
    store: Arc<dyn ConfigStore>,
    discovery: Arc<dyn Discover>,
    discovery_timeout: Duration,
    connector: Arc<dyn Connector>,
    wake: Arc<dyn WakeSignal>,
    settings: ConnectionSettings,
}

impl Provisioner {
    pub fn new(
        session_name: impl Into<String>,
        store: Arc<dyn ConfigStore>,
        discovery: Arc<dyn Discover>,
        discovery_timeout: Duration,
        connector: Arc<dyn Connector>,
        wake: Arc<dyn WakeSignal>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            session_name: session_name.into(),
            store,
            discovery,
            discovery_timeout,
            connector,
            wake,
            settings,
        }
    }

    pub async fn provision(&self, user_id: &str) -> Result<TvConnection, ProvisionError> {
        let mut config = self.store.load(user_id).await?;

        let device = match config.get(&self.session_name) {
            Some(device) => {
                tracing::info!(user_id, tv = %self.session_name, "using stored tv config");
                device.clone()
            }
            None => {
                tracing::info!(user_id, tv = %self.session_name, "discovering tv");
                let mut device = self.discovery.discover_device(self.discovery_timeout).await?;
                device.name = self.session_name.clone();
                config.insert(self.session_name.clone(), device.clone());
                self.store.save(user_id, &config).await?;
                tracing::info!(user_id, ip = %device.ip, "stored discovered tv");
                device
            }
        };

        Ok(TvConnection::new(
            user_id,
            device,
            self.connector.clone(),
            self.wake.clone(),
            self.settings,
        ))
    }
}

pub struct Dispatcher {
    cache: Arc<SessionCache<TvConnection>>,
    provisioner: Provisioner,
    store: Arc<dyn ConfigStore>,
    content: Arc<dyn ContentCatalog>,
}

impl Dispatcher {
    pub fn new(
        cache: Arc<SessionCache<TvConnection>>,
        provisioner: Provisioner,
        store: Arc<dyn ConfigStore>,
        content: Arc<dyn ContentCatalog>,
    ) -> Self {
        Self {
            cache,
            provisioner,
            store,
            content,
        }
    }

    // Handles one raw message. Never fails: errors are logged and the message is
    // considered handled.
    pub async fn handle_message(&self, raw: &str) {
        if let Err(err) = self.handle(raw).await {
            tracing::error!(error = %err, "failed to handle message");
        }
    }

    pub async fn handle(&self, raw: &str) -> Result<(), DispatchError> {
        let message: InboundMessage = serde_json::from_str(raw)?;
        self.dispatch(&message).await
    }

    pub async fn dispatch(&self, message: &InboundMessage) -> Result<(), DispatchError> {
        let user_id = message.user_id.as_str();
        tracing::info!(
            command = %message.command,
            params = ?message.params,
            user_id,
            "handling new command"
        );

        let command = Command::parse(&message.command, &message.params)?;
        tracing::debug!(user_id, command = command.name(), "resolved command");
        if command == Command::Reset {
            self.store.reset(user_id).await?;
            tracing::info!(user_id, "stored tv config reset");
            return Ok(());
        }

        let conn = self
            .cache
            .get_or_create(user_id, || self.provisioner.provision(user_id))
            .await?;

        let powering_off = command == Command::PowerOff;
        let res = self.execute(&conn, command).await;
        if powering_off {
            self.cache.remove(user_id);
        }
        res
    }

    pub async fn shutdown(&self) {
        if !self.cache.is_empty() {
            tracing::info!(connections = self.cache.len(), "closing cached connections");
        }
        self.cache.clear().await;
    }

    async fn execute(&self, conn: &TvConnection, command: Command) -> Result<(), DispatchError> {
        match command {
            Command::PowerOn => conn.power_on().await?,
            Command::PowerOff => conn.power_off().await?,
            Command::VolumeUp => conn.volume_up().await?,
            Command::VolumeDown => conn.volume_down().await?,
            Command::SetVolume(level) => conn.set_volume(level).await?,
            Command::Mute(muted) => conn.mute(muted).await?,
            Command::ChannelUp => conn.channel_up().await?,
            Command::ChannelDown => conn.channel_down().await?,
            Command::OpenChannel(title) => conn.open_channel(&title).await?,
            Command::OpenApp { title, params } => conn.open_app(&title, params).await?,
            Command::CloseApp(title) => conn.close_app(&title).await?,
            Command::PlayMedia => conn.play_media().await?,
            Command::StopMedia => conn.stop_media().await?,
            Command::PauseMedia => conn.pause_media().await?,
            Command::FastForwardMedia => conn.fast_forward_media().await?,
            Command::RewindMedia => conn.rewind_media().await?,
            Command::OpenYoutube(title) => {
                let target = self.content.youtube_target(&title).await?;
                conn.open_app("youtube", Some(json!({ "contentTarget": target })))
                    .await?
            }
            Command::OpenNetflix(title) => {
                let target = self.content.netflix_target(&title).await?;
                conn.open_app("netflix", Some(json!({ "contentTarget": target })))
                    .await?
            }
            // Handled before a connection is resolved.
            Command::Reset => {}
        }
        Ok(())
    }
}
