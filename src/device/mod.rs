use crate::cache::Teardown;
use crate::config::DeviceConfig;
use crate::deadline::race_with_timeout;
use crate::model::DeviceDescriptor;
use crate::wake::{WakeError, WakeSignal};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub const URI_TURN_OFF: &str = "ssap://system/turnOff";
pub const URI_VOLUME_UP: &str = "ssap://audio/volumeUp";
pub const URI_VOLUME_DOWN: &str = "ssap://audio/volumeDown";
pub const URI_SET_MUTE: &str = "ssap://audio/setMute";
pub const URI_SET_VOLUME: &str = "ssap://audio/setVolume";
pub const URI_CHANNEL_UP: &str = "ssap://tv/channelUp";
pub const URI_CHANNEL_DOWN: &str = "ssap://tv/channelDown";
pub const URI_CHANNEL_LIST: &str = "ssap://tv/getChannelList";
pub const URI_OPEN_CHANNEL: &str = "ssap://tv/openChannel";
pub const URI_LIST_APPS: &str = "ssap://com.webos.applicationManager/listApps";
pub const URI_LAUNCH_APP: &str = "ssap://system.launcher/launch";
pub const URI_CLOSE_APP: &str = "ssap://system.launcher/close";
pub const URI_MEDIA_PLAY: &str = "ssap://media.controls/play";
pub const URI_MEDIA_STOP: &str = "ssap://media.controls/stop";
pub const URI_MEDIA_PAUSE: &str = "ssap://media.controls/pause";
pub const URI_MEDIA_FAST_FORWARD: &str = "ssap://media.controls/fastForward";
pub const URI_MEDIA_REWIND: &str = "ssap://media.controls/rewind";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Error(String),
    Closed,
}

pub type LinkEvents = mpsc::UnboundedSender<LinkEvent>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport error: {0}")]
    Failed(String),
    #[error("connection closed")]
    Closed,
    #[error("not connected")]
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("device rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("connect timed out after {}ms", .0.as_millis())]
    ConnectTimeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("request {uri} failed: {source}")]
    Request {
        uri: String,
        #[source]
        source: RequestError,
    },
    #[error("no {kind} matching '{title}'")]
    NotFound { kind: &'static str, title: String },
    #[error("unexpected response to {uri}: {reason}")]
    InvalidResponse { uri: String, reason: String },
    #[error("wake failed: {0}")]
    Wake(#[from] WakeError),
}

#[async_trait]
pub trait Link: Send + Sync {
    async fn request(&self, uri: &str, payload: Option<Value>) -> Result<Value, RequestError>;
    fn close(&self);
}

// Opens links. `open` must return immediately; progress is reported on `events`.
pub trait Connector: Send + Sync {
    fn open(&self, session: &str, device: &DeviceDescriptor, events: LinkEvents) -> Arc<dyn Link>;
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub settle_delay: Duration,
}

impl From<&DeviceConfig> for ConnectionSettings {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            settle_delay: config.settle_delay(),
        }
    }
}

type Waiter = oneshot::Sender<Result<(), TransportError>>;

struct Shared {
    state: ConnectionState,
    link: Option<Arc<dyn Link>>,
    waiters: Vec<Waiter>,
    generation: u64,
}

impl Shared {
    fn settle(&mut self, outcome: Result<(), TransportError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn tear_down(&mut self, err: TransportError) {
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.settle(Err(err));
    }

    // Returns false when the event belongs to a link that is no longer current.
    fn apply(&mut self, generation: u64, event: LinkEvent) -> bool {
        if generation != self.generation {
            return false;
        }
        match event {
            LinkEvent::Connected => {
                self.state = ConnectionState::Connected;
                self.settle(Ok(()));
            }
            LinkEvent::Error(msg) => self.tear_down(TransportError::Failed(msg)),
            LinkEvent::Closed => self.tear_down(TransportError::Closed),
        }
        true
    }
}

pub struct TvConnection {
    session: String,
    device: DeviceDescriptor,
    connector: Arc<dyn Connector>,
    wake: Arc<dyn WakeSignal>,
    settings: ConnectionSettings,
    shared: Arc<Mutex<Shared>>,
}

impl TvConnection {
    pub fn new(
        session: impl Into<String>,
        device: DeviceDescriptor,
        connector: Arc<dyn Connector>,
        wake: Arc<dyn WakeSignal>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            session: session.into(),
            device,
            connector,
            wake,
            settings,
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                link: None,
                waiters: Vec::new(),
                generation: 0,
            })),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub async fn connect(&self) -> Result<(), DeviceError> {
        self.connect_within(self.settings.connect_timeout).await
    }

    // Joins the in-flight attempt if there is one; otherwise opens a new link.
    pub async fn connect_within(&self, timeout: Duration) -> Result<(), DeviceError> {
        let waiter = {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Connected {
                return Ok(());
            }

            // Callers that already timed out leave closed senders behind.
            shared.waiters.retain(|w| !w.is_closed());
            let (tx, rx) = oneshot::channel();
            shared.waiters.push(tx);

            if shared.state == ConnectionState::Disconnected {
                tracing::debug!(ip = %self.device.ip, "opening tv connection");
                shared.state = ConnectionState::Connecting;
                shared.generation += 1;
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                shared.link = Some(self.connector.open(&self.session, &self.device, events_tx));
                spawn_event_pump(
                    Arc::downgrade(&self.shared),
                    shared.generation,
                    events_rx,
                    self.device.ip.clone(),
                );
            }
            rx
        };

        match race_with_timeout(waiter, timeout).await {
            Ok(Ok(outcome)) => outcome.map_err(DeviceError::from),
            Ok(Err(_)) => Err(TransportError::Closed.into()),
            Err(elapsed) => Err(DeviceError::ConnectTimeout(elapsed.after)),
        }
    }

    pub async fn request(&self, uri: &str, payload: Option<Value>) -> Result<Value, DeviceError> {
        self.connect().await?;
        let link = self
            .shared
            .lock()
            .link
            .clone()
            .ok_or(TransportError::NotConnected)?;

        tracing::debug!(ip = %self.device.ip, uri, "tv request");
        link.request(uri, payload)
            .await
            .map_err(|source| DeviceError::Request {
                uri: uri.to_string(),
                source,
            })
    }

    // Always ends Disconnected. Waits out the settle delay before returning so an
    // immediate reconnect does not race the device tearing down the old session.
    pub async fn disconnect(&self) {
        tracing::info!(ip = %self.device.ip, state = ?self.state(), "disconnect tv");
        self.shared.lock().tear_down(TransportError::Closed);
        tokio::time::sleep(self.settings.settle_delay).await;
    }

    pub async fn power_on(&self) -> Result<(), DeviceError> {
        tracing::info!(mac = %self.device.mac, "powering on tv");
        self.wake.wake(&self.device.mac).await?;
        Ok(())
    }

    pub async fn power_off(&self) -> Result<(), DeviceError> {
        tracing::info!("powering off tv");
        let res = self.request(URI_TURN_OFF, None).await;
        self.disconnect().await;
        res.map(|_| ())
    }

    pub async fn volume_up(&self) -> Result<(), DeviceError> {
        tracing::info!("volume up");
        self.request(URI_VOLUME_UP, None).await.map(|_| ())
    }

    pub async fn volume_down(&self) -> Result<(), DeviceError> {
        tracing::info!("volume down");
        self.request(URI_VOLUME_DOWN, None).await.map(|_| ())
    }

    pub async fn set_volume(&self, volume: u8) -> Result<(), DeviceError> {
        tracing::info!(volume, "set tv volume");
        self.request(URI_SET_VOLUME, Some(json!({ "volume": volume })))
            .await
            .map(|_| ())
    }

    pub async fn mute(&self, muted: bool) -> Result<(), DeviceError> {
        tracing::info!(muted, "set tv mute");
        self.request(URI_SET_MUTE, Some(json!({ "mute": muted })))
            .await
            .map(|_| ())
    }

    pub async fn channel_up(&self) -> Result<(), DeviceError> {
        tracing::info!("channel up");
        self.request(URI_CHANNEL_UP, None).await.map(|_| ())
    }

    pub async fn channel_down(&self) -> Result<(), DeviceError> {
        tracing::info!("channel down");
        self.request(URI_CHANNEL_DOWN, None).await.map(|_| ())
    }

    pub async fn open_channel(&self, title: &str) -> Result<(), DeviceError> {
        tracing::info!(title, "open channel");
        let list: ChannelList = self.fetch(URI_CHANNEL_LIST).await?;
        let channel = find_by_title(&list.channels, title).ok_or_else(|| DeviceError::NotFound {
            kind: "channel",
            title: title.to_string(),
        })?;
        self.request(URI_OPEN_CHANNEL, Some(json!({ "channelId": channel.id })))
            .await
            .map(|_| ())
    }

    pub async fn open_app(&self, title: &str, params: Option<Value>) -> Result<(), DeviceError> {
        tracing::info!(title, ?params, "open app");
        let app = self.find_app(title).await?;
        let mut payload = json!({ "id": app.id });
        if let Some(params) = params {
            payload["params"] = params;
        }
        self.request(URI_LAUNCH_APP, Some(payload)).await.map(|_| ())
    }

    pub async fn close_app(&self, title: &str) -> Result<(), DeviceError> {
        tracing::info!(title, "close app");
        let app = self.find_app(title).await?;
        self.request(URI_CLOSE_APP, Some(json!({ "id": app.id })))
            .await
            .map(|_| ())
    }

    pub async fn play_media(&self) -> Result<(), DeviceError> {
        tracing::info!("play media");
        self.request(URI_MEDIA_PLAY, None).await.map(|_| ())
    }

    pub async fn stop_media(&self) -> Result<(), DeviceError> {
        tracing::info!("stop media");
        self.request(URI_MEDIA_STOP, None).await.map(|_| ())
    }

    pub async fn pause_media(&self) -> Result<(), DeviceError> {
        tracing::info!("pause media");
        self.request(URI_MEDIA_PAUSE, None).await.map(|_| ())
    }

    pub async fn fast_forward_media(&self) -> Result<(), DeviceError> {
        tracing::info!("fast forward media");
        self.request(URI_MEDIA_FAST_FORWARD, None).await.map(|_| ())
    }

    pub async fn rewind_media(&self) -> Result<(), DeviceError> {
        tracing::info!("rewind media");
        self.request(URI_MEDIA_REWIND, None).await.map(|_| ())
    }

    async fn find_app(&self, title: &str) -> Result<ListEntry, DeviceError> {
        let list: AppList = self.fetch(URI_LIST_APPS).await?;
        find_by_title(&list.apps, title)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound {
                kind: "app",
                title: title.to_string(),
            })
    }

    async fn fetch<T: for<'de> Deserialize<'de>>(&self, uri: &str) -> Result<T, DeviceError> {
        let value = self.request(uri, None).await?;
        serde_json::from_value(value).map_err(|err| DeviceError::InvalidResponse {
            uri: uri.to_string(),
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl Teardown for TvConnection {
    async fn teardown(&self) {
        self.disconnect().await;
    }
}

fn spawn_event_pump(
    shared: Weak<Mutex<Shared>>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ip: String,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let logged = event.clone();
            if !shared.lock().apply(generation, event) {
                tracing::debug!(%ip, event = ?logged, "ignoring event from stale tv link");
                continue;
            }
            match logged {
                LinkEvent::Connected => tracing::info!(%ip, "tv connected"),
                LinkEvent::Error(err) => tracing::error!(%ip, error = %err, "tv connection error"),
                LinkEvent::Closed => tracing::warn!(%ip, "tv closed connection"),
            }
        }

        // The link dropped its sender without a terminal event.
        if let Some(shared) = shared.upgrade() {
            shared.lock().apply(generation, LinkEvent::Closed);
        }
    });
}

#[derive(Debug, Clone, Deserialize)]
struct ListEntry {
    #[serde(alias = "channelId")]
    id: Value,
    #[serde(alias = "channelName", default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct ChannelList {
    #[serde(alias = "channelList")]
    channels: Vec<ListEntry>,
}

#[derive(Debug, Deserialize)]
struct AppList {
    apps: Vec<ListEntry>,
}

// First entry, in list order, whose title contains `needle` ignoring case.
fn find_by_title<'a>(entries: &'a [ListEntry], needle: &str) -> Option<&'a ListEntry> {
    let needle = needle.to_lowercase();
    entries
        .iter()
        .find(|entry| entry.title.to_lowercase().contains(&needle))
}
