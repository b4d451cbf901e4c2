use crate::device::{Connector, Link, LinkEvent, LinkEvents, RequestError, TransportError};
use crate::model::DeviceDescriptor;
use crate::store::ConfigStore;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

const REGISTER_ID: &str = "register_0";
const CLIENT_KEY_FIELD: &str = "client-key";

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, RequestError>>>>>;

pub struct WebOsConnector {
    port: u16,
    store: Arc<dyn ConfigStore>,
}

impl WebOsConnector {
    pub fn new(port: u16, store: Arc<dyn ConfigStore>) -> Self {
        Self { port, store }
    }
}

impl Connector for WebOsConnector {
    fn open(&self, session: &str, device: &DeviceDescriptor, events: LinkEvents) -> Arc<dyn Link> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(Notify::new());

        let task = Session {
            url: format!("ws://{}:{}", device.ip, self.port),
            user_id: session.to_string(),
            uuid: device.uuid.clone(),
            store: self.store.clone(),
            pending: pending.clone(),
            events,
        };
        tokio::spawn(task.run(outbound_rx, shutdown.clone()));

        Arc::new(WebOsLink {
            outbound: outbound_tx,
            pending,
            shutdown,
        })
    }
}

struct WebOsLink {
    outbound: mpsc::UnboundedSender<String>,
    pending: Pending,
    shutdown: Arc<Notify>,
}

#[async_trait]
impl Link for WebOsLink {
    async fn request(&self, uri: &str, payload: Option<Value>) -> Result<Value, RequestError> {
        let id = Uuid::new_v4().to_string();
        let mut frame = json!({ "id": id, "type": "request", "uri": uri });
        if let Some(payload) = payload {
            frame["payload"] = payload;
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        if self.outbound.send(frame.to_string()).is_err() {
            self.pending.lock().remove(&id);
            return Err(TransportError::Closed.into());
        }

        rx.await
            .unwrap_or_else(|_| Err(TransportError::Closed.into()))
    }

    fn close(&self) {
        self.shutdown.notify_one();
    }
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    error: Option<String>,
}

struct Session {
    url: String,
    user_id: String,
    uuid: String,
    store: Arc<dyn ConfigStore>,
    pending: Pending,
    events: LinkEvents,
}

impl Session {
    async fn run(self, mut outbound: mpsc::UnboundedReceiver<String>, shutdown: Arc<Notify>) {
        let outcome = self.drive(&mut outbound, &shutdown).await;

        // No new request can be queued past this point; fail the ones still waiting.
        outbound.close();
        for (_, waiter) in self.pending.lock().drain() {
            let _ = waiter.send(Err(TransportError::Closed.into()));
        }

        let event = match outcome {
            Ok(()) => LinkEvent::Closed,
            Err(err) => {
                tracing::debug!(url = %self.url, error = %err, "tv session ended");
                LinkEvent::Error(err)
            }
        };
        let _ = self.events.send(event);
    }

    async fn drive(
        &self,
        outbound: &mut mpsc::UnboundedReceiver<String>,
        shutdown: &Notify,
    ) -> Result<(), String> {
        let (ws, _) = tokio::select! {
            res = tokio_tungstenite::connect_async(self.url.as_str()) => res.map_err(|e| e.to_string())?,
            _ = shutdown.notified() => return Ok(()),
        };
        let (mut sink, mut stream) = ws.split();

        let client_key = match self.store.client_key(&self.user_id, &self.uuid).await {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(user_id = %self.user_id, error = %err, "could not read client key");
                None
            }
        };
        sink.send(Message::Text(register_frame(client_key.as_deref()).to_string()))
            .await
            .map_err(|e| e.to_string())?;

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                queued = outbound.recv() => match queued {
                    Some(text) => sink.send(Message::Text(text)).await.map_err(|e| e.to_string())?,
                    None => return Ok(()),
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text).await?,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.to_string()),
                },
            }
        }
    }

    async fn handle_frame(&self, text: &str) -> Result<(), String> {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring unparsable tv frame");
                return Ok(());
            }
        };
        let is_register = frame.id.as_deref() == Some(REGISTER_ID);

        match frame.kind.as_str() {
            "registered" => {
                if let Some(key) = frame.payload.get(CLIENT_KEY_FIELD).and_then(Value::as_str) {
                    if let Err(err) = self
                        .store
                        .save_client_key(&self.user_id, &self.uuid, key)
                        .await
                    {
                        tracing::warn!(user_id = %self.user_id, error = %err, "could not save client key");
                    }
                }
                let _ = self.events.send(LinkEvent::Connected);
            }
            "response" if is_register => {
                if frame.payload.get("pairingType").and_then(Value::as_str) == Some("PROMPT") {
                    tracing::info!(url = %self.url, "accept the pairing prompt on the tv");
                }
            }
            "error" if is_register => {
                return Err(frame
                    .error
                    .unwrap_or_else(|| "registration rejected".to_string()));
            }
            "response" => {
                let outcome = match frame.payload.get("returnValue") {
                    Some(Value::Bool(false)) => Err(RequestError::Rejected(
                        frame
                            .payload
                            .get("errorText")
                            .and_then(Value::as_str)
                            .unwrap_or("request failed")
                            .to_string(),
                    )),
                    _ => Ok(frame.payload),
                };
                self.resolve(frame.id, outcome);
            }
            "error" => {
                let reason = frame.error.unwrap_or_else(|| "unknown error".to_string());
                self.resolve(frame.id, Err(RequestError::Rejected(reason)));
            }
            other => tracing::debug!(kind = other, "unhandled tv frame"),
        }
        Ok(())
    }

    fn resolve(&self, id: Option<String>, outcome: Result<Value, RequestError>) {
        let waiter = id.and_then(|id| self.pending.lock().remove(&id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => tracing::debug!("tv reply without a pending request"),
        }
    }
}

fn register_frame(client_key: Option<&str>) -> Value {
    let mut payload = json!({
        "forcePairing": false,
        "pairingType": "PROMPT",
        "manifest": {
            "manifestVersion": 1,
            "appVersion": "1.1",
            "permissions": [
                "LAUNCH",
                "CONTROL_AUDIO",
                "CONTROL_POWER",
                "CONTROL_DISPLAY",
                "CONTROL_INPUT_MEDIA_PLAYBACK",
                "CONTROL_INPUT_TV",
                "READ_INSTALLED_APPS",
                "READ_RUNNING_APPS",
                "READ_TV_CHANNEL_LIST",
                "READ_CURRENT_CHANNEL",
                "WRITE_NOTIFICATION_TOAST",
            ],
        },
    });
    if let Some(key) = client_key {
        payload[CLIENT_KEY_FIELD] = json!(key);
    }
    json!({ "type": "register", "id": REGISTER_ID, "payload": payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use std::future::Future;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::WebSocketStream;

    type TvSocket = WebSocketStream<TcpStream>;

    async fn fake_tv<F, Fut>(handler: F) -> u16
    where
        F: FnOnce(TvSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            handler(ws).await;
        });
        port
    }

    async fn next_json(ws: &mut TvSocket) -> Option<Value> {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                return Some(serde_json::from_str(&text).unwrap());
            }
        }
        None
    }

    async fn send_json(ws: &mut TvSocket, value: Value) {
        ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    async fn register(ws: &mut TvSocket, key: &str) -> Value {
        let frame = next_json(ws).await.unwrap();
        send_json(
            ws,
            json!({ "type": "registered", "id": REGISTER_ID, "payload": { "client-key": key } }),
        )
        .await;
        frame
    }

    fn device() -> DeviceDescriptor {
        DeviceDescriptor {
            name: "TV".to_string(),
            ip: "127.0.0.1".to_string(),
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            uuid: "tv-uuid".to_string(),
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn registers_with_stored_key_and_saves_the_new_one() {
        let store = Arc::new(MemoryStore::default());
        store.save_client_key("u1", "tv-uuid", "old-key").await.unwrap();

        let (seen_tx, seen_rx) = oneshot::channel();
        let port = fake_tv(|mut ws| async move {
            let frame = register(&mut ws, "new-key").await;
            let _ = seen_tx.send(frame);
            while next_json(&mut ws).await.is_some() {}
        })
        .await;

        let connector = WebOsConnector::new(port, store.clone());
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let link = connector.open("u1", &device(), events_tx);

        assert_eq!(next_event(&mut events).await, LinkEvent::Connected);
        let frame = seen_rx.await.unwrap();
        assert_eq!(frame["type"], "register");
        assert_eq!(frame["id"], REGISTER_ID);
        assert_eq!(frame["payload"]["client-key"], "old-key");
        assert_eq!(store.key_for("u1", "tv-uuid").as_deref(), Some("new-key"));

        link.close();
        assert_eq!(next_event(&mut events).await, LinkEvent::Closed);
    }

    #[tokio::test]
    async fn first_registration_sends_no_key() {
        let (seen_tx, seen_rx) = oneshot::channel();
        let port = fake_tv(|mut ws| async move {
            let frame = register(&mut ws, "k").await;
            let _ = seen_tx.send(frame);
        })
        .await;

        let connector = WebOsConnector::new(port, Arc::new(MemoryStore::default()));
        let (events_tx, _events) = mpsc::unbounded_channel();
        let _link = connector.open("u1", &device(), events_tx);

        let frame = seen_rx.await.unwrap();
        assert!(frame["payload"].get("client-key").is_none());
        assert_eq!(frame["payload"]["pairingType"], "PROMPT");
    }

    #[tokio::test]
    async fn requests_are_correlated_by_id() {
        let port = fake_tv(|mut ws| async move {
            register(&mut ws, "k").await;
            let first = next_json(&mut ws).await.unwrap();
            let second = next_json(&mut ws).await.unwrap();
            // Answer out of order.
            send_json(
                &mut ws,
                json!({ "type": "response", "id": second["id"], "payload": { "uri": second["uri"] } }),
            )
            .await;
            send_json(
                &mut ws,
                json!({ "type": "response", "id": first["id"], "payload": { "echo": first["payload"] } }),
            )
            .await;
            while next_json(&mut ws).await.is_some() {}
        })
        .await;

        let connector = WebOsConnector::new(port, Arc::new(MemoryStore::default()));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let link = connector.open("u1", &device(), events_tx);
        assert_eq!(next_event(&mut events).await, LinkEvent::Connected);

        let (a, b) = tokio::join!(
            link.request("ssap://audio/setVolume", Some(json!({ "volume": 12 }))),
            async {
                tokio::task::yield_now().await;
                link.request("ssap://audio/volumeUp", None).await
            }
        );
        assert_eq!(a.unwrap(), json!({ "echo": { "volume": 12 } }));
        assert_eq!(b.unwrap(), json!({ "uri": "ssap://audio/volumeUp" }));
        link.close();
    }

    #[tokio::test]
    async fn error_replies_reject_the_request() {
        let port = fake_tv(|mut ws| async move {
            register(&mut ws, "k").await;
            let req = next_json(&mut ws).await.unwrap();
            send_json(
                &mut ws,
                json!({ "type": "error", "id": req["id"], "error": "404 no such service" }),
            )
            .await;
            let req = next_json(&mut ws).await.unwrap();
            send_json(
                &mut ws,
                json!({ "type": "response", "id": req["id"],
                        "payload": { "returnValue": false, "errorText": "app not running" } }),
            )
            .await;
            while next_json(&mut ws).await.is_some() {}
        })
        .await;

        let connector = WebOsConnector::new(port, Arc::new(MemoryStore::default()));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let link = connector.open("u1", &device(), events_tx);
        assert_eq!(next_event(&mut events).await, LinkEvent::Connected);

        let err = link.request("ssap://bogus", None).await.unwrap_err();
        assert_eq!(err, RequestError::Rejected("404 no such service".to_string()));
        let err = link
            .request("ssap://system.launcher/close", Some(json!({ "id": "netflix" })))
            .await
            .unwrap_err();
        assert_eq!(err, RequestError::Rejected("app not running".to_string()));
        link.close();
    }

    #[tokio::test]
    async fn socket_close_fails_in_flight_requests() {
        let port = fake_tv(|mut ws| async move {
            register(&mut ws, "k").await;
            let _ = next_json(&mut ws).await;
            let _ = ws.close(None).await;
        })
        .await;

        let connector = WebOsConnector::new(port, Arc::new(MemoryStore::default()));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let link = connector.open("u1", &device(), events_tx);
        assert_eq!(next_event(&mut events).await, LinkEvent::Connected);

        let err = link.request("ssap://system/turnOff", None).await.unwrap_err();
        assert_eq!(err, RequestError::Transport(TransportError::Closed));
        assert_eq!(next_event(&mut events).await, LinkEvent::Closed);

        // The session is gone; later requests fail immediately.
        let err = link.request("ssap://audio/volumeUp", None).await.unwrap_err();
        assert_eq!(err, RequestError::Transport(TransportError::Closed));
    }

    #[tokio::test]
    async fn refused_connection_reports_an_error_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = WebOsConnector::new(port, Arc::new(MemoryStore::default()));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let _link = connector.open("u1", &device(), events_tx);

        assert!(matches!(next_event(&mut events).await, LinkEvent::Error(_)));
    }

    #[tokio::test]
    async fn rejected_registration_is_a_link_error() {
        let port = fake_tv(|mut ws| async move {
            let _ = next_json(&mut ws).await;
            send_json(
                &mut ws,
                json!({ "type": "error", "id": REGISTER_ID, "error": "403 user denied access" }),
            )
            .await;
            while next_json(&mut ws).await.is_some() {}
        })
        .await;

        let connector = WebOsConnector::new(port, Arc::new(MemoryStore::default()));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let _link = connector.open("u1", &device(), events_tx);

        assert_eq!(
            next_event(&mut events).await,
            LinkEvent::Error("403 user denied access".to_string())
        );
    }

    #[test]
    fn register_frame_shape() {
        let frame = register_frame(Some("abc"));
        assert_eq!(frame["type"], "register");
        assert_eq!(frame["payload"]["client-key"], "abc");
        assert_eq!(frame["payload"]["manifest"]["manifestVersion"], 1);
    }
}
