use crate::dispatch::Dispatcher;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Clone)]
struct ServerState {
    dispatcher: Arc<Dispatcher>,
}

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let state = Arc::new(ServerState { dispatcher });
    Router::new()
        .route("/health", get(health_check))
        .route("/messages", post(receive_message))
        .with_state(state)
}

pub async fn start(
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening for commands");
    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

// Every delivered message counts as handled, whatever the outcome. The dispatch runs
// in its own task so a client that hangs up does not cancel a command halfway.
async fn receive_message(State(state): State<Arc<ServerState>>, body: String) -> StatusCode {
    let dispatcher = state.dispatcher.clone();
    let task = tokio::spawn(async move { dispatcher.handle_message(&body).await });
    if let Err(err) = task.await {
        tracing::error!(error = %err, "message handler task failed");
    }
    StatusCode::ACCEPTED
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SessionCache;
    use crate::content::testing::FakeCatalog;
    use crate::device::testing::{settings, tv, FakeConnector, FakeWake};
    use crate::device::{TvConnection, URI_TURN_OFF, URI_VOLUME_UP};
    use crate::discovery::{Discover, DiscoveryError};
    use crate::dispatch::Provisioner;
    use crate::model::DeviceDescriptor;
    use crate::store::memory::MemoryStore;
    use crate::store::{ConfigStore, UserConfig};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use std::time::Duration;
    use tower::ServiceExt;

    struct NoDiscovery;

    #[async_trait]
    impl Discover for NoDiscovery {
        async fn discover_device(
            &self,
            timeout: Duration,
        ) -> Result<DeviceDescriptor, DiscoveryError> {
            Err(DiscoveryError::Timeout(timeout))
        }
    }

    struct Harness {
        app: Router,
        connector: Arc<FakeConnector>,
        cache: Arc<SessionCache<TvConnection>>,
        store: Arc<MemoryStore>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::default());
        let mut config = UserConfig::new();
        config.insert("TV".to_string(), tv());
        store.save("u1", &config).await.unwrap();

        let connector = FakeConnector::auto();
        let provisioner = Provisioner::new(
            "TV",
            store.clone(),
            Arc::new(NoDiscovery),
            Duration::from_secs(5),
            connector.clone(),
            Arc::new(FakeWake::default()),
            settings(),
        );
        let cache = Arc::new(SessionCache::new(Duration::from_secs(60)));
        let dispatcher = Dispatcher::new(
            cache.clone(),
            provisioner,
            store.clone(),
            Arc::new(FakeCatalog::default()),
        );
        Harness {
            app: router(Arc::new(dispatcher)),
            connector,
            cache,
            store,
        }
    }

    async fn app() -> (Router, Arc<FakeConnector>) {
        let h = harness().await;
        (h.app, h.connector)
    }

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/messages")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let (app, _) = app().await;
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn message_is_dispatched_and_accepted() {
        let (app, connector) = app().await;
        let resp = app
            .oneshot(post(r#"{"command":"volumeUp","userId":"u1"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(connector.link(0).requests()[0].0, URI_VOLUME_UP);
    }

    #[tokio::test]
    async fn failures_are_still_accepted() {
        let (app, connector) = app().await;
        for body in [
            "{oops",
            r#"{"command":"selfDestruct","userId":"u1"}"#,
            r#"{"command":"volumeUp","userId":"unknown-user"}"#,
        ] {
            let resp = app.clone().oneshot(post(body)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::ACCEPTED, "{body}");
        }
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test]
    async fn messages_route_only_accepts_post() {
        let (app, _) = app().await;
        let resp = app
            .oneshot(Request::builder().uri("/messages").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test(start_paused = true)]
    async fn power_off_finishes_after_the_client_hangs_up() {
        let h = harness().await;
        let hung_up = tokio::time::timeout(
            Duration::from_millis(500),
            h.app.clone().oneshot(post(r#"{"command":"powerOff","userId":"u1"}"#)),
        )
        .await
        .is_err();
        assert!(hung_up);
        assert_eq!(h.connector.link(0).requests()[0].0, URI_TURN_OFF);

        // past the settle delay
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(h.cache.is_empty());

        let resp = h
            .app
            .oneshot(post(r#"{"command":"volumeUp","userId":"u1"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(h.store.load_count(), 2);
        assert_eq!(h.connector.open_count(), 2);
    }
}
