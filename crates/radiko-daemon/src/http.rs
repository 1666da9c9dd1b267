//! HTTP fan-out surface.
//!
//! ```text
//!   GET     /api/play/:station_id   live ADTS stream (one shared ffmpeg per station)
//!   HEAD    /api/play/:station_id   stream headers only
//!   OPTIONS /api/play/:station_id   Allow: GET, HEAD, OPTIONS
//!   GET     /api/status             {"<station>":{"clients":n,"running":bool}}
//! ```
//!
//! Each GET attaches a consumer whose sink is an mpsc channel; the response
//! body drains the receiver.  When the client goes away the body (and the
//! receiver) is dropped, `Sender::closed()` fires and the consumer detaches.
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use anyhow::Context;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::stream;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use radiko_proto::protocol::StatusReport;
use radiko_stream::{ChannelSink, ConsumerId, SessionRegistry};

use crate::client_ip::real_ip;

/// Chunks buffered per listener between the dispatcher and the socket.
const LISTENER_QUEUE: usize = 32;

#[derive(Clone)]
pub struct HttpState {
    registry: SessionRegistry,
}

pub fn router(registry: SessionRegistry) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS]);

    // CORS only on status: the layer answers every OPTIONS itself, and the
    // play route has its own OPTIONS reply.
    Router::new()
        .route(
            "/api/play/:station_id",
            get(play).head(head).options(options),
        )
        .route("/api/play", get(missing_station))
        .route("/api/play/", get(missing_station))
        .route("/api/status", get(status).layer(cors))
        .with_state(HttpState { registry })
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    bind_address: &str,
    port: u16,
    registry: SessionRegistry,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("HTTP server listening on http://{}", addr);
    info!("Try: vlc http://localhost:{}/api/play/QRR", port);

    axum::serve(
        listener,
        router(registry).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("http server error")?;
    info!("HTTP server stopped");
    Ok(())
}

fn stream_headers(station_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("audio/aac"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("none"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    if let Ok(name) = HeaderValue::from_str(&format!("Radiko - {}", station_id)) {
        headers.insert(HeaderName::from_static("icy-name"), name);
    }
    headers.insert(
        HeaderName::from_static("icy-genre"),
        HeaderValue::from_static("Radio"),
    );
    headers
}

async fn play(
    Path(station_id): Path<String>,
    State(state): State<HttpState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request_headers: HeaderMap,
) -> Response {
    let station_id = station_id.trim().to_string();
    if station_id.is_empty() {
        return missing_station().await.into_response();
    }
    let client_ip = real_ip(&request_headers, Some(remote));
    let consumer_id = ConsumerId::generate(&client_ip);
    info!("GET /api/play/{} from {} ({})", station_id, client_ip, consumer_id);

    let (tx, mut rx) = mpsc::channel::<Bytes>(LISTENER_QUEUE);
    let (session, consumer) = match state
        .registry
        .attach(&station_id, consumer_id, Box::new(ChannelSink::new(tx.clone())))
        .await
    {
        Ok(attached) => attached,
        Err(e) => {
            warn!("Cannot stream {} to {}: {}", station_id, client_ip, e);
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };

    tokio::spawn(async move {
        let id = consumer.id().clone();
        session
            .serve_consumer(consumer, async move { tx.closed().await })
            .await;
        info!("Listener {} left {}", id, session.station_id());
    });

    let body = stream::poll_fn(move |cx| {
        rx.poll_recv(cx)
            .map(|chunk| chunk.map(Ok::<Bytes, Infallible>))
    });
    (StatusCode::OK, stream_headers(&station_id), Body::from_stream(body)).into_response()
}

async fn head(
    Path(station_id): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request_headers: HeaderMap,
) -> Response {
    let station_id = station_id.trim();
    info!(
        "HEAD /api/play/{} from {}",
        station_id,
        real_ip(&request_headers, Some(remote))
    );
    (StatusCode::OK, stream_headers(station_id)).into_response()
}

async fn options() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::ALLOW, HeaderValue::from_static("GET, HEAD, OPTIONS"))],
    )
}

async fn missing_station() -> impl IntoResponse {
    (StatusCode::BAD_REQUEST, "stationID is required")
}

async fn status(State(state): State<HttpState>) -> Json<StatusReport> {
    Json(state.registry.status())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use futures_util::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tower::ServiceExt;

    use radiko_stream::error::{ResolveError, Result as StreamResult};
    use radiko_stream::{
        ProcessLauncher, ResolvedStream, SessionSettings, TranscodeProfile, TranscoderProcess,
        UpstreamResolver,
    };

    use super::*;

    struct OkResolver;

    #[async_trait]
    impl UpstreamResolver for OkResolver {
        async fn resolve(&self, station_id: &str) -> std::result::Result<ResolvedStream, ResolveError> {
            if station_id == "NOPE" {
                return Err(ResolveError::NoStreamUrl(station_id.to_string()));
            }
            Ok(ResolvedStream {
                auth_token: "tok".into(),
                stream_url: format!("https://upstream.test/{}", station_id),
            })
        }
    }

    /// Each process emits one chunk and then stays open.
    struct ChattyLauncher;

    #[async_trait]
    impl ProcessLauncher for ChattyLauncher {
        async fn launch(
            &self,
            label: &str,
            _stream: &ResolvedStream,
            _profile: &TranscodeProfile,
        ) -> StreamResult<TranscoderProcess> {
            let (mut writer, reader) = tokio::io::duplex(1024);
            let process = TranscoderProcess::from_reader(label, reader);
            let cancel = process.cancellation();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = writer.write_all(b"adts-frame").await;
                cancel.cancelled().await;
            });
            Ok(process)
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            stall_threshold: Duration::from_secs(3600),
            ..SessionSettings::default()
        }
    }

    fn app() -> (Router, SessionRegistry) {
        let registry = SessionRegistry::new(settings(), Arc::new(OkResolver), Arc::new(ChattyLauncher));
        let app = router(registry.clone())
            .layer(MockConnectInfo(SocketAddr::from(([192, 0, 2, 9], 40000))));
        (app, registry)
    }

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn get_streams_with_relay_headers() {
        let (app, registry) = app();
        let resp = app
            .oneshot(request(Method::GET, "/api/play/QRR"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let h = resp.headers();
        assert_eq!(h[header::CONTENT_TYPE], "audio/aac");
        assert_eq!(h[header::CACHE_CONTROL], "no-cache");
        assert_eq!(h["x-accel-buffering"], "no");
        assert_eq!(h["icy-name"], "Radiko - QRR");
        assert_eq!(h["icy-genre"], "Radio");
        assert_eq!(registry.status()["QRR"].consumer_count, 1);

        let mut body = resp.into_body().into_data_stream();
        let first = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&first[..], b"adts-frame");

        // Client hangs up: the consumer detaches and the idle timer starts.
        drop(body);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let session = registry.get("QRR").unwrap();
        assert_eq!(session.consumer_count(), 0);
        assert!(session.has_idle_timer());
    }

    #[tokio::test]
    async fn head_returns_headers_without_session() {
        let (app, registry) = app();
        let resp = app
            .oneshot(request(Method::HEAD, "/api/play/QRR"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "audio/aac");
        assert_eq!(resp.headers()[header::ACCEPT_RANGES], "none");
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert!(body.is_empty());
        assert!(registry.status().is_empty());
    }

    #[tokio::test]
    async fn options_lists_allowed_methods() {
        let (app, _) = app();
        let resp = app
            .oneshot(request(Method::OPTIONS, "/api/play/QRR"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::ALLOW], "GET, HEAD, OPTIONS");
    }

    #[tokio::test]
    async fn other_methods_are_rejected() {
        let (app, _) = app();
        let resp = app
            .oneshot(request(Method::POST, "/api/play/QRR"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn empty_station_is_bad_request() {
        let (app, _) = app();
        let resp = app
            .oneshot(request(Method::GET, "/api/play/"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn resolution_failure_is_bad_gateway() {
        let (app, registry) = app();
        let resp = app
            .oneshot(request(Method::GET, "/api/play/NOPE"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("NOPE"));
        assert!(registry.status().is_empty());
    }

    #[tokio::test]
    async fn status_reports_sessions() {
        let (app, registry) = app();
        let empty = app
            .clone()
            .oneshot(request(Method::GET, "/api/status"))
            .await
            .unwrap();
        let body = axum::body::to_bytes(empty.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"{}");

        let _stream = app
            .clone()
            .oneshot(request(Method::GET, "/api/play/TBS"))
            .await
            .unwrap();
        let resp = app
            .oneshot(request(Method::GET, "/api/status"))
            .await
            .unwrap();
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["TBS"]["clients"], 1);
        assert_eq!(parsed["TBS"]["running"], true);

        registry.stop_all().await;
    }
}
