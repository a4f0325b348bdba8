//! HTTP server.
//!
//! Every accepted connection is served on its own task with a kill switch
//! that handlers can trip to drop the connection without writing a response.

use anyhow::Result;
use axum::http::HeaderMap;
use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

/// Pause after a failed accept so persistent errors such as fd exhaustion
/// do not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Connection-scoped handle, available to handlers as a request extension.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    peer: SocketAddr,
    kill: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            kill: CancellationToken::new(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Drop the underlying connection. Nothing further is written to it.
    pub fn sever(&self) {
        self.kill.cancel();
    }

    #[cfg(test)]
    pub fn is_severed(&self) -> bool {
        self.kill.is_cancelled()
    }

    async fn severed(&self) {
        self.kill.cancelled().await
    }
}

/// Client address: first `x-forwarded-for` entry, else the socket peer.
pub fn client_ip(headers: &HeaderMap, conn: Option<&ConnectionHandle>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match (forwarded, conn) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(conn)) => conn.peer().ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

/// Outer layers applied around the component routers.
#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    pub use_cors: bool,
    pub hosting_dir: Option<PathBuf>,
}

/// Assemble the gateway router.
///
/// `saml` is mounted under its base path when the bridge is configured.
pub fn build_router(proxy: Router, saml: Option<(String, Router)>, options: &RouterOptions) -> Router {
    let mut app = proxy;

    if let Some((base_path, saml)) = saml {
        app = app.nest(&base_path, saml);
    }

    if let Some(dir) = &options.hosting_dir {
        info!(dir = %dir.display(), "Serving static web client");
        app = app.fallback_service(ServeDir::new(dir));
    }

    if options.use_cors {
        app = app.layer(CorsLayer::permissive());
    }

    app
}

/// Accept connections until the listener fails or the task is dropped.
pub async fn serve(listener: TcpListener, app: Router) -> Result<()> {
    let local = listener.local_addr()?;
    info!(listen = %local, "Gateway listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                accept_backoff(&e).await;
                continue;
            }
        };

        let handle = ConnectionHandle::new(peer);
        let app = app.clone().layer(Extension(handle.clone()));
        tokio::spawn(serve_connection(stream, app, handle));
    }
}

async fn accept_backoff(error: &std::io::Error) {
    warn!(error = %error, backoff_ms = ACCEPT_ERROR_BACKOFF.as_millis() as u64, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

async fn serve_connection(stream: TcpStream, app: Router, handle: ConnectionHandle) {
    let io = TokioIo::new(stream);
    let service = TowerToHyperService::new(app);
    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(io, service);

    tokio::select! {
        biased;
        _ = handle.severed() => {
            debug!(peer = %handle.peer(), "Connection severed");
        }
        result = connection => {
            if let Err(e) = result {
                debug!(peer = %handle.peer(), error = %e, "Connection closed with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{Allowlist, AllowlistConfig, HeaderSanitizer, ProxyConfig, ProxyEngine};
    use crate::test_support::{spawn_upstream, Recorder};
    use crate::upstream::build_client;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let conn = ConnectionHandle::new("192.0.2.10:5555".parse().unwrap());
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(&conn)), "192.0.2.10");
        assert_eq!(client_ip(&headers, None), "unknown");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.5, 10.0.0.1"));
        assert_eq!(client_ip(&headers, Some(&conn)), "203.0.113.5");
    }

    #[test]
    fn test_sever_is_observable() {
        let conn = ConnectionHandle::new("127.0.0.1:1".parse().unwrap());
        let other = conn.clone();
        assert!(!conn.is_severed());
        other.sever();
        assert!(conn.is_severed());
    }

    #[tokio::test]
    async fn test_accept_error_backs_off() {
        let error = std::io::Error::other("too many open files");
        let started = std::time::Instant::now();
        accept_backoff(&error).await;
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn test_static_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>hive</html>").unwrap();

        let options = RouterOptions {
            use_cors: false,
            hosting_dir: Some(dir.path().to_path_buf()),
        };
        let app = build_router(Router::new(), None, &options);

        let response = app
            .oneshot(Request::get("/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_oversized_body_drops_connection() {
        let recorder = Recorder::default();
        let upstream = spawn_upstream(recorder.router(StatusCode::OK, vec![], "<r/>")).await;

        let mut allowlist = AllowlistConfig::new();
        allowlist.insert("http".to_string(), vec![upstream.to_string()]);
        let engine = ProxyEngine::new(
            ProxyConfig {
                max_body_size: 64,
                ..Default::default()
            },
            Arc::new(Allowlist::new(&allowlist)),
            HeaderSanitizer::default(),
            build_client(false, None).unwrap(),
        )
        .unwrap();
        let app = build_router(crate::proxy::router(Arc::new(engine)), None, &RouterOptions::default());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, app));

        let body = format!(
            "<request><proxy><redirect_url>http://{}/pm</redirect_url></proxy>{}</request>",
            upstream,
            "x".repeat(256)
        );
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let head = format!(
            "POST /~proxy HTTP/1.1\r\nHost: gateway\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(body.as_bytes()).await.unwrap();

        let mut received = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received)).await;
        assert!(read.is_ok(), "connection was not closed");
        assert!(received.is_empty(), "no HTTP response may be written");
        assert_eq!(recorder.count(), 0);
    }

    #[tokio::test]
    async fn test_small_body_is_served_over_socket() {
        let app = build_router(
            Router::new().route("/ping", axum::routing::get(|| async { "pong" })),
            None,
            &RouterOptions::default(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, app));

        let body = reqwest::get(format!("http://{}/ping", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "pong");
    }
}
