//! Live-socket helpers shared by tests that need a backend to talk to.

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// Serve `app` on an ephemeral localhost port.
pub async fn spawn_upstream(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An address nothing is listening on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Captures every request an upstream receives.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Recorder {
    pub fn push(&self, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) {
        self.requests.lock().unwrap().push(Recorded {
            method,
            uri,
            headers,
            body,
        });
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Upstream answering every request with a canned response.
    pub fn router(
        &self,
        status: StatusCode,
        headers: Vec<(HeaderName, &'static str)>,
        body: &'static str,
    ) -> Router {
        let recorder = self.clone();
        Router::new().fallback(
            move |method: Method, uri: Uri, request_headers: HeaderMap, request_body: Bytes| {
                let recorder = recorder.clone();
                let headers = headers.clone();
                async move {
                    recorder.push(method, uri, request_headers, request_body);
                    let mut response = (status, body).into_response();
                    for (name, value) in headers {
                        response
                            .headers_mut()
                            .insert(name, HeaderValue::from_static(value));
                    }
                    response
                }
            },
        )
    }
}
