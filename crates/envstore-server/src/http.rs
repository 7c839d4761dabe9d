//! HTTP request/reply bridge.
//!
//! `POST /<subject>` carries the JSON payload; the reply body is the subject's
//! reply with status 200, domain errors included. Unknown subjects are 404
//! and `GET /health` answers `{"status":"ok"}`.
//!
//! The accept loop runs on a plain thread (tiny_http is blocking) and hands
//! every request to the tokio runtime, so requests are served concurrently.
//! [`TestServer`] starts a bridge over an in-memory store on a random port.

use crate::router::{dispatch, Subject};
use crate::ServerError;
use envstore_core::Engine;
use envstore_store::{MemoryStore, Store};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn json_header() -> Option<Header> {
    Header::from_bytes("Content-Type", "application/json").ok()
}

fn respond_err(req: Request, code: u16, msg: &str) {
    let _ = req.respond(Response::from_string(msg).with_status_code(StatusCode(code)));
}

fn respond_json(req: Request, json: impl Into<Vec<u8>>) {
    let mut response = Response::from_data(json.into());
    if let Some(header) = json_header() {
        response.add_header(header);
    }
    let _ = req.respond(response);
}

fn read_body(req: &mut Request) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    if req.as_reader().read_to_end(&mut body).is_ok() {
        Some(body)
    } else {
        None
    }
}

/// Handle a single HTTP request.
pub async fn handle_request<S: Store>(engine: &Engine<S>, mut req: Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    let path = url.split('?').next().unwrap_or_default();
    if path == "/health" {
        if method == Method::Get {
            respond_json(req, r#"{"status":"ok"}"#);
        } else {
            respond_err(req, 405, "method not allowed");
        }
        return;
    }

    let Some(subject) = path.strip_prefix('/').and_then(Subject::parse) else {
        respond_err(req, 404, "unknown subject");
        return;
    };
    if method != Method::Post {
        respond_err(req, 405, "method not allowed");
        return;
    }
    let Some(body) = read_body(&mut req) else {
        respond_err(req, 500, "read error");
        return;
    };

    let reply = dispatch(engine, &subject, &body).await;
    if reply.is_error() {
        debug!("{subject} replied with an error");
    }
    respond_json(req, reply.into_bytes());
}

/// Hand `req` to the runtime.
pub fn spawn_request<S: Store>(engine: &Arc<Engine<S>>, runtime: &Handle, req: Request) {
    let engine = Arc::clone(engine);
    runtime.spawn(async move {
        handle_request(&engine, req).await;
    });
}

/// Bind the bridge to `addr`.
pub fn bind(addr: &str) -> Result<Server, ServerError> {
    Server::http(addr).map_err(|e| ServerError::Bind {
        addr: addr.to_owned(),
        reason: e.to_string(),
    })
}

/// Accept requests until `stop` returns true, blocking the current thread.
pub fn run_server<S: Store>(
    engine: &Arc<Engine<S>>,
    runtime: &Handle,
    server: &Server,
    stop: impl Fn() -> bool,
) {
    if let Some(addr) = server.server_addr().to_ip() {
        info!("listening on {addr}");
    }
    while !stop() {
        match server.recv_timeout(POLL_INTERVAL) {
            Ok(Some(req)) => spawn_request(engine, runtime, req),
            Ok(None) => {}
            Err(e) => warn!("accept failed: {e}"),
        }
    }
    info!("accept loop stopped");
}

/// A bridge over a fresh [`MemoryStore`] on `127.0.0.1:{port}`, served by its
/// own runtime in a background thread.
///
/// Drop the `TestServer` to stop the server (via `Server::unblock`).
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub engine: Arc<Engine<MemoryStore>>,
    server: Arc<Server>,
    _handle: std::thread::JoinHandle<()>,
}

impl TestServer {
    /// Binds to `127.0.0.1:0` (random port).
    pub fn start() -> Result<Self, ServerError> {
        let server = Arc::new(bind("127.0.0.1:0")?);
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .ok_or_else(|| ServerError::Bind {
                addr: "127.0.0.1:0".to_owned(),
                reason: "not an IP address".to_owned(),
            })?;
        let url = format!("http://127.0.0.1:{port}");

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;
        let engine = Arc::new(Engine::new(MemoryStore::new()));

        let srv = Arc::clone(&server);
        let shared = Arc::clone(&engine);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                spawn_request(&shared, runtime.handle(), request);
            }
        });

        Ok(Self {
            url,
            port,
            engine,
            server,
            _handle: handle,
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
    }
}
