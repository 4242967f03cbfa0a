use std::convert::Infallible;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use hyper::body::Body;
use hyper::header::{
    HeaderValue, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE,
};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Request, Response, Server, StatusCode};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub mod error;
pub mod relay;
pub mod target;

pub use error::{RelayError, RequestError};
pub use relay::{Session, SessionState, SessionSummary};
pub use target::{Target, DEFAULT_PORT};

use target::require_websocket_upgrade;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Used when the request carries no `port` parameter.
    pub default_port: u16,
}

#[derive(Clone)]
struct SharedConfig {
    default_port: u16,
}

/// Binds `config.listen` and serves relay upgrades until `shutdown` resolves.
/// Returns the bound address, which differs from `config.listen` when port 0
/// was requested.
pub fn spawn_relay<S>(
    config: RelayConfig,
    shutdown: S,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)>
where
    S: Future<Output = ()> + Send + 'static,
{
    let shared = Arc::new(SharedConfig {
        default_port: config.default_port,
    });

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let shared = shared.clone();
        let remote_addr = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(req, remote_addr, shared.clone())
            }))
        }
    });

    let std_listener = TcpListener::bind(config.listen)?;
    std_listener.set_nonblocking(true)?;
    let local_addr = std_listener.local_addr()?;
    let builder =
        Server::from_tcp(std_listener).map_err(|err| IoError::new(ErrorKind::Other, err))?;
    let server = builder.http1_only(true).serve(make_svc);
    let graceful = server.with_graceful_shutdown(shutdown);

    let handle = tokio::spawn(async move {
        if let Err(err) = graceful.await {
            error!(error = %err, "relay server exited with error");
        }
    });

    Ok((local_addr, handle))
}

async fn handle_request(
    req: Request<Body>,
    remote_addr: SocketAddr,
    shared: Arc<SharedConfig>,
) -> Result<Response<Body>, Infallible> {
    match accept_websocket(req, remote_addr, shared) {
        Ok(resp) => Ok(resp),
        Err(err) => {
            debug!(%remote_addr, error = %err, "rejected relay request");
            Ok(reject(err))
        }
    }
}

/// Validates the request, answers with 101 and hands the upgraded connection
/// to a relay session on its own task.
fn accept_websocket(
    mut req: Request<Body>,
    remote_addr: SocketAddr,
    shared: Arc<SharedConfig>,
) -> Result<Response<Body>, RequestError> {
    let target = Target::from_query(req.uri().query(), shared.default_port)?;
    require_websocket_upgrade(req.headers())?;

    let key = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .ok_or(RequestError::MissingWebSocketKey)?;
    let accept_key = derive_accept_key(key.as_bytes());
    let accept_value =
        HeaderValue::from_str(&accept_key).map_err(|_| RequestError::InvalidAcceptKey)?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept_value);

    info!(%remote_addr, %target, "accepted websocket connection");
    let upgrade = hyper::upgrade::on(&mut req);

    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                warn!(%remote_addr, %target, error = %err, "failed to upgrade connection");
                return;
            }
        };
        let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
        let session = Session::new(target);
        let id = session.id();
        let target = session.target().clone();
        match session.run(ws).await {
            Ok(summary) => {
                debug!(
                    %remote_addr,
                    %target,
                    session = %id,
                    bytes_to_target = summary.bytes_to_target,
                    bytes_to_client = summary.bytes_to_client,
                    "relay closed"
                );
            }
            Err(err) => {
                warn!(%remote_addr, %target, session = %id, error = %err, "relay ended with error");
            }
        }
    });

    Ok(response)
}

fn reject(err: RequestError) -> Response<Body> {
    let mut resp = response_with(err.status(), err.to_string());
    if err == RequestError::UpgradeRequired {
        resp.headers_mut()
            .insert(UPGRADE, HeaderValue::from_static("websocket"));
    }
    resp
}

fn response_with(status: StatusCode, msg: impl Into<String>) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
