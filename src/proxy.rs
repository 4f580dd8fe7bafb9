use crate::dispatch::{Destination, Dispatch, ProxyBody, DEFAULT_WEIGHT};
use crate::error::{json_error_response, ConfigError, ProxyErrorCode};
use crate::gate::{BootGate, GateOptions};
use crate::webspace::Identity;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Prefix of every terminal error message sent back to clients
const ERROR_TITLE: &str = "Webspace Boot Error";

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Boots the webspace for each request, points the dispatch table at it,
/// then lets the dispatch table handle the request.
pub struct RequestRouter<D> {
    gate: BootGate,
    next: Arc<D>,
}

impl<D: Dispatch> RequestRouter<D> {
    pub fn new(identity: Identity, next: Arc<D>, options: GateOptions) -> Result<Self, ConfigError> {
        let gate = BootGate::new(identity, options)?;
        debug!(user_id = gate.identity().user_id, "Created webspace request router");
        Ok(Self { gate, next })
    }

    pub fn gate(&self) -> &BootGate {
        &self.gate
    }

    pub fn next(&self) -> &Arc<D> {
        &self.next
    }

    /// Handle one request. Failures are terminal for this request only.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let user_id = self.gate.identity().user_id;

        let addr = match self.gate.resolve().await {
            Ok(addr) => addr,
            Err(e) => {
                error!(user_id, kind = e.kind(), error = %e, "Failed to ensure webspace is booted");
                return json_error_response(
                    ProxyErrorCode::WebspaceBootFailed,
                    format!("{}: {}", ERROR_TITLE, e),
                );
            }
        };

        let destination = match Destination::from_addr(&addr) {
            Ok(destination) => destination,
            Err(e) => {
                error!(user_id, addr, error = %e, "Failed to create webspace backend URL");
                return json_error_response(
                    ProxyErrorCode::BackendUrlInvalid,
                    format!("{}: Failed to create backend URL", ERROR_TITLE),
                );
            }
        };

        if let Err(e) = self.next.replace_servers(destination, DEFAULT_WEIGHT) {
            error!(user_id, addr, error = %e, "Failed to update dispatch table");
            return json_error_response(
                ProxyErrorCode::DispatchUpdateFailed,
                format!("{}: {}", ERROR_TITLE, e),
            );
        }

        self.next.serve(req).await
    }
}

/// HTTP listener in front of a [`RequestRouter`]
pub struct HttpServer<D> {
    bind_addr: SocketAddr,
    router: Arc<RequestRouter<D>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<D: Dispatch> HttpServer<D> {
    pub fn new(
        bind_addr: SocketAddr,
        router: Arc<RequestRouter<D>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            router,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "HTTP gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("HTTP gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S, D>(
    stream: S,
    addr: SocketAddr,
    router: Arc<RequestRouter<D>>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    D: Dispatch,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, hyper::Error>(handle_request(req, router, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request<D: Dispatch>(
    mut req: Request<Incoming>,
    router: Arc<RequestRouter<D>>,
    client_addr: SocketAddr,
) -> Response<ProxyBody> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // This gateway is the first trusted hop, so forwarded headers are overwritten.
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    router.handle(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::Balancer;
    use crate::dispatch::Server;
    use crate::pool::{ConnectionPool, PoolConfig};
    use http_body_util::Full;
    use hyper::body::Bytes;
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Control plane that always reports the webspace at 127.0.0.1:9
    async fn spawn_control_plane() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let body = if req.uri().path().ends_with("/ensure-started") {
                            "127.0.0.1"
                        } else {
                            r#"{"httpPort": 9}"#
                        };
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        addr
    }

    fn balancer() -> Arc<Balancer> {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        Arc::new(Balancer::new("test", pool, Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_router_rejects_incomplete_identity() {
        for identity in [
            Identity::new("", "token", 1),
            Identity::new("http://cp", "", 1),
            Identity::new("http://cp", "token", 0),
        ] {
            let result = RequestRouter::new(identity, balancer(), GateOptions::default());
            assert!(result.is_err());
        }
    }

    #[tokio::test]
    async fn test_router_keeps_dispatch_handle() {
        let next = balancer();
        let router =
            RequestRouter::new(Identity::new("http://cp", "token", 1), Arc::clone(&next), GateOptions::default())
                .unwrap();
        assert!(Arc::ptr_eq(router.next(), &next));
        assert_eq!(router.gate().identity().user_id, 1);
    }

    #[tokio::test]
    async fn test_locked_dispatch_table_fails_the_request() {
        let control_plane = spawn_control_plane().await;
        let original = Server::new(Destination::from_addr("10.0.0.1:80").unwrap(), 1);
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let next = Arc::new(
            Balancer::new("test", pool, Duration::from_secs(5))
                .with_lock_timeout(Duration::from_millis(20))
                .with_servers(vec![original.clone()]),
        );
        let identity = Identity::new(format!("http://{}", control_plane), "token", 1);
        let router = Arc::new(RequestRouter::new(identity, Arc::clone(&next), GateOptions::default()).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(HttpServer::new(addr, router, shutdown_rx).serve(listener));

        let reader = next.read_table();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: gateway\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        drop(reader);

        assert!(response.starts_with("HTTP/1.1 500"), "{}", response);
        assert!(response.to_lowercase().contains("x-proxy-error: dispatch_update_failed"));
        assert!(response.contains("Webspace Boot Error:"));
        assert_eq!(next.servers(), vec![original]);
    }
}
