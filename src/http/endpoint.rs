//! The hosting endpoint: one listener, one dispatch path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use futures_util::future::BoxFuture;
use tokio::sync::{watch, OnceCell};
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::config::{ClientCertificateMode, EndpointConfig, Transport};
use crate::error::HostingError;
use crate::http::subserver::{UpgradeContext, WebSocketSubServer};
use crate::tls::server::build_server_config;
use crate::tls::{extract_candidate, TrustAnchorSet};

/// Handler bound on a path prefix.
pub type RequestHandler = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// One listening server hosting request handlers, a fallback application
/// and websocket sub-servers.
///
/// Certificate material is parsed at construction; [`init`](Self::init)
/// binds the socket and starts serving; [`dispose`](Self::dispose) tears
/// everything down in order and is safe to call from several tasks at
/// once.
pub struct HostingEndpoint {
    inner: Arc<EndpointInner>,
    runtime: Mutex<Option<ServerRuntime>>,
    disposed: OnceCell<()>,
}

struct EndpointInner {
    config: EndpointConfig,
    trust: Option<TrustAnchorSet>,
    bindings: Mutex<Vec<(String, RequestHandler)>>,
    fallback: Mutex<Option<Router>>,
    sub_servers: Mutex<HashMap<String, Arc<dyn WebSocketSubServer>>>,
}

struct ServerRuntime {
    local_addr: SocketAddr,
    shutdown: ShutdownHandle,
    task: tokio::task::JoinHandle<()>,
}

enum ShutdownHandle {
    Plain(watch::Sender<bool>),
    Tls(Handle),
}

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

impl HostingEndpoint {
    /// Build an endpoint from its configuration, parsing all certificate
    /// material. Fails rather than start with a partial trust setup.
    pub fn new(config: EndpointConfig) -> Result<Self, HostingError> {
        let trust = if config.ca_certificates.is_empty() {
            None
        } else {
            Some(TrustAnchorSet::load(&config.ca_certificates)?)
        };

        if config.client_certificate_mode.requires_trust_anchors()
            && trust.as_ref().map_or(true, |t| t.is_empty())
        {
            return Err(HostingError::invalid_operation(format!(
                "server '{}': client certificate mode '{:?}' requires CA certificates",
                config.name, config.client_certificate_mode
            )));
        }

        Ok(Self {
            inner: Arc::new(EndpointInner {
                config,
                trust,
                bindings: Mutex::new(Vec::new()),
                fallback: Mutex::new(None),
                sub_servers: Mutex::new(HashMap::new()),
            }),
            runtime: Mutex::new(None),
            disposed: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The bound address, available after [`init`](Self::init).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().unwrap().as_ref().map(|r| r.local_addr)
    }

    /// Register a handler for every request whose path starts with
    /// `path`. Handlers match in registration order.
    pub fn bind_request_handler(
        &self,
        path: impl Into<String>,
        handler: RequestHandler,
    ) -> Result<(), HostingError> {
        let path = path.into();
        let mut bindings = self.inner.bindings.lock().unwrap();
        if bindings.iter().any(|(bound, _)| *bound == path) {
            return Err(HostingError::PathAlreadyBound(path));
        }
        bindings.push((path, handler));
        Ok(())
    }

    /// Current fallback application. Installs an empty [`Router`] on
    /// first access when none was set; setting one explicitly fails
    /// from then on.
    ///
    /// The returned router is a snapshot; routes added to it are not
    /// seen by the endpoint. A configured fallback goes in through
    /// [`set_root_application`](Self::set_root_application) before the
    /// first access.
    pub fn root_application(&self) -> Router {
        let mut fallback = self.inner.fallback.lock().unwrap();
        fallback.get_or_insert_with(Router::new).clone()
    }

    /// Install the fallback application consulted when no bound handler
    /// matches.
    pub fn set_root_application(&self, app: Router) -> Result<(), HostingError> {
        let mut fallback = self.inner.fallback.lock().unwrap();
        if fallback.is_some() {
            return Err(HostingError::invalid_operation(
                "root application is already set",
            ));
        }
        *fallback = Some(app);
        Ok(())
    }

    /// Route upgrade requests on the sub-server's bind path to it.
    pub fn create_web_socket_server(
        &self,
        sub_server: Arc<dyn WebSocketSubServer>,
    ) -> Result<(), HostingError> {
        let bind_path = sub_server.bind_path().to_owned();
        let mut sub_servers = self.inner.sub_servers.lock().unwrap();
        if sub_servers.contains_key(&bind_path) {
            return Err(HostingError::PathAlreadyBound(bind_path));
        }
        sub_servers.insert(bind_path, sub_server);
        Ok(())
    }

    /// Unbind the sub-server on `bind_path` and hand it back.
    pub fn destroy_web_socket_server(
        &self,
        bind_path: &str,
    ) -> Result<Arc<dyn WebSocketSubServer>, HostingError> {
        self.inner
            .sub_servers
            .lock()
            .unwrap()
            .remove(bind_path)
            .ok_or_else(|| {
                HostingError::invalid_operation(format!(
                    "no websocket server bound on '{}'",
                    bind_path
                ))
            })
    }

    /// Bind the listening socket and start serving.
    pub async fn init(&self) -> Result<(), HostingError> {
        if self.runtime.lock().unwrap().is_some() {
            return Err(HostingError::invalid_operation(
                "endpoint is already initialized",
            ));
        }

        let addr = format!(
            "{}:{}",
            self.inner.config.listen_host, self.inner.config.listen_port
        );
        let std_listener = std::net::TcpListener::bind(&addr)
            .and_then(|listener| listener.set_nonblocking(true).map(|_| listener))
            .map_err(|source| HostingError::Listen {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = std_listener
            .local_addr()
            .map_err(|source| HostingError::Listen { addr, source })?;

        let router = Router::new()
            .fallback(dispatch)
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.inner));
        let name = self.inner.config.name.clone();

        let runtime = match &self.inner.config.transport {
            Transport::Http => {
                let listener =
                    tokio::net::TcpListener::from_std(std_listener).map_err(|source| {
                        HostingError::Listen {
                            addr: local_addr.to_string(),
                            source,
                        }
                    })?;
                let (shutdown, mut signal) = watch::channel(false);
                let task = tokio::spawn(async move {
                    let serve = axum::serve(
                        listener,
                        router.into_make_service_with_connect_info::<SocketAddr>(),
                    )
                    .with_graceful_shutdown(async move {
                        let _ = signal.changed().await;
                    });
                    if let Err(e) = serve.await {
                        error!(server = %name, error = %e, "listener failed");
                    }
                });
                ServerRuntime {
                    local_addr,
                    shutdown: ShutdownHandle::Plain(shutdown),
                    task,
                }
            }
            Transport::Https {
                server_certificate,
                server_key,
                server_key_password,
            } => {
                let tls_config = build_server_config(
                    server_certificate,
                    server_key,
                    server_key_password.as_deref(),
                    self.inner.config.client_certificate_mode,
                    self.inner.trust.as_ref(),
                )?;
                let handle = Handle::new();
                let server =
                    axum_server::from_tcp_rustls(std_listener, RustlsConfig::from_config(Arc::new(tls_config)))
                        .handle(handle.clone());
                let task = tokio::spawn(async move {
                    let serve = server
                        .serve(router.into_make_service_with_connect_info::<SocketAddr>());
                    if let Err(e) = serve.await {
                        error!(server = %name, error = %e, "listener failed");
                    }
                });
                ServerRuntime {
                    local_addr,
                    shutdown: ShutdownHandle::Tls(handle),
                    task,
                }
            }
        };

        info!(
            server = %self.inner.config.name,
            addr = %local_addr,
            tls = self.inner.config.transport.is_tls(),
            mode = ?self.inner.config.client_certificate_mode,
            "listening"
        );
        *self.runtime.lock().unwrap() = Some(runtime);
        Ok(())
    }

    /// Tear the endpoint down: unbind sub-servers, force-close their
    /// connections, then stop the listener. Idempotent; concurrent callers
    /// all wait for the one teardown.
    pub async fn dispose(&self) {
        self.disposed.get_or_init(|| self.teardown()).await;
    }

    async fn teardown(&self) {
        info!(server = %self.inner.config.name, "shutting down");

        let sub_servers: Vec<Arc<dyn WebSocketSubServer>> = {
            let mut map = self.inner.sub_servers.lock().unwrap();
            map.drain().map(|(_, sub_server)| sub_server).collect()
        };
        for sub_server in sub_servers {
            sub_server.dispose().await;
        }

        self.inner.bindings.lock().unwrap().clear();
        self.inner.fallback.lock().unwrap().take();

        let runtime = self.runtime.lock().unwrap().take();
        if let Some(runtime) = runtime {
            match runtime.shutdown {
                ShutdownHandle::Plain(shutdown) => {
                    let _ = shutdown.send(true);
                }
                ShutdownHandle::Tls(handle) => handle.graceful_shutdown(Some(SHUTDOWN_GRACE)),
            }
            let mut task = runtime.task;
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for HostingEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostingEndpoint")
            .field("name", &self.inner.config.name)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Single entry point for every request and upgrade on the listener.
async fn dispatch(State(inner): State<Arc<EndpointInner>>, request: Request) -> Response {
    if inner.config.client_certificate_mode == ClientCertificateMode::Xfcc {
        let authorized = match extract_candidate(request.headers()) {
            Some(candidate) => inner.trust.as_ref().is_some_and(|t| t.verify(&candidate)),
            None => false,
        };
        if !authorized {
            debug!(
                server = %inner.config.name,
                path = %request.uri().path(),
                "no trusted forwarded certificate, rejecting"
            );
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    let path = request.uri().path().to_owned();

    let sub_server = inner.sub_servers.lock().unwrap().get(&path).cloned();
    let request = match sub_server {
        Some(sub_server) => {
            let (mut parts, body) = request.into_parts();
            match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
                Ok(upgrade) => {
                    let context = UpgradeContext {
                        sub_protocol: first_proposed_protocol(&parts.headers),
                        peer: parts
                            .extensions
                            .get::<ConnectInfo<SocketAddr>>()
                            .map(|info| info.0),
                    };
                    let upgrade = match &context.sub_protocol {
                        Some(protocol) => upgrade.protocols([protocol.clone()]),
                        None => upgrade,
                    };
                    return upgrade.on_upgrade(move |socket| async move {
                        sub_server.accept(socket, context).await;
                    });
                }
                // Not an upgrade; fall through to the request handlers.
                Err(_) => Request::from_parts(parts, body),
            }
        }
        None => request,
    };

    let handler = {
        let bindings = inner.bindings.lock().unwrap();
        bindings
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, handler)| Arc::clone(handler))
    };
    if let Some(handler) = handler {
        return handler(request).await;
    }

    let fallback = inner.fallback.lock().unwrap().clone();
    if let Some(app) = fallback {
        return match app.oneshot(request).await {
            Ok(response) => response,
            Err(e) => match e {},
        };
    }

    warn!(server = %inner.config.name, path = %path, "no handler bound for request");
    (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response()
}

/// The first sub-protocol the peer proposed, if any.
fn first_proposed_protocol(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    value
        .split(',')
        .map(str::trim)
        .find(|token| !token.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn first_proposed_protocol_takes_leading_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("chat.v2, chat.v1"),
        );
        assert_eq!(
            first_proposed_protocol(&headers).as_deref(),
            Some("chat.v2")
        );
    }

    #[test]
    fn no_protocol_header_yields_none() {
        assert!(first_proposed_protocol(&HeaderMap::new()).is_none());
    }

    #[test]
    fn duplicate_prefix_binding_is_rejected() {
        let endpoint =
            HostingEndpoint::new(EndpointConfig::http("test", "127.0.0.1", 0)).unwrap();
        let handler: RequestHandler = Arc::new(|_request| {
            Box::pin(async { StatusCode::OK.into_response() })
        });

        endpoint.bind_request_handler("/api", handler.clone()).unwrap();
        let err = endpoint.bind_request_handler("/api", handler).unwrap_err();
        assert!(matches!(err, HostingError::PathAlreadyBound(path) if path == "/api"));
    }

    #[test]
    fn xfcc_mode_without_anchors_fails_construction() {
        let mut config = EndpointConfig::http("edge", "127.0.0.1", 0);
        config.client_certificate_mode = ClientCertificateMode::Xfcc;

        let err = HostingEndpoint::new(config).unwrap_err();
        assert!(matches!(err, HostingError::InvalidOperation(_)));
    }
}
