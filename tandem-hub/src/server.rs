//! HTTP front end: WebSocket upgrades join sessions, every other request
//! gets a health response.
//!
//! ```text
//!  TcpListener ──axum::serve──► Router fallback
//!                                 ├─ WebSocket upgrade ─► serve_connection
//!                                 │                        (path → session name)
//!                                 └─ anything else ─────► 200 "okay"
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{OriginalUri, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::connection::{serve_connection, session_name_from_path};
use crate::hub::Hub;
use crate::notifier::MutationCallback;
use crate::storage::StoreError;

const HEALTH_BODY: &str = "okay";

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Accept loop bound to one hub.
pub struct HubServer {
    hub: Arc<Hub>,
    listener: Option<TcpListener>,
}

impl HubServer {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            listener: None,
        }
    }

    /// Build a hub from `config` (opening storage if configured) and wrap it.
    pub fn open(
        config: ServerConfig,
        callback: Option<Arc<dyn MutationCallback>>,
    ) -> Result<Self, ServerError> {
        Ok(Self::new(Arc::new(Hub::open(config, callback)?)))
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Bind the configured address. Returns the actual local address.
    pub async fn bind(&mut self) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(self.hub.config().bind_addr()).await?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Address of the bound listener, if bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Serve until the listener fails. Binds first if needed.
    pub async fn serve(mut self) -> Result<(), ServerError> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => TcpListener::bind(self.hub.config().bind_addr()).await?,
        };
        let port = listener.local_addr()?.port();
        log::info!("running at '{}' on port {port}", self.hub.config().host);

        axum::serve(listener, build_router(self.hub)).await?;
        Ok(())
    }

    /// Bind and serve.
    pub async fn run(mut self) -> Result<(), ServerError> {
        self.bind().await?;
        self.serve().await
    }
}

/// Router answering every path: upgrades join the session the path names.
pub fn build_router(hub: Arc<Hub>) -> Router {
    Router::new().fallback(handle_request).with_state(hub)
}

async fn handle_request(
    State(hub): State<Arc<Hub>>,
    OriginalUri(uri): OriginalUri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(ws) => {
            let name = session_name_from_path(uri.path());
            log::debug!("Upgrading request for '{}'", uri.path());
            ws.on_upgrade(move |socket| serve_connection(hub, socket, name))
        }
        Err(_) => HEALTH_BODY.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        }
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let mut server = HubServer::new(Arc::new(Hub::new(local_config(), None, None)));
        assert!(server.local_addr().is_none());

        let addr = server.bind().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
    }

    #[tokio::test]
    async fn test_plain_http_gets_okay_on_any_path() {
        let hub = Arc::new(Hub::new(local_config(), None, None));
        let mut server = HubServer::new(Arc::clone(&hub));
        let addr = server.bind().await.unwrap();
        tokio::spawn(server.serve());

        for path in ["/", "/room-1", "/health?verbose=1"] {
            let response = get(addr, path).await;
            assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
            assert!(response.to_ascii_lowercase().contains("content-type: text/plain"));
            assert!(response.ends_with("\r\n\r\nokay"));
        }
        assert_eq!(hub.session_count().await, 0);
    }
}
