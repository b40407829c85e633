use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Handler invoked with each inbound text message, in order, exactly once.
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Push-notification subscription for one appliance.
///
/// The connection is keyed by the device identifier baked into the URL and
/// by the access token snapshot taken at construction. A token refresh
/// makes the snapshot stale; the socket does not self-refresh and must be
/// stopped and started again to pick up a new token.
///
/// There is no automatic reconnection: a transport failure logs and ends
/// the read task. Restarting is the owning session's responsibility.
pub struct EventSocket {
    url: String,
    access_token: String,
    handler: MessageHandler,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EventSocket {
    pub fn new(url: String, access_token: String, handler: MessageHandler) -> Self {
        Self {
            url,
            access_token,
            handler,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Begin the subscription. Returns immediately; the connection is
    /// established on a spawned task. Starting a running socket is a no-op.
    pub fn start(&mut self) {
        if self.task.is_some() {
            debug!("Event socket already running");
            return;
        }

        let cancel = CancellationToken::new();
        self.cancel = cancel.clone();

        let url = self.url.clone();
        let access_token = self.access_token.clone();
        let handler = self.handler.clone();

        self.task = Some(tokio::spawn(async move {
            if let Err(e) = connect_and_read(&url, &access_token, handler, &cancel).await {
                error!("Event socket failed: {}", e);
            }
            debug!("Event socket task exiting");
        }));
    }

    /// Tear the connection down and wait for the read task to finish, so a
    /// subsequent [`start`](Self::start) cannot race the old connection.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Event socket task join failed: {}", e);
            }
        }
    }
}

/// Establish the WebSocket connection and forward text frames until the
/// stream ends or the socket is cancelled.
async fn connect_and_read(
    url: &str,
    access_token: &str,
    handler: MessageHandler,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("Connecting event socket: {}", url);

    let uri: tungstenite::http::Uri = url
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocket(e.to_string()))?;

    let request = ClientRequestBuilder::new(uri)
        .with_header("Authorization", format!("Bearer {}", access_token));

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::WebSocket(e.to_string()))?;

    info!("Event socket connected");

    let (_write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        handler(text.to_string());
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite replies with pong automatically
                    }
                    Some(Ok(tungstenite::Message::Close(_))) => {
                        info!("Event socket closed by server");
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        return Err(Error::WebSocket(e.to_string()));
                    }
                    None => {
                        info!("Event socket stream ended");
                        return Ok(());
                    }
                    _ => {
                        // Binary, Pong, raw frames -- ignore
                    }
                }
            }
        }
    }
}
