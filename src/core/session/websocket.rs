use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{SessionClient, SessionHandle};
use crate::core::config::FarmingConfig;
use crate::core::error::{PollError, SessionError};
use crate::core::oauth::Credential;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLAIM_MESSAGE: &str = r#"{"action":"claim_rewards"}"#;

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Option<f64>,
}

/// Farms over the network's WebSocket endpoint, claiming rewards on a fixed
/// cadence, and reads the balance from its HTTP API.
pub struct WebSocketSessionClient {
    http: reqwest::Client,
    ws_url: String,
    balance_url: String,
    claim_interval: Duration,
    connect_timeout: Duration,
    request_timeout: Duration,
    // Connections opened but not yet handed to `run`.
    pending: Mutex<HashMap<Uuid, WsStream>>,
}

impl WebSocketSessionClient {
    pub fn new(config: &FarmingConfig) -> Self {
        let request_timeout = config.request_timeout();
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(config.connect_timeout())
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
            ws_url: config.ws_url.clone(),
            balance_url: config.balance_url.clone(),
            claim_interval: Duration::from_secs(config.claim_interval_secs.max(1)),
            connect_timeout: config.connect_timeout(),
            request_timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn request_error(&self, e: reqwest::Error) -> PollError {
        if e.is_timeout() {
            PollError::Timeout(self.request_timeout)
        } else {
            PollError::Request(e.to_string())
        }
    }
}

fn parse_balance(body: &str) -> Result<f64, PollError> {
    let parsed: BalanceResponse =
        serde_json::from_str(body).map_err(|e| PollError::Decode(e.to_string()))?;
    parsed
        .balance
        .ok_or_else(|| PollError::Decode("response has no balance field".to_string()))
}

#[async_trait]
impl SessionClient for WebSocketSessionClient {
    async fn open(
        &self,
        account: &str,
        credential: &Credential,
    ) -> Result<SessionHandle, SessionError> {
        let handle = SessionHandle::new(account, credential);

        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Open(format!("Invalid WebSocket URL: {}", e)))?;
        let auth = HeaderValue::from_str(handle.authorization())
            .map_err(|e| SessionError::Open(format!("Invalid authorization header: {}", e)))?;
        request.headers_mut().insert("Authorization", auth);

        let (stream, _) = match tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
        {
            Err(_elapsed) => {
                return Err(SessionError::Open(format!(
                    "WebSocket connect timed out after {:?}",
                    self.connect_timeout
                )));
            }
            Ok(result) => result
                .map_err(|e| SessionError::Open(format!("WebSocket connect failed: {}", e)))?,
        };

        self.pending.lock().await.insert(handle.id, stream);
        info!(account = %account, session = %handle.id, "Started farming session");
        Ok(handle)
    }

    async fn run(
        &self,
        handle: SessionHandle,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        let stream = self
            .pending
            .lock()
            .await
            .remove(&handle.id)
            .ok_or(SessionError::Closed)?;
        let (mut write, mut read) = stream.split();

        // First tick fires immediately, so rewards are claimed on connect.
        let mut claim_timer = tokio::time::interval(self.claim_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    debug!(account = %handle.account, "Farming session cancelled");
                    return Ok(());
                }

                _ = claim_timer.tick() => {
                    if let Err(e) = write.send(Message::Text(CLAIM_MESSAGE.into())).await {
                        error!(account = %handle.account, "Farming failed: {}", e);
                        return Err(SessionError::Transport(e.to_string()));
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            info!(account = %handle.account, "Farming response: {}", text);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = write.send(Message::Pong(payload)).await {
                                return Err(SessionError::Transport(e.to_string()));
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!(account = %handle.account, "WebSocket closed by server");
                            return Err(SessionError::Closed);
                        }
                        Some(Err(e)) => {
                            error!(account = %handle.account, "Farming failed: {}", e);
                            return Err(SessionError::Transport(e.to_string()));
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    async fn poll_metric(
        &self,
        handle: &SessionHandle,
        credential: &Credential,
    ) -> Result<f64, PollError> {
        let response = self
            .http
            .get(&self.balance_url)
            .header("Authorization", credential.authorization())
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Request(format!("balance endpoint returned HTTP {}", status)));
        }
        let body = response.text().await.map_err(|e| self.request_error(e))?;

        let balance = parse_balance(&body)?;
        info!(account = %handle.account, "Balance: {} $GRASS", balance);
        Ok(balance)
    }

    async fn close(&self, handle: &SessionHandle) {
        if let Some(mut stream) = self.pending.lock().await.remove(&handle.id) {
            let _ = stream.close(None).await;
        }
    }
}
