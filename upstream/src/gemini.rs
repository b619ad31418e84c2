//! Gemini-style Live API client.
//!
//! Wire shape (subset relevant to this proxy — approximation of the real
//! Gemini Live API, same external-collaborator caveat as [`crate::openai`]):
//!
//! Client → server: `setup`, `realtimeInput` (`{"audio": {"data": b64, "mimeType": "audio/pcm;rate=N"}}`).
//! Server → client: `setupComplete`, `serverContent` carrying either
//! `modelTurn.parts[].inlineData` (audio) or `outputTranscription.text`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::{ProviderClient, ProviderConfig, ProviderEvent};

pub struct GeminiLiveClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    input_sample_rate: u32,
    turn_complete_seen: bool,
}

impl GeminiLiveClient {
    async fn send_setup(&mut self) -> Result<()> {
        let msg = json!({
            "setup": {
                "generationConfig": {
                    "responseModalities": ["AUDIO"],
                },
                "inputAudioTranscription": {},
                "outputAudioTranscription": {},
            },
        });
        debug!("gemini: sending setup ({}Hz in)", self.input_sample_rate);
        self.socket
            .send(WsMessage::Text(msg.to_string().into()))
            .await
            .context("failed to send Gemini setup message")
    }

    fn parse_event(&mut self, value: Value) -> Option<ProviderEvent> {
        if value.get("setupComplete").is_some() {
            return Some(ProviderEvent::SetupComplete);
        }
        let server_content = value.get("serverContent")?;
        if let Some(turn_complete) = server_content.get("turnComplete").and_then(|b| b.as_bool()) {
            if turn_complete {
                self.turn_complete_seen = true;
            }
        }
        if let Some(text) = server_content
            .get("outputTranscription")
            .and_then(|t| t.get("text"))
            .and_then(|t| t.as_str())
        {
            return Some(ProviderEvent::Transcript {
                text: text.to_string(),
                is_interim: !self.turn_complete_seen,
                language: None,
            });
        }
        let parts = server_content
            .get("modelTurn")
            .and_then(|m| m.get("parts"))
            .and_then(|p| p.as_array())?;
        for part in parts {
            if let Some(data) = part
                .get("inlineData")
                .and_then(|d| d.get("data"))
                .and_then(|d| d.as_str())
            {
                let response_boundary = std::mem::take(&mut self.turn_complete_seen);
                return Some(ProviderEvent::Audio {
                    payload_b64: data.to_string(),
                    response_boundary,
                });
            }
        }
        None
    }
}

#[async_trait]
impl ProviderClient for GeminiLiveClient {
    async fn connect(config: ProviderConfig) -> Result<Self> {
        let mut request = config
            .url
            .clone()
            .into_client_request()
            .context("invalid Gemini Live URL")?;
        request.headers_mut().insert(
            "x-goog-api-key",
            config
                .api_key
                .parse()
                .context("invalid Gemini API key header value")?,
        );

        let (socket, _response) = connect_async(request)
            .await
            .context("failed to connect to Gemini Live endpoint")?;

        let mut client = Self {
            socket,
            input_sample_rate: config.input_sample_rate,
            turn_complete_seen: false,
        };
        client.send_setup().await?;
        Ok(client)
    }

    async fn send_audio(&mut self, pcm_b64: &str) -> Result<()> {
        let msg = json!({
            "realtimeInput": {
                "audio": {
                    "data": pcm_b64,
                    "mimeType": format!("audio/pcm;rate={}", self.input_sample_rate),
                },
            },
        });
        self.socket
            .send(WsMessage::Text(msg.to_string().into()))
            .await
            .context("failed to send Gemini realtimeInput")
    }

    async fn recv(&mut self) -> Result<Option<ProviderEvent>> {
        loop {
            match self.socket.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let value: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("gemini: malformed frame ignored: {:#}", e);
                            continue;
                        }
                    };
                    if let Some(event) = self.parse_event(value) {
                        return Ok(Some(event));
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(Some(ProviderEvent::Closed)),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("gemini: websocket error: {:#}", e);
                    return Ok(Some(ProviderEvent::Closed));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.socket.close(None).await;
        Ok(())
    }
}
