//! OpenAI-style realtime API client.
//!
//! Wire shape (subset relevant to this proxy — a faithful-enough
//! approximation of the real `session.update` / `input_audio_buffer.append`
//! / `response.*` realtime protocol):
//!
//! Client → server: `session.update`, `input_audio_buffer.append`.
//! Server → client: `session.updated`, `response.created`,
//! `response.audio.delta`, `response.audio_transcript.delta`,
//! `conversation.item.input_audio_transcription.completed`, `error`.

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

pub struct OpenAiRealtimeClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// True once a `response.created` has been seen and no audio delta has
    /// been emitted for it yet — the next `response.audio.delta` is a
    /// response boundary.
    awaiting_response_boundary: bool,
}

impl OpenAiRealtimeClient {
    async fn send_session_update(&mut self, config: &ProviderConfig) -> Result<()> {
        let msg = json!({
            "type": "session.update",
            "session": {
                "modalities": ["text", "audio"],
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "turn_detection": { "type": "server_vad" },
            },
        });
        debug!("openai: sending session.update ({}Hz in)", config.input_sample_rate);
        self.socket
            .send(WsMessage::Text(msg.to_string().into()))
            .await
            .context("failed to send session.update")
    }

    fn parse_event(&mut self, value: Value) -> Option<ProviderEvent> {
        let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match kind {
            "session.updated" => Some(ProviderEvent::SetupComplete),
            "response.created" => {
                self.awaiting_response_boundary = true;
                None
            }
            "response.audio.delta" => {
                let payload_b64 = value.get("delta").and_then(|d| d.as_str())?.to_string();
                let response_boundary = std::mem::take(&mut self.awaiting_response_boundary);
                Some(ProviderEvent::Audio {
                    payload_b64,
                    response_boundary,
                })
            }
            "conversation.item.input_audio_transcription.completed"
            | "response.audio_transcript.done" => {
                let text = value.get("transcript").and_then(|t| t.as_str())?.to_string();
                Some(ProviderEvent::Transcript {
                    text,
                    is_interim: false,
                    language: None,
                })
            }
            "response.audio_transcript.delta" => {
                let text = value.get("delta").and_then(|t| t.as_str())?.to_string();
                Some(ProviderEvent::Transcript {
                    text,
                    is_interim: true,
                    language: None,
                })
            }
            "error" => {
                let message = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown openai realtime error")
                    .to_string();
                Some(ProviderEvent::ProviderError(message))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ProviderClient for OpenAiRealtimeClient {
    async fn connect(config: ProviderConfig) -> Result<Self> {
        let mut request = config
            .url
            .clone()
            .into_client_request()
            .context("invalid OpenAI realtime URL")?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", config.api_key)
                .parse()
                .context("invalid OpenAI API key header value")?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse().unwrap());

        let (socket, _response) = connect_async(request)
            .await
            .context("failed to connect to OpenAI realtime endpoint")?;

        let mut client = Self {
            socket,
            awaiting_response_boundary: false,
        };
        client.send_session_update(&config).await?;
        Ok(client)
    }

    async fn send_audio(&mut self, pcm_b64: &str) -> Result<()> {
        let msg = json!({
            "type": "input_audio_buffer.append",
            "audio": pcm_b64,
        });
        self.socket
            .send(WsMessage::Text(msg.to_string().into()))
            .await
            .context("failed to send input_audio_buffer.append")
    }

    async fn recv(&mut self) -> Result<Option<ProviderEvent>> {
        loop {
            match self.socket.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let value: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("openai: malformed frame ignored: {:#}", e);
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
                    warn!("openai: websocket error: {:#}", e);
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
