//! translate-proxy: a real-time audio streaming proxy sitting between a
//! voice-streaming client and an upstream speech-AI provider.
//!
//! # Architecture
//!
//! - HTTP/WebSocket server (Axum) accepting one client connection per call
//! - A [`dispatch::DispatchRouter`] / [`coordinator::LoadCoordinator`] edge
//!   deciding which backend worker instance a session belongs to
//! - A [`multiplexer::SessionMultiplexer`] per client socket, demultiplexing
//!   participants ("tags") onto independent [`provider_session::ProviderSessionHandle`]s
//! - Per-tag Opus/L16 decode, PLC/FEC concealment, resampling, and Opus
//!   re-encoding of the upstream provider's audio

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod audio_decoder;
mod audio_encoder;
mod chunk;
mod codec;
mod config;
mod coordinator;
mod dispatch;
mod gap;
mod multiplexer;
mod provider_session;
mod resampler;

use chunk::Encoding;
use config::Config;
use coordinator::LoadCoordinator;
use dispatch::{DispatchRouter, RoutingMode};
use multiplexer::{DispatchParams, SessionMultiplexer};
use provider_session::SessionOutboundEvent;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    dispatch_router: Arc<DispatchRouter>,
    load_coordinator: Option<Arc<LoadCoordinator>>,
    /// The process-global outbound sequence counter (spec.md §5, §9): one
    /// instance per worker process, shared by every `SessionMultiplexer`
    /// (and every `ProviderSession` within it) this process ever spawns.
    sequence_counter: Arc<AtomicU64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::from_env());

    let load_coordinator = if config.routing_mode == RoutingMode::Autoscale {
        let db_path = std::env::var("COORDINATOR_DB_PATH").unwrap_or_else(|_| "./coordinator-state".to_string());
        match LoadCoordinator::open(
            std::path::Path::new(&db_path),
            config.max_connections_per_container as u32,
            config.min_containers,
            std::time::Duration::from_millis(config.scale_down_idle_time_ms),
        ) {
            Ok(coordinator) => Some(coordinator),
            Err(e) => {
                error!("failed to open load coordinator store at {db_path}: {e:#}");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let dispatch_router = Arc::new(DispatchRouter::new(config.routing_mode, config.container_pool_size));

    let state = AppState {
        config: config.clone(),
        dispatch_router,
        load_coordinator,
        sequence_counter: Arc::new(AtomicU64::new(0)),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let addr = config.listen_addr;
    info!("Listening on http://{addr}");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e:#}");
            std::process::exit(1);
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c, shutting down"),
        Err(e) => error!("failed to install ctrl-c handler: {e:#}"),
    }
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

/// Query-string parameters accepted on the `/ws` upgrade request.
#[derive(Debug, Deserialize)]
struct WsParams {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    encoding: Option<String>,
    #[serde(rename = "sendBack")]
    send_back: Option<bool>,
    transcribe: Option<bool>,
    #[serde(rename = "useDispatcher")]
    use_dispatcher: Option<bool>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> impl IntoResponse {
    let use_dispatcher = params.use_dispatcher.unwrap_or(false);

    // Set when autoscale routing actually assigns a worker, so the edge can
    // report `connectionOpened`/`connectionClosed` against it (spec.md
    // §4.7). The `session`/`shared`/`pool` strategies don't go through the
    // coordinator at all, so there is nothing to open/close for them.
    let mut coordinator_assignment: Option<(Arc<LoadCoordinator>, String, String)> = None;

    if use_dispatcher {
        let worker_id = if state.config.routing_mode == RoutingMode::Autoscale {
            match &state.load_coordinator {
                Some(coordinator) => {
                    let session_id = params.session_id.clone().unwrap_or_default();
                    match coordinator.assign(&session_id).await {
                        Ok(id) => {
                            coordinator_assignment = Some((coordinator.clone(), session_id, id.clone()));
                            id
                        }
                        Err(e) => {
                            error!("dispatch: coordinator assign failed: {e:#}");
                            return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
                        }
                    }
                }
                None => {
                    error!("dispatch: autoscale routing requested without a coordinator");
                    return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
                }
            }
        } else {
            state.dispatch_router.route(params.session_id.as_deref())
        };
        info!("dispatch: routed session {:?} to worker {worker_id}", params.session_id);
    }

    if let Some((coordinator, session_id, worker_id)) = &coordinator_assignment {
        if let Err(e) = coordinator.connection_opened(session_id, worker_id).await {
            error!("dispatch: coordinator connection_opened failed: {e:#}");
            return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    let default_encoding = params
        .encoding
        .as_deref()
        .and_then(|s| match s {
            "opus" => Some(Encoding::Opus),
            "ogg-opus" => Some(Encoding::OggOpus),
            "L16" => Some(Encoding::L16),
            _ => None,
        })
        .unwrap_or(Encoding::Opus);

    let dispatch_params = DispatchParams {
        default_encoding,
        send_back: params.send_back.unwrap_or(true),
        transcribe: params.transcribe.unwrap_or(true),
    };

    ws.on_upgrade(move |socket| {
        handle_socket(socket, state.config, state.sequence_counter, dispatch_params, coordinator_assignment)
    })
}

async fn handle_socket(
    socket: WebSocket,
    config: Arc<Config>,
    sequence_counter: Arc<AtomicU64>,
    dispatch_params: DispatchParams,
    coordinator_assignment: Option<(Arc<LoadCoordinator>, String, String)>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SessionOutboundEvent>();

    let render_params = dispatch_params.clone();
    let mut mux = SessionMultiplexer::new(config, sequence_counter, outbound_tx, dispatch_params);

    let (text_tx, mut text_rx) = mpsc::unbounded_channel::<String>();

    // Forwards both direct replies (pong) and session-originated events
    // (audio/transcripts) to the client socket, and closes it with code
    // 1011 if a session reports an upstream-induced failure.
    let forward_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                text = text_rx.recv() => {
                    match text {
                        Some(text) => {
                            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = outbound_rx.recv() => {
                    match event {
                        Some(SessionOutboundEvent::Error { tag, reason }) => {
                            warn!("tag {tag}: session error: {reason}");
                        }
                        Some(SessionOutboundEvent::Closed { tag }) => {
                            info!("tag {tag}: upstream-induced close");
                        }
                        Some(other) => {
                            if let Some(text) = multiplexer::render_outbound(&other, &render_params) {
                                if ws_sender.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Text(text) => {
                if let Some(reply) = mux.handle_text(&text) {
                    let _ = text_tx.send(reply);
                }
            }
            Message::Binary(bin) => {
                if let Ok(text) = String::from_utf8(bin.to_vec()) {
                    if let Some(reply) = mux.handle_text(&text) {
                        let _ = text_tx.send(reply);
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    info!("client socket closed, tearing down sessions");
    mux.close_all();
    forward_task.abort();

    if let Some((coordinator, session_id, worker_id)) = coordinator_assignment {
        if let Err(e) = coordinator.connection_closed(&session_id, &worker_id).await {
            error!("dispatch: coordinator connection_closed failed: {e:#}");
        }
    }
}
