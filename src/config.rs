//! Process configuration, loaded from the environment: required values use
//! `.expect(...)`, defaulted values use `.ok().and_then(...).unwrap_or(...)`.

use tracing::info;
use upstream::ProviderKind;

use crate::dispatch::RoutingMode;

/// Default provider-facing PCM sample rate (spec.md §8 scenario 1's "100
/// upstream PCM messages at 24 kHz (default)").
const DEFAULT_PROVIDER_SAMPLE_RATE: u32 = 24_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub routing_mode: RoutingMode,
    pub container_pool_size: usize,
    pub max_connections_per_container: usize,
    pub min_containers: usize,
    pub scale_down_idle_time_ms: u64,
    pub translation_provider: ProviderKind,
    pub force_commit_timeout_secs: u64,
    pub provider_api_key: String,
    pub provider_url: String,
    /// Sample rate (Hz) the provider expects inbound PCM at. Not part of
    /// the wire configuration table in spec.md §6 - an ambient knob,
    /// defaulted to the 24 kHz spec.md's scenarios assume.
    pub provider_input_sample_rate: u32,
    /// Sample rate (Hz) the provider emits outbound PCM at.
    pub provider_output_sample_rate: u32,
    pub listen_addr: std::net::SocketAddr,
    /// Operational cap on the warmup queues (`pendingOpusFrames` /
    /// `pendingPCMChunks`). Not part of the wire configuration table, an
    /// ambient knob, unbounded (`None`) unless set.
    pub warmup_queue_cap: Option<usize>,
}

impl Config {
    pub fn from_env() -> Self {
        if dotenvy::dotenv().is_ok() {
            info!("Loaded .env file");
        }

        let routing_mode = std::env::var("ROUTING_MODE")
            .ok()
            .and_then(|s| RoutingMode::from_env_str(&s))
            .unwrap_or(RoutingMode::Session);

        let container_pool_size = std::env::var("CONTAINER_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(5);

        let max_connections_per_container = std::env::var("MAX_CONNECTIONS_PER_CONTAINER")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(10);

        let min_containers = std::env::var("MIN_CONTAINERS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(2);

        let scale_down_idle_time_ms = std::env::var("SCALE_DOWN_IDLE_TIME")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(600_000);

        let translation_provider = std::env::var("TRANSLATION_PROVIDER")
            .ok()
            .and_then(|s| ProviderKind::from_env_str(&s))
            .unwrap_or_default();

        let force_commit_timeout_secs = std::env::var("FORCE_COMMIT_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(2);

        let provider_api_key = std::env::var("TRANSLATION_PROVIDER_API_KEY")
            .expect("TRANSLATION_PROVIDER_API_KEY environment variable must be set");

        let provider_url = std::env::var("TRANSLATION_PROVIDER_URL").unwrap_or_else(|_| {
            match translation_provider {
                ProviderKind::Openai => {
                    "wss://api.openai.com/v1/realtime?model=gpt-realtime".to_string()
                }
                ProviderKind::Gemini => {
                    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string()
                }
            }
        });

        let listen_addr = std::env::var("LISTEN_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| std::net::SocketAddr::from(([0, 0, 0, 0], 3000)));

        let warmup_queue_cap = std::env::var("WARMUP_QUEUE_CAP")
            .ok()
            .and_then(|s| s.parse::<usize>().ok());

        let provider_input_sample_rate = std::env::var("PROVIDER_INPUT_SAMPLE_RATE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_PROVIDER_SAMPLE_RATE);

        let provider_output_sample_rate = std::env::var("PROVIDER_OUTPUT_SAMPLE_RATE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_PROVIDER_SAMPLE_RATE);

        info!(
            "Configuration: routing_mode={:?} provider={:?} min_containers={} max_per_container={}",
            routing_mode, translation_provider, min_containers, max_connections_per_container
        );

        Self {
            routing_mode,
            container_pool_size,
            max_connections_per_container,
            min_containers,
            scale_down_idle_time_ms,
            translation_provider,
            force_commit_timeout_secs,
            provider_api_key,
            provider_url,
            provider_input_sample_rate,
            provider_output_sample_rate,
            listen_addr,
            warmup_queue_cap,
        }
    }
}
