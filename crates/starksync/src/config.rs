//! Synchronizer configuration.

use std::time::Duration;

/// Default block window for one `eth_getLogs` query.
pub const DEFAULT_WINDOW_SIZE: u64 = 10_000;

/// L1 connection and ingestion settings.
#[derive(Debug, Clone)]
pub struct L1Config {
    /// HTTP RPC URL (eth_getLogs, eth_blockNumber, eth_chainId, eth_getTransactionByHash).
    pub http_url: String,
    /// WebSocket RPC URL for the live log subscription.
    pub ws_url: String,
    /// Max block range per eth_getLogs request.
    pub window_size: u64,
    /// Bounded retry for backfill queries.
    pub retry: RetryConfig,
    /// Reconnection backoff for the live tail.
    pub reconnection: ReconnectionConfig,
}

impl L1Config {
    /// Config with the WebSocket URL derived from the HTTP one (http -> ws, https -> wss).
    pub fn from_http_url(http_url: impl Into<String>) -> Self {
        let http_url = http_url.into();
        let ws_url = http_url
            .replace("http://", "ws://")
            .replace("https://", "wss://");
        Self {
            http_url,
            ws_url,
            window_size: DEFAULT_WINDOW_SIZE,
            retry: RetryConfig::default(),
            reconnection: ReconnectionConfig::default(),
        }
    }
}

/// Bounded retry with exponential backoff; exhausting it is fatal.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

/// Reconnection backoff.
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl ReconnectionConfig {
    /// Delay after `failures` consecutive failed connections, before jitter.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u64 << failures.saturating_sub(1).min(20);
        Duration::from_secs(
            self.initial_backoff_secs
                .saturating_mul(factor)
                .min(self.max_backoff_secs),
        )
    }
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 1,
            max_backoff_secs: 60,
        }
    }
}

/// Fact resolution poller settings.
#[derive(Debug, Clone)]
pub struct ResolutionConfig {
    pub poll_interval: Duration,
    /// Resolve facts strictly in observed order. When false, a fact whose dependencies are known
    /// may overtake one that is still waiting.
    pub strict_order: bool,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            strict_order: true,
        }
    }
}

/// State materializer settings.
#[derive(Debug, Clone)]
pub struct MaterializerConfig {
    /// Delay between feeder polls once the head is reached.
    pub poll_interval: Duration,
    /// Also persist blocks and their transactions.
    pub store_blocks: bool,
    /// Backoff after a retryable failure.
    pub retry_backoff: Duration,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            store_blocks: false,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// Everything the synchronizer needs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub l1: L1Config,
    /// Base URL of the L2 feeder gateway (without `/feeder_gateway`).
    pub feeder_url: String,
    pub resolution: ResolutionConfig,
    pub materializer: MaterializerConfig,
    /// Capacity of the event and resolved-fact channels.
    pub channel_capacity: usize,
}

impl SyncConfig {
    pub fn new(l1_http_url: impl Into<String>, feeder_url: impl Into<String>) -> Self {
        Self {
            l1: L1Config::from_http_url(l1_http_url),
            feeder_url: feeder_url.into(),
            resolution: ResolutionConfig::default(),
            materializer: MaterializerConfig::default(),
            channel_capacity: 256,
        }
    }
}
