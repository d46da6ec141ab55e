// ===============================
// src/config.rs
// ===============================
use clap::Parser;
use dotenvy::dotenv;
use std::env;

/// Sumber event feed: sintetis (mock) atau WS live ke bot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
    Live,
}

impl FeedMode {
    pub fn from_env(key: &str, default_mode: FeedMode) -> FeedMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" => FeedMode::Mock,
            "live" | "ws" => FeedMode::Live,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock => "mock",
            FeedMode::Live => "live",
        }
    }
}

/// Reconnect backoff tuning. Floor/growth/cap adalah konfigurasi, bukan
/// konstanta: operator bisa menyetel agresivitas recovery per deployment.
#[derive(Clone, Debug)]
pub struct BackoffCfg {
    pub floor_ms: u64,
    pub growth: f64,
    pub cap_ms: u64,
}

impl BackoffCfg {
    /// Next delay in the deterministic schedule after one more failure.
    pub fn next_delay_ms(&self, prev_ms: u64) -> u64 {
        let grown = (prev_ms as f64 * self.growth) as u64;
        grown.clamp(self.floor_ms, self.cap_ms)
    }
}

/// Override operasional via CLI; selebihnya lewat ENV / .env
#[derive(Parser, Debug)]
#[command(name = "bot_console_rust", version)]
struct Cli {
    /// Run against the synthetic event generator instead of a live bot
    #[arg(long)]
    mock: bool,

    /// WS endpoint of the bot event stream (overrides WS_URL)
    #[arg(long)]
    ws_url: Option<String>,

    /// Prometheus metrics port (overrides METRICS_PORT)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// JSONL capture file (overrides RECORD_FILE)
    #[arg(long)]
    record_file: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Args {
    // feed
    pub feed_mode: FeedMode,
    pub ws_url: String,
    pub ws_token: Option<String>,

    // channel sizing
    pub bus_capacity: usize,
    pub send_queue: usize,

    // reconciler
    pub trade_buffer_cap: usize,

    // liveness
    pub ping_interval_sec: u64,
    pub backoff: BackoffCfg,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

pub fn load() -> Args {
    // Pastikan .env dibaca (WS_URL, WS_TOKEN, RECORD_FILE, dll)
    let _ = dotenv();
    let cli = Cli::parse();

    // ===== Feed =====
    let mut feed_mode = FeedMode::from_env("FEED_MODE", FeedMode::Mock);
    if cli.mock {
        feed_mode = FeedMode::Mock;
    }
    let ws_url = cli
        .ws_url
        .or_else(|| env::var("WS_URL").ok())
        .unwrap_or_else(|| "ws://127.0.0.1:8100/ws".to_string());
    let ws_token = env::var("WS_TOKEN").ok().filter(|s| !s.is_empty());

    // ===== Channels =====
    let bus_capacity = env_parse("BUS_CAPACITY", 4096usize).max(2);
    let send_queue = env_parse("SEND_QUEUE", 256usize).max(1);

    // ===== Reconciler =====
    // Observed fleet values range 100..400; default mengikuti konsol live.
    let trade_buffer_cap = env_parse("TRADE_BUFFER_CAP", 100usize).max(1);

    // ===== Liveness =====
    let ping_interval_sec = env_parse("PING_INTERVAL_SEC", 30u64).max(1);
    let backoff = BackoffCfg {
        floor_ms: env_parse("BACKOFF_FLOOR_MS", 500u64).max(1),
        growth: env_parse("BACKOFF_GROWTH", 2.0f64).max(1.0),
        cap_ms: env_parse("BACKOFF_CAP_MS", 32_000u64).max(1),
    };

    // ===== Files / metrics =====
    let record_file = cli.record_file.or_else(|| env::var("RECORD_FILE").ok());
    let metrics_port = cli.metrics_port.unwrap_or_else(|| env_parse("METRICS_PORT", 9898u16));

    Args {
        feed_mode,
        ws_url,
        ws_token,
        bus_capacity,
        send_queue,
        trade_buffer_cap,
        ping_interval_sec,
        backoff,
        record_file,
        metrics_port,
    }
}
