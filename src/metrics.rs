// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Stream connection health --------
pub static WS_CONNECTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("ws_connected", "1 if the event stream is connected, 0 otherwise").unwrap());

pub static WS_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ws_reconnects_total", "reconnect attempts scheduled").unwrap());

pub static WS_MESSAGES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ws_messages_total", "successfully decoded frames").unwrap());

pub static WS_DECODE_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ws_decode_errors_total", "undecodable frames dropped").unwrap());

pub static WS_SEND_DROPPED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ws_send_dropped_total", "outbound payloads dropped (best-effort send)").unwrap());

pub static WS_LAST_EVENT_TS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("ws_last_event_ts", "unix seconds of the last decoded frame").unwrap());

pub static WS_LAST_EVENT_AGE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("ws_last_event_age_seconds", "age (seconds) since the last decoded frame").unwrap());

// -------- Feed / reconciled views --------
pub static EVENTS_BY_KIND: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("events_total_by_kind", "decoded events per kind (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

pub static OPEN_ORDERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_orders", "entries in the open-orders view").unwrap());

pub static TRADE_BUFFER_LEN: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("trade_buffer_len", "entries in the recent-trades buffer").unwrap());

// ---- Config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_feed_mode", "feed mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_TRADE_CAP: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("config_trade_buffer_cap", "configured trade buffer cap").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(WS_MESSAGES.clone())),
        REGISTRY.register(Box::new(WS_DECODE_ERRORS.clone())),
        REGISTRY.register(Box::new(WS_SEND_DROPPED.clone())),
        REGISTRY.register(Box::new(WS_LAST_EVENT_TS.clone())),
        REGISTRY.register(Box::new(WS_LAST_EVENT_AGE.clone())),
        REGISTRY.register(Box::new(EVENTS_BY_KIND.clone())),
        REGISTRY.register(Box::new(OPEN_ORDERS.clone())),
        REGISTRY.register(Box::new(TRADE_BUFFER_LEN.clone())),
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_TRADE_CAP.clone())),
    ] {
        let _ = m;
    }
}

// Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one request (GET / or /metrics) — tiny HTTP 1.1 responder, no parse
fn handle_client(mut stream: TcpStream) {
    let mut _req = [0u8; 512];
    let _ = stream.read(&mut _req);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Dedicated OS thread keeps the Tokio runtime clean of blocking accepts
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(?e, %addr, "metrics bind failed, metrics disabled");
                return;
            }
        };
        tracing::info!(%addr, "metrics listening (/metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}
