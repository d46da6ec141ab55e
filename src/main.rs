// ===============================
// src/main.rs
// ===============================
//
// bot_console_rust — live-event core for the trading bot operator console.
//
// Ingests the bot's streaming event feed over a persistent WS connection
// (auto-reconnect with capped backoff), fans decoded events out on a
// broadcast bus, and folds them into two bounded views (open orders, recent
// trades) that any number of consumers read via snapshot(). Exposes
// Prometheus metrics and an optional JSONL capture of the session.
//
mod config;
mod domain;
mod feed;
mod metrics;
mod reconciler;
mod recorder;

use std::sync::Arc;

use tokio::{
    select,
    sync::{mpsc, watch},
    time::{interval, sleep, Duration, MissedTickBehavior},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::domain::{ConnState, Event};
use crate::feed::{EventBus, StreamCfg, StreamManager};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let args = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    info!(
        feed_mode = args.feed_mode.as_str(),
        ws_url = %args.ws_url,
        trade_buffer_cap = args.trade_buffer_cap,
        backoff_floor_ms = args.backoff.floor_ms,
        backoff_cap_ms = args.backoff.cap_ms,
        "startup config"
    );
    metrics::CONFIG_FEED_MODE
        .with_label_values(&[args.feed_mode.as_str()])
        .set(1);
    metrics::CONFIG_TRADE_CAP.set(args.trade_buffer_cap as i64);

    // ---- Bus ----
    let bus = EventBus::new(args.bus_capacity);

    // ---- Reconciler (subscribe dulu, sebelum feed mulai publish) ----
    let rec = reconciler::Reconciler::new(args.trade_buffer_cap);
    tokio::spawn(reconciler::run(rec.clone(), bus.subscribe_rx()));

    // ---- Feed: mock generator atau WS live ----
    let mut manager: Option<Arc<StreamManager>> = None;
    let state_rx: watch::Receiver<ConnState>;
    let _mock_state_tx: Option<watch::Sender<ConnState>>;
    match args.feed_mode {
        config::FeedMode::Mock => {
            tokio::spawn(feed::run_mock(bus.clone()));
            // mock tidak punya koneksi; watch dummy agar downstream seragam
            let (tx, rx) = watch::channel(ConnState::Idle);
            _mock_state_tx = Some(tx);
            state_rx = rx;
        }
        config::FeedMode::Live => {
            let mgr = StreamManager::new(
                StreamCfg {
                    ws_url: args.ws_url.clone(),
                    ws_token: args.ws_token.clone(),
                    backoff: args.backoff.clone(),
                    send_queue: args.send_queue,
                },
                bus.clone(),
            );
            mgr.connect();
            state_rx = mgr.state_rx();
            _mock_state_tx = None;
            manager = Some(mgr);
        }
    }

    // ---- Recorder (optional) ----
    if let Some(path) = args.record_file.clone() {
        let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
        tokio::spawn(recorder::run(rec_rx, path));
        let _ = rec_tx.try_send(Event::Note("console core started".to_string()));

        let mut ev_rx = bus.subscribe_rx();
        let mut st_rx = state_rx.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    ev = ev_rx.recv() => {
                        if let Ok(ev) = ev {
                            let _ = rec_tx.try_send(Event::Raw(ev.into_value()));
                        }
                    }
                    Ok(_) = st_rx.changed() => {
                        let st = st_rx.borrow_and_update().clone();
                        let _ = rec_tx.try_send(Event::Conn(st));
                    }
                }
            }
        });
    }

    // ---- Ping berkala ke bot (live): jalur send() best-effort ----
    if let Some(mgr) = manager.clone() {
        let every = Duration::from_secs(args.ping_interval_sec);
        tokio::spawn(async move {
            let mut tick = interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await; // tick pertama instan, lewati
            loop {
                tick.tick().await;
                // gagal saat reconnect itu normal, cukup debug
                if let Err(e) = mgr.send(r#"{"kind":"ping"}"#.to_string()) {
                    tracing::debug!(%e, "ping dropped");
                }
            }
        });
    }

    // ---- Heartbeat: konsumen contoh (change signal + snapshot pull) ----
    let mut ev_rx = bus.subscribe_rx();
    let mut changes = rec.subscribe_changes();
    let mut st_rx = state_rx.clone();
    let mut conn_label = state_rx.borrow().label();
    let mut events: u64 = 0;
    let mut folds: u64 = 0;

    loop {
        select! {
            Ok(_) = ev_rx.recv() => { events += 1; }
            Ok(_) = changes.recv() => { folds += 1; }
            Ok(_) = st_rx.changed() => {
                conn_label = st_rx.borrow_and_update().label();
                info!(state = conn_label, "connection");
            }
            _ = sleep(Duration::from_secs(2)) => {
                let snap = rec.snapshot();
                let last_ts = metrics::WS_LAST_EVENT_TS.get();
                if last_ts > 0 {
                    metrics::WS_LAST_EVENT_AGE.set((chrono::Utc::now().timestamp() - last_ts).max(0));
                }
                info!(
                    state = conn_label,
                    events,
                    folds,
                    open_orders = snap.open_orders.len(),
                    trades = snap.trades.len(),
                    "heartbeat"
                );
                events = 0;
                folds = 0;
            }
        }
    }
}
