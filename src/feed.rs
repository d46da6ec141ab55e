// ===============================
// src/feed.rs
// ===============================
//
// Event feed adapters:
// - StreamManager : persistent WS connection to the bot's event stream,
//                   auto-reconnect with capped exponential backoff
// - run_mock      : synthetic order/trade generator (no live bot needed)
//
// Both publish decoded frames onto the same EventBus; everything downstream
// (reconciler, recorder, heartbeat) is a plain bus subscriber.
//

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::BackoffCfg;
use crate::domain::{ConnState, RawEvent};
use crate::metrics::{
    EVENTS_BY_KIND, WS_CONNECTED, WS_DECODE_ERRORS, WS_LAST_EVENT_TS, WS_MESSAGES, WS_RECONNECTS,
    WS_SEND_DROPPED,
};

/// Multi-subscriber stream of decoded events. No replay for late joiners,
/// kecuali satu item terakhir supaya subscriber yang join di tengah stream
/// langsung punya sesuatu untuk dirender.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RawEvent>,
    last: Arc<Mutex<Option<RawEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx, last: Arc::new(Mutex::new(None)) }
    }

    pub fn publish(&self, ev: RawEvent) {
        if let Ok(mut g) = self.last.lock() {
            *g = Some(ev.clone());
        }
        // Err hanya berarti belum ada subscriber; bukan masalah
        let _ = self.tx.send(ev);
    }

    /// Live receiver plus the most recent item (may be None before the first
    /// publish). Per-subscriber queue is bounded; slow consumers lag and lose
    /// the oldest entries without blocking anyone else.
    pub fn subscribe(&self) -> (Option<RawEvent>, broadcast::Receiver<RawEvent>) {
        let rx = self.tx.subscribe();
        let last = self.last.lock().ok().and_then(|g| g.clone());
        (last, rx)
    }

    pub fn subscribe_rx(&self) -> broadcast::Receiver<RawEvent> {
        self.tx.subscribe()
    }
}

/// Kegagalan send() bersifat non-fatal: payload di-drop, caller yang memutuskan
/// mau retry atau tidak.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("no open connection, payload dropped")]
    NotConnected,
    #[error("outbound queue full, payload dropped")]
    QueueFull,
}

#[derive(Clone, Debug)]
pub struct StreamCfg {
    pub ws_url: String,
    pub ws_token: Option<String>,
    pub backoff: BackoffCfg,
    pub send_queue: usize,
}

/// Owns the transport handle and the connection state machine:
///
///   Idle -> Connecting -> Open -> Reconnecting{attempt, next_delay} -> Open
///                                   `close()` forces any state -> Closing
///
/// Transitions are driven solely by transport events and elapsed timers and
/// are observable on a watch channel; no error from this component ever
/// surfaces as a panic/exception to callers.
pub struct StreamManager {
    cfg: StreamCfg,
    bus: EventBus,
    state_tx: watch::Sender<ConnState>,
    state_rx: watch::Receiver<ConnState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    out_tx: mpsc::Sender<String>,
    out_rx: Mutex<Option<mpsc::Receiver<String>>>,
    started: AtomicBool,
    weak_self: Weak<Self>,
}

impl StreamManager {
    pub fn new(cfg: StreamCfg, bus: EventBus) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ConnState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (out_tx, out_rx) = mpsc::channel(cfg.send_queue);
        Arc::new_cyclic(|weak| Self {
            cfg,
            bus,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            started: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    pub fn state(&self) -> ConnState {
        self.state_rx.borrow().clone()
    }

    /// Watch receiver untuk indikator live/reconnecting di UI.
    pub fn state_rx(&self) -> watch::Receiver<ConnState> {
        self.state_rx.clone()
    }

    /// Idempotent: no-op while already connected/connecting, and after close().
    pub fn connect(&self) {
        if *self.shutdown_rx.borrow() {
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mgr) = self.weak_self.upgrade() {
            tokio::spawn(async move { mgr.run().await });
        }
    }

    /// Best-effort; returns immediately. Without an open connection the
    /// payload is dropped and the failure reported, never thrown.
    pub fn send(&self, payload: String) -> Result<(), SendError> {
        if *self.state_rx.borrow() != ConnState::Open {
            WS_SEND_DROPPED.inc();
            return Err(SendError::NotConnected);
        }
        self.out_tx.try_send(payload).map_err(|_| {
            WS_SEND_DROPPED.inc();
            SendError::QueueFull
        })
    }

    /// Terminal: tutup transport, batalkan backoff wait yang pending, dan
    /// hentikan auto-reconnect. Tidak wajib dipanggil.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.state_tx.send(ConnState::Closing);
    }

    fn set_state(&self, st: ConnState) {
        // close() menang; Closing tidak boleh ditimpa
        if *self.shutdown_rx.borrow() {
            return;
        }
        info!(state = st.label(), "ws state");
        let _ = self.state_tx.send(st);
    }

    fn endpoint(&self) -> Option<String> {
        let mut url = match Url::parse(&self.cfg.ws_url) {
            Ok(u) => u,
            Err(e) => {
                error!(?e, url = %self.cfg.ws_url, "bad ws url");
                return None;
            }
        };
        if let Some(tok) = &self.cfg.ws_token {
            url.query_pairs_mut().append_pair("token", tok);
        }
        Some(url.to_string())
    }

    async fn run(self: Arc<Self>) {
        let Some(endpoint) = self.endpoint() else {
            let _ = self.state_tx.send(ConnState::Closing);
            return;
        };
        let Some(mut out_rx) = self.out_rx.lock().ok().and_then(|mut g| g.take()) else {
            return;
        };
        let mut shutdown = self.shutdown_rx.clone();
        let mut attempt: u32 = 0;
        let mut delay_ms = self.cfg.backoff.floor_ms;

        self.set_state(ConnState::Connecting);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match connect_async(endpoint.as_str()).await {
                Ok((mut ws, _resp)) => {
                    info!(url = %self.cfg.ws_url, "event stream connected");
                    attempt = 0;
                    self.set_state(ConnState::Open);
                    WS_CONNECTED.set(1);
                    self.session(&mut ws, &mut out_rx, &mut shutdown).await;
                    WS_CONNECTED.set(0);
                }
                Err(e) => {
                    warn!(?e, url = %self.cfg.ws_url, "connect failed");
                }
            }
            if *shutdown.borrow() {
                break;
            }

            attempt = attempt.saturating_add(1);
            delay_ms = if attempt == 1 {
                self.cfg.backoff.floor_ms
            } else {
                self.cfg.backoff.next_delay_ms(delay_ms)
            };
            WS_RECONNECTS.inc();
            self.set_state(ConnState::Reconnecting { attempt, next_delay_ms: delay_ms });

            // jitter kecil agar fleet tidak serentak; sleep tidak melewati cap
            let jitter = rand::thread_rng().gen_range(0..=250);
            let sleep_ms = (delay_ms + jitter).min(self.cfg.backoff.cap_ms.max(delay_ms));
            tokio::select! {
                _ = sleep(Duration::from_millis(sleep_ms)) => {}
                _ = shutdown.changed() => break, // close() cancels the pending wait
            }
        }
        WS_CONNECTED.set(0);
    }

    /// One connected session; returns on transport error, remote close, or
    /// shutdown. Frame korup di-drop per-message dan TIDAK pernah dianggap
    /// kegagalan koneksi.
    async fn session<S>(
        &self,
        ws: &mut tokio_tungstenite::WebSocketStream<S>,
        out_rx: &mut mpsc::Receiver<String>,
        shutdown: &mut watch::Receiver<bool>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(m)) if m.is_text() => {
                        let txt = match m.into_text() {
                            Ok(t) => t,
                            Err(e) => {
                                debug!(?e, "failed to read text frame");
                                continue;
                            }
                        };
                        match RawEvent::parse(&txt) {
                            Some(ev) => publish_decoded(&self.bus, ev),
                            None => {
                                WS_DECODE_ERRORS.inc();
                                debug!(frame = %txt.chars().take(120).collect::<String>(),
                                       "drop undecodable frame");
                            }
                        }
                    }
                    Some(Ok(_)) => {
                        // ping/pong/binary diabaikan
                    }
                    Some(Err(e)) => {
                        error!(?e, "ws read error");
                        return;
                    }
                    None => {
                        info!("event stream closed by remote");
                        return;
                    }
                },
                Some(payload) = out_rx.recv() => {
                    if let Err(e) = ws.send(Message::Text(payload)).await {
                        error!(?e, "ws send error");
                        return;
                    }
                }
                _ = shutdown.changed() => {
                    let _ = ws.close(None).await;
                    return;
                }
            }
        }
    }
}

fn publish_decoded(bus: &EventBus, ev: RawEvent) {
    WS_MESSAGES.inc();
    EVENTS_BY_KIND.with_label_values(&[kind_label(ev.kind())]).inc();
    WS_LAST_EVENT_TS.set(Utc::now().timestamp());
    bus.publish(ev);
}

// Bounded label set; kind datang dari wire jadi jangan dipakai mentah
fn kind_label(kind: &str) -> &'static str {
    match kind {
        "order_event" => "order_event",
        "trade" => "trade",
        "fill" => "fill",
        "market" => "market",
        "bank" => "bank",
        "diag" => "diag",
        "stats" => "stats",
        "hello" => "hello",
        "status" => "status",
        _ => "other",
    }
}

/// Generator event sintetis: order lifecycle (NEW -> FILLED/CANCELED), trade
/// prints, dan noise diagnostik, lewat jalur publish yang sama dengan feed
/// live. ~5-12 events/s.
pub async fn run_mock(bus: EventBus) {
    let mut seq: u64 = 0;
    let mut px: f64 = 100.0;
    let mut open_ids: Vec<u64> = Vec::new();
    loop {
        // jangan simpan ThreadRng melewati .await
        let (frame, pause_ms) = {
            let mut rng = rand::thread_rng();
            px = (px + rng.gen_range(-0.5..=0.5)).max(50.0);
            let price = (px * 100.0).round() / 100.0;
            let ts = Utc::now().timestamp_millis();
            let roll = rng.gen_range(0u32..10);

            let frame = if roll < 4 || open_ids.is_empty() {
                seq += 1;
                open_ids.push(seq);
                json!({
                    "kind": "order_event",
                    "id": format!("ORD-{seq}"),
                    "side": if rng.gen_bool(0.5) { "BUY" } else { "SELL" },
                    "price": price,
                    "qty": rng.gen_range(1..=25),
                    "status": "NEW",
                    "ts": ts,
                })
            } else if roll < 7 {
                let i = rng.gen_range(0..open_ids.len());
                let id = open_ids.swap_remove(i);
                json!({
                    "kind": "order_event",
                    "id": format!("ORD-{id}"),
                    "evt": if rng.gen_bool(0.8) { "FILLED" } else { "CANCELED" },
                    "price": price,
                    "qty": rng.gen_range(1..=25),
                    "ts": ts,
                })
            } else if roll < 9 {
                seq += 1;
                json!({
                    "kind": "trade",
                    "id": format!("TRD-{seq}"),
                    "side": if rng.gen_bool(0.5) { "BUY" } else { "SELL" },
                    "price": price,
                    "qty": rng.gen_range(1..=25),
                    "pnl": (rng.gen_range(-500..=500) as f64) / 100.0,
                    "ts": ts,
                })
            } else {
                // diagnostik; reconciler mengabaikan kind ini
                json!({ "kind": "stats", "ws_rate": rng.gen_range(1..=50) })
            };
            (frame, rng.gen_range(80u64..=240))
        };

        if let Some(ev) = RawEvent::from_value(frame) {
            publish_decoded(&bus, ev);
        }
        sleep(Duration::from_millis(pause_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn test_cfg(url: String) -> StreamCfg {
        StreamCfg {
            ws_url: url,
            ws_token: None,
            backoff: BackoffCfg { floor_ms: 50, growth: 2.0, cap_ms: 200 },
            send_queue: 8,
        }
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<ConnState>,
        want: impl Fn(&ConnState) -> bool,
    ) {
        timeout(Duration::from_secs(3), async {
            loop {
                if want(&rx.borrow_and_update()) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .expect("expected state not reached in time");
    }

    #[test]
    fn bus_caches_most_recent_item_only() {
        let bus = EventBus::new(8);
        assert!(bus.subscribe().0.is_none());
        for i in 0..3 {
            let ev = RawEvent::from_value(json!({"kind": "trade", "id": i.to_string()})).unwrap();
            bus.publish(ev);
        }
        let (last, mut rx) = bus.subscribe();
        assert_eq!(last.unwrap().str_field(&["id"]), Some("2"));
        // no replay: subscriber baru tidak menerima backlog
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn delivers_decoded_frames_in_order_and_drops_malformed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let frames = [
                json!({"kind": "order_event", "id": "A", "side": "buy", "price": 100, "qty": 2})
                    .to_string(),
                "{not json".to_string(),
                json!({"kind": "trade", "id": "T1", "price": 100.5}).to_string(),
            ];
            for f in frames {
                ws.send(Message::Text(f)).await.unwrap();
            }
            // keep the socket open until the client has read everything
            sleep(Duration::from_millis(500)).await;
        });

        let bus = EventBus::new(64);
        let mut rx = bus.subscribe_rx();
        let mgr = StreamManager::new(test_cfg(format!("ws://{addr}")), bus.clone());
        mgr.connect();

        let mut st = mgr.state_rx();
        wait_for_state(&mut st, |s| *s == ConnState::Open).await;
        assert_eq!(mgr.send(r#"{"kind":"ping"}"#.to_string()), Ok(()));

        let ev1 = timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev1.kind(), "order_event");
        assert_eq!(ev1.str_field(&["id"]), Some("A"));
        // frame korup tidak pernah sampai ke bus; urutan tetap
        let ev2 = timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev2.kind(), "trade");

        // late joiner langsung dapat item terakhir
        let (cached, _rx2) = bus.subscribe();
        assert_eq!(cached.unwrap().kind(), "trade");

        mgr.close();
        server.abort();
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_send_reports_not_connected() {
        // endpoint tanpa listener -> connection refused
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let bus = EventBus::new(8);
        let mgr = StreamManager::new(test_cfg(format!("ws://{addr}")), bus);
        assert_eq!(mgr.state(), ConnState::Idle);
        assert_eq!(mgr.send("x".to_string()), Err(SendError::NotConnected));

        mgr.connect();
        mgr.connect(); // no-op

        let mut st = mgr.state_rx();
        wait_for_state(&mut st, |s| matches!(s, ConnState::Reconnecting { .. })).await;
        assert_eq!(mgr.send("x".to_string()), Err(SendError::NotConnected));
        mgr.close();
    }

    #[tokio::test]
    async fn close_during_backoff_cancels_the_pending_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let bus = EventBus::new(8);
        let cfg = StreamCfg {
            ws_url: format!("ws://{addr}"),
            ws_token: None,
            backoff: BackoffCfg { floor_ms: 800, growth: 2.0, cap_ms: 1_600 },
            send_queue: 8,
        };
        let mgr = StreamManager::new(cfg, bus);
        mgr.connect();

        let mut st = mgr.state_rx();
        wait_for_state(&mut st, |s| matches!(s, ConnState::Reconnecting { attempt: 1, .. }))
            .await;
        mgr.close();
        wait_for_state(&mut st, |s| *s == ConnState::Closing).await;

        // listener baru di port yang sama: kalau cancel gagal, retry pertama
        // (~800ms) akan tertangkap di window accept 2s ini
        let relisten = TcpListener::bind(addr).await.unwrap();
        let res = timeout(Duration::from_secs(2), relisten.accept()).await;
        assert!(res.is_err(), "no reconnect attempt may fire after close()");
        assert_eq!(mgr.state(), ConnState::Closing);
    }

    #[tokio::test]
    async fn successful_reconnect_resets_the_attempt_counter() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            for i in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                if i == 1 {
                    ws.send(Message::Text(json!({"kind": "trade", "id": "T"}).to_string()))
                        .await
                        .unwrap();
                }
                ws.close(None).await.ok();
                while let Some(Ok(_)) = ws.next().await {}
            }
        });

        let bus = EventBus::new(8);
        let mut rx = bus.subscribe_rx();
        let mgr = StreamManager::new(test_cfg(format!("ws://{addr}")), bus);
        mgr.connect();
        let mut st = mgr.state_rx();

        // drop #1: backoff mulai dari attempt=1, delay=floor
        wait_for_state(&mut st, |s| {
            matches!(s, ConnState::Reconnecting { attempt: 1, next_delay_ms: 50 })
        })
        .await;

        // session #2 sampai ke Open dan mengirim frame
        let ev = timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev.kind(), "trade");

        // drop #2: attempt kembali 1 dan delay kembali ke floor (bukan lanjut
        // dari schedule sebelumnya) -> sukses me-reset counter
        wait_for_state(&mut st, |s| {
            matches!(s, ConnState::Reconnecting { attempt: 1, next_delay_ms: 50 })
        })
        .await;

        mgr.close();
        server.abort();
    }
}
