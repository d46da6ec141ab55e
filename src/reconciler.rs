// ===============================
// src/reconciler.rs
// ===============================
//
// Folds the unordered, at-least-once event feed into two bounded derived
// views:
// - open orders : satu entry per order id; hilang tepat saat status terminal
// - trades      : ring buffer most-recent-first, cap dari konfigurasi
//
// Semua display surface menjadi konsumen murni dari snapshot(); tidak ada
// lagi fold logic yang tersebar per widget.
//

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ahash::AHashMap as HashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::{is_terminal, OrderRecord, RawEvent, Side, Snapshot, TradeRecord};
use crate::metrics::{OPEN_ORDERS, TRADE_BUFFER_LEN};

struct Views {
    open: HashMap<String, OrderRecord>,
    trades: VecDeque<TradeRecord>,
}

/// Single owner of the derived state. Fold dieksekusi serial (mutex); pembaca
/// hanya pernah menerima copy, tidak pernah referensi ke storage internal.
pub struct Reconciler {
    views: Mutex<Views>,
    trade_cap: usize,
    changed_tx: broadcast::Sender<()>,
}

impl Reconciler {
    pub fn new(trade_cap: usize) -> Arc<Self> {
        let (changed_tx, _rx) = broadcast::channel(64);
        Arc::new(Self {
            views: Mutex::new(Views {
                open: HashMap::new(),
                trades: VecDeque::with_capacity(trade_cap),
            }),
            trade_cap,
            changed_tx,
        })
    }

    /// Bounded queue of "views changed" signals; dropping the receiver
    /// unsubscribes. Losing old signals under lag is harmless because
    /// snapshot() always returns current truth.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<()> {
        self.changed_tx.subscribe()
    }

    /// Internally-consistent copy at the instant of the call. Open orders
    /// diurutkan ts menurun; trades sudah most-recent-first.
    pub fn snapshot(&self) -> Snapshot {
        let v = self.views.lock().unwrap();
        let mut open_orders: Vec<OrderRecord> = v.open.values().cloned().collect();
        open_orders.sort_by(|a, b| b.ts.cmp(&a.ts));
        Snapshot { open_orders, trades: v.trades.iter().cloned().collect() }
    }

    /// Classify + fold one event. Input yang aneh di-default, tidak pernah
    /// ditolak dan tidak pernah dianggap error.
    pub fn fold(&self, ev: &RawEvent) {
        match ev.kind() {
            "order_event" => self.fold_order(ev),
            "trade" => self.fold_trade(ev),
            other => {
                // diag/stats/market dsb: konsumen lain yang peduli
                debug!(kind = other, "event not folded");
                return;
            }
        }
        let _ = self.changed_tx.send(());
    }

    fn fold_order(&self, ev: &RawEvent) {
        let rec = OrderRecord {
            id: ev.str_field(&["id"]).unwrap_or_default().to_string(),
            side: Side::from_raw(ev.str_field(&["side"])),
            price: ev.num_field(&["price", "p"]),
            qty: ev.num_field(&["qty", "quantity", "q"]),
            // kebijakan: field event-type (evt) lebih spesifik, menang atas status
            status: ev.upper_field(&["evt", "status"], "NEW"),
            ts: ev.ts_field(&["ts", "time", "T"]),
        };

        let mut v = self.views.lock().unwrap();
        if rec.status == "NEW" {
            v.open.insert(rec.id.clone(), rec);
        } else {
            let terminal = is_terminal(&rec.status);
            // overwrite dulu dengan atribut terbaru, baru remove kalau terminal
            if v.open.contains_key(&rec.id) {
                v.open.insert(rec.id.clone(), rec.clone());
            }
            if terminal {
                v.open.remove(&rec.id);
            }
        }
        OPEN_ORDERS.set(v.open.len() as i64);
    }

    fn fold_trade(&self, ev: &RawEvent) {
        let tr = TradeRecord {
            // id boleh kosong; duplikat dari feed at-least-once diterima
            id: ev.str_field(&["id"]).unwrap_or_default().to_string(),
            side: Side::from_raw(ev.str_field(&["side"])),
            price: ev.num_field(&["price", "p"]),
            qty: ev.num_field(&["qty", "quantity", "q"]),
            pnl: ev.num_field(&["pnl", "realizedPnl"]),
            ts: ev.ts_field(&["ts", "time", "T"]),
        };

        let mut v = self.views.lock().unwrap();
        v.trades.push_front(tr);
        v.trades.truncate(self.trade_cap);
        TRADE_BUFFER_LEN.set(v.trades.len() as i64);
    }
}

/// Reconciler task: satu-satunya writer view. Subscribe sebelum feed mulai
/// supaya tidak ada event awal yang lolos.
pub async fn run(rec: Arc<Reconciler>, mut rx: broadcast::Receiver<RawEvent>) {
    loop {
        match rx.recv().await {
            Ok(ev) => rec.fold(&ev),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "reconciler lagged behind the feed");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
