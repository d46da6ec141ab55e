// ===============================
// src/domain.rs
// ===============================
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }

impl Side {
    /// Defensive default: anything that is not literally SELL is BUY.
    pub fn from_raw(s: Option<&str>) -> Side {
        match s.map(|x| x.trim().to_ascii_uppercase()).as_deref() {
            Some("SELL") => Side::Sell,
            _ => Side::Buy,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self { Side::Buy => "BUY", Side::Sell => "SELL" }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord { pub id: String, pub side: Side, pub price: f64, pub qty: f64, pub status: String, pub ts: i64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord { pub id: String, pub side: Side, pub price: f64, pub qty: f64, pub pnl: f64, pub ts: i64 }

/// FILLED / CANCELED; setelah ini tidak ada update lagi untuk order id tsb.
pub fn is_terminal(status: &str) -> bool {
    matches!(status, "FILLED" | "CANCELED")
}

/// Connection lifecycle, published on a watch channel for the UI indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnState {
    Idle,
    Connecting,
    Open,
    Reconnecting { attempt: u32, next_delay_ms: u64 },
    Closing,
}

impl ConnState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnState::Idle => "idle",
            ConnState::Connecting => "connecting",
            ConnState::Open => "open",
            ConnState::Reconnecting { .. } => "reconnecting",
            ConnState::Closing => "closing",
        }
    }
}

/// Point-in-time copy of the derived views. Safe to hand out; no locks held.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub open_orders: Vec<OrderRecord>,
    pub trades: Vec<TradeRecord>,
}

/// One decoded transport frame. Opaque JSON object; producer versions are
/// inconsistent about field names, so all access goes through alias-tolerant
/// accessors and worst case is a zeroed/defaulted field.
#[derive(Debug, Clone)]
pub struct RawEvent(serde_json::Value);

impl RawEvent {
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(v) if v.is_object() => Some(RawEvent(v)),
            _ => None,
        }
    }

    pub fn from_value(v: serde_json::Value) -> Option<Self> {
        if v.is_object() { Some(RawEvent(v)) } else { None }
    }

    /// Discriminator; `type` diterima sebagai alias versi producer lama.
    pub fn kind(&self) -> &str {
        self.str_field(&["kind", "type"]).unwrap_or("")
    }

    pub fn str_field(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.0.get(*k).and_then(|v| v.as_str()))
    }

    /// Enumerated string field, upper-cased, with default when absent/empty.
    pub fn upper_field(&self, keys: &[&str], default: &str) -> String {
        self.str_field(keys)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(default)
            .to_ascii_uppercase()
    }

    /// Numeric coercion: missing / null / non-numeric -> 0. Numeric strings
    /// ("25.35") parse, karena beberapa producer mengirim angka sebagai string.
    pub fn num_field(&self, keys: &[&str]) -> f64 {
        for k in keys {
            if let Some(v) = self.0.get(*k) {
                if let Some(n) = v.as_f64() {
                    return n;
                }
                if let Some(s) = v.as_str() {
                    if let Ok(n) = s.trim().parse::<f64>() {
                        return n;
                    }
                }
            }
        }
        0.0
    }

    /// Event time in epoch ms; defaults to ingest time if absent.
    pub fn ts_field(&self, keys: &[&str]) -> i64 {
        for k in keys {
            if let Some(v) = self.0.get(*k) {
                if let Some(n) = v.as_i64() {
                    return n;
                }
                if let Some(n) = v.as_f64() {
                    return n as i64;
                }
                if let Some(s) = v.as_str() {
                    if let Ok(n) = s.trim().parse::<i64>() {
                        return n;
                    }
                }
            }
        }
        Utc::now().timestamp_millis()
    }

    pub fn value(&self) -> &serde_json::Value { &self.0 }
    pub fn into_value(self) -> serde_json::Value { self.0 }
}

/// Recorder payload (JSONL).
#[derive(Debug, Clone, Serialize)]
pub enum Event { Raw(serde_json::Value), Conn(ConnState), Note(String) }

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_json_is_rejected() {
        assert!(RawEvent::parse("{not json").is_none());
        assert!(RawEvent::parse("42").is_none()); // bukan object
        assert!(RawEvent::parse("[1,2]").is_none());
        assert!(RawEvent::parse(r#"{"kind":"trade"}"#).is_some());
    }

    #[test]
    fn kind_accepts_type_alias() {
        let ev = RawEvent::from_value(json!({"type": "order_event"})).unwrap();
        assert_eq!(ev.kind(), "order_event");
        let ev = RawEvent::from_value(json!({"kind": "trade", "type": "x"})).unwrap();
        assert_eq!(ev.kind(), "trade");
        let ev = RawEvent::from_value(json!({"id": "A"})).unwrap();
        assert_eq!(ev.kind(), "");
    }

    #[test]
    fn numeric_coercion_never_fails() {
        let ev = RawEvent::from_value(json!({
            "price": "100.5", "qty": null, "pnl": "oops", "ts": 1700000000123i64
        }))
        .unwrap();
        assert_eq!(ev.num_field(&["price", "p"]), 100.5);
        assert_eq!(ev.num_field(&["qty", "q"]), 0.0);
        assert_eq!(ev.num_field(&["pnl"]), 0.0);
        assert_eq!(ev.num_field(&["missing"]), 0.0);
        assert_eq!(ev.ts_field(&["ts", "time"]), 1_700_000_000_123);
    }

    #[test]
    fn ts_defaults_to_ingest_time() {
        let ev = RawEvent::from_value(json!({"kind": "trade"})).unwrap();
        assert!(ev.ts_field(&["ts"]) > 1_500_000_000_000);
    }

    #[test]
    fn side_defaults_to_buy() {
        assert_eq!(Side::from_raw(Some("sell")), Side::Sell);
        assert_eq!(Side::from_raw(Some("buy")), Side::Buy);
        assert_eq!(Side::from_raw(Some("???")), Side::Buy);
        assert_eq!(Side::from_raw(None), Side::Buy);
    }
}
