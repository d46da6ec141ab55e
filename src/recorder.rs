// ===============================
// src/recorder.rs
// ===============================
//
// JSONL capture dari feed live: satu baris per Event (frame mentah, transisi
// koneksi, catatan). Aktif kalau RECORD_FILE / --record-file di-set.
// Tahan banting: buffer + flush periodik, reopen sekali kalau tulis gagal.
//

use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 256;
const FLUSH_INTERVAL_MS: u64 = 500;

async fn open_writer(path: &str) -> Option<BufWriter<tokio::fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(f) => Some(BufWriter::new(f)),
        Err(e) => {
            error!(?e, %path, "recorder: open failed, recording disabled");
            None
        }
    }
}

async fn write_line(w: &mut BufWriter<tokio::fs::File>, line: &str) -> std::io::Result<()> {
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let Some(mut writer) = open_writer(&path).await else { return };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_millis(FLUSH_INTERVAL_MS));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    // channel ditutup: flush lalu berhenti
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    return;
                };
                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, reopening");
                    match open_writer(&path).await {
                        Some(w) => writer = w,
                        None => return,
                    }
                    if let Err(e2) = write_line(&mut writer, &line).await {
                        error!(?e2, "recorder: write failed after reopen, drop event");
                        continue;
                    }
                }
                since_flush += 1;
                if since_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_flush = 0;
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_flush = 0;
            }
        }
    }
}
