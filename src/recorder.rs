// ===============================
// src/recorder.rs
// ===============================
//
// JSONL recorder untuk outcome per instrumen + ringkasan run:
// - Satu Event per baris, append ke RECORD_FILE.
// - BufWriter, flush tiap 1s dan saat channel ditutup.
// - Parent directory dibuat otomatis.
// - Gagal buka / tulis hanya di-log; batch tidak pernah berhenti karena recorder.
//
use std::path::Path;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::Event;

async fn open_writer(path: &str) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(%path, error = %e, "recorder: open failed, events will be dropped");
            // tetap drain supaya sender tidak pernah tertahan
            while rx.recv().await.is_some() {}
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut written: u64 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!(written, "recorder: channel closed, stopped");
                    break;
                };
                let mut line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!(error = %e, "recorder: write failed, reopening");
                    match open_writer(&path).await {
                        Ok(w) => {
                            writer = w;
                            if writer.write_all(line.as_bytes()).await.is_err() {
                                error!("recorder: write failed again after reopen, drop event");
                                continue;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "recorder: reopen failed, drop event");
                            continue;
                        }
                    }
                }
                written += 1;
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
            }
        }
    }
}
