//! UI utilities for Ferry CLI.

use std::io::{self, Write};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use ferry_core::client::{ClientState, UploadProgress};
use ferry_core::file::format_size;

/// Parse a duration string like "30s", "5m", "1h" or "7d".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (unit_start, _) = s.char_indices().last()?;
    let (num_str, unit) = s.split_at(unit_start);
    let num: u64 = num_str.parse().ok()?;
    let secs = match unit {
        "s" => num,
        "m" => num.checked_mul(60)?,
        "h" => num.checked_mul(3600)?,
        "d" => num.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Format a duration as "H:MM:SS", or "M:SS" under an hour.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, mins, secs)
    } else {
        format!("{}:{:02}", mins, secs)
    }
}

/// Average transfer rate, e.g. "12.50 MB/s".
pub fn format_rate(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        return "--".to_string();
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let per_sec = (bytes as f64 / secs) as u64;
    format!("{}/s", format_size(per_sec))
}

/// Render upload progress on one line until `done` fires.
pub async fn display_progress(mut rx: watch::Receiver<UploadProgress>, done: CancellationToken) {
    let mut last_state = ClientState::Idle;

    loop {
        tokio::select! {
            () = done.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let progress = rx.borrow_and_update().clone();

        if progress.state != last_state {
            last_state = progress.state;
            match progress.state {
                ClientState::Connecting => println!("  Connecting..."),
                ClientState::AwaitingAck => println!("  Waiting for the receiver to accept..."),
                ClientState::AwaitingFinal => {
                    println!();
                    println!("  Waiting for the receiver to verify...");
                }
                ClientState::Idle
                | ClientState::Sending
                | ClientState::Done
                | ClientState::Failed => {}
            }
        }

        if progress.state == ClientState::Sending {
            let elapsed = progress.started_at.elapsed();
            let chunks = if progress.chunk_count > 0 {
                format!(" - chunk {}/{}", progress.chunks_done, progress.chunk_count)
            } else {
                String::new()
            };
            print!(
                "\r  [{:>6.2}%] {} / {}{} - {}    ",
                progress.percentage(),
                format_size(progress.bytes_done),
                format_size(progress.total_bytes),
                chunks,
                format_rate(progress.bytes_done, elapsed)
            );
            let _ = io::stdout().flush();
        }
    }
}
