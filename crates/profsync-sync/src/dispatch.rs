use std::time::{Duration, Instant};

use profsync_adapters::{EngageEntry, ProfilePlatform};
use profsync_core::PlannedUpdate;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub batch_size: usize,
    /// Pause after each full batch, keeping the update endpoint under its rate limit.
    pub pause: Duration,
    pub dry_run: bool,
    /// Entries of the first batch echoed to the log in dry-run mode.
    pub preview_entries: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            pause: Duration::from_millis(300),
            dry_run: false,
            preview_entries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub batch_no: usize,
    pub size: usize,
    pub delivered: bool,
    pub paused_after: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub total: usize,
    pub sent: usize,
    pub batches: Vec<BatchOutcome>,
}

impl DispatchReport {
    pub fn failed_batches(&self) -> usize {
        self.batches.iter().filter(|batch| !batch.delivered).count()
    }
}

/// Sends `updates` as profile batch updates, in input order.
///
/// A failed batch is logged and left out of `sent`; the remaining batches
/// still go out. Dry-run counts every batch as sent without calling the platform.
pub async fn dispatch_updates(
    platform: &dyn ProfilePlatform,
    write_token: &str,
    updates: &[PlannedUpdate],
    options: &DispatchOptions,
) -> DispatchReport {
    let batch_size = options.batch_size.max(1);
    let total = updates.len();
    let batch_count = total.div_ceil(batch_size);
    let started = Instant::now();
    let mut report = DispatchReport {
        total,
        ..Default::default()
    };

    for (index, slice) in updates.chunks(batch_size).enumerate() {
        let batch_no = index + 1;
        let entries: Vec<EngageEntry> = slice
            .iter()
            .map(|update| EngageEntry::for_update(write_token, update))
            .collect();

        if options.dry_run {
            if batch_no == 1 {
                let preview = &entries[..entries.len().min(options.preview_entries)];
                match serde_json::to_string_pretty(preview) {
                    Ok(json) => info!(size = slice.len(), "[dry run] profile batch preview:\n{json}"),
                    Err(err) => warn!(error = %err, "[dry run] could not render batch preview"),
                }
            }
            report.sent += slice.len();
            log_progress(batch_no, report.sent, total, started, true);
            report.batches.push(BatchOutcome {
                batch_no,
                size: slice.len(),
                delivered: true,
                paused_after: false,
                error: None,
            });
            continue;
        }

        let (delivered, error) = match platform.send_profile_batch(&entries).await {
            Ok(()) => {
                report.sent += slice.len();
                log_progress(batch_no, report.sent, total, started, false);
                (true, None)
            }
            Err(err) => {
                warn!(batch_no, size = slice.len(), error = %err, "profile batch failed");
                (false, Some(err.to_string()))
            }
        };

        let paused_after = slice.len() == batch_size && batch_no < batch_count;
        if paused_after {
            tokio::time::sleep(options.pause).await;
        }

        report.batches.push(BatchOutcome {
            batch_no,
            size: slice.len(),
            delivered,
            paused_after,
            error,
        });
    }

    report
}

fn log_progress(batch_no: usize, sent: usize, total: usize, started: Instant, dry_run: bool) {
    let pct = if total == 0 {
        100.0
    } else {
        sent as f64 / total as f64 * 100.0
    };
    info!(
        batch_no,
        sent,
        total,
        pct = %format!("{pct:.1}"),
        elapsed_secs = %format!("{:.1}", started.elapsed().as_secs_f64()),
        dry_run,
        "profile batch counted"
    );
}
