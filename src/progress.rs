//! Progress bars for fetch runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use netjob_core::network::NetworkJob;

const REFRESH: Duration = Duration::from_millis(120);

/// Spawns one bar per job, refreshed from `NetworkJob::status`.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `use_bars` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    use_bars: bool,
    jobs: Vec<Arc<NetworkJob>>,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !use_bars {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_bars_inner(jobs, Arc::clone(&stop));
    (Some(handle), stop)
}

fn spawn_bars_inner(
    jobs: Vec<Arc<NetworkJob>>,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let multi = MultiProgress::new();
        let style = ProgressStyle::with_template(
            "{spinner} {prefix:30!} [{bar:25}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");

        let bars: Vec<(Arc<NetworkJob>, ProgressBar)> = jobs
            .into_iter()
            .map(|job| {
                let bar = multi.add(ProgressBar::new(0));
                bar.set_style(style.clone());
                bar.set_prefix(job.url().path().to_string());
                (job, bar)
            })
            .collect();

        loop {
            let stopping = stop.load(Ordering::SeqCst);
            for (job, bar) in &bars {
                if bar.is_finished() {
                    continue;
                }
                let status = job.status();
                if let Some(total) = status.bytes_expected {
                    bar.set_length(total);
                }
                bar.set_position(status.bytes_read);
                bar.set_message(status.text);
                if job.is_done() {
                    bar.finish();
                }
            }
            if stopping {
                break;
            }
            tokio::time::sleep(REFRESH).await;
        }

        for (_, bar) in &bars {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    })
}
