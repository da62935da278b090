//! Response body streaming: byte counting, optional pacing, and a
//! completion hook for the log phase.
//!
//! Upstream bodies are never buffered (login captures excepted, handled in
//! the proxy); they flow through a metered stream that counts bytes for
//! quota accounting, paces chunks when a throttle was stashed on the
//! request, and fires its completion callback exactly once — whether the
//! stream finished, errored, or the client went away.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

/// Bytes-per-second pacing with a one-second burst allowance.
pub struct Pacer {
    rate_bps: u64,
    state: Mutex<PacerState>,
}

struct PacerState {
    budget: f64,
    last_refill: Instant,
}

impl Pacer {
    #[must_use]
    pub fn new(rate_bps: u64) -> Self {
        Self {
            rate_bps: rate_bps.max(1),
            state: Mutex::new(PacerState { budget: rate_bps as f64, last_refill: Instant::now() }),
        }
    }

    /// Waits until `n` bytes fit within the configured rate.
    pub async fn pace(&self, n: u64) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let rate = self.rate_bps as f64;

        let refill = now.saturating_duration_since(state.last_refill).as_secs_f64() * rate;
        state.budget = (state.budget + refill).min(rate);
        state.last_refill = now;

        let n = n as f64;
        if n <= state.budget {
            state.budget -= n;
            return;
        }

        // The deficit is paid for with the bandwidth of the sleep window, so
        // the refill clock advances to the end of that window.
        let wait = Duration::from_secs_f64((n - state.budget) / rate);
        state.budget = 0.0;
        state.last_refill = now + wait;
        drop(state);
        tokio::time::sleep(wait).await;
    }
}

/// Fires its callback with the final byte count when dropped.
struct CompletionGuard {
    bytes: Arc<AtomicU64>,
    callback: Option<Box<dyn FnOnce(u64) + Send + Sync>>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(self.bytes.load(Ordering::Relaxed));
        }
    }
}

/// Wraps an upstream byte stream with counting, optional pacing, and a
/// completion callback.
///
/// The callback runs when the returned stream is dropped: normal
/// completion, upstream error and client disconnect all count the bytes
/// actually sent.
pub fn metered_stream<S, E>(
    upstream: S,
    throttle_rate_bps: Option<u64>,
    on_complete: impl FnOnce(u64) + Send + Sync + 'static,
) -> impl Stream<Item = Result<Bytes, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    let bytes = Arc::new(AtomicU64::new(0));
    let pacer = throttle_rate_bps.map(|bps| Arc::new(Pacer::new(bps)));
    let guard = Arc::new(CompletionGuard {
        bytes: bytes.clone(),
        callback: Some(Box::new(on_complete)),
    });

    upstream.then(move |chunk| {
        let bytes = bytes.clone();
        let pacer = pacer.clone();
        let _guard = guard.clone();
        async move {
            if let Ok(data) = &chunk {
                bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                if let Some(pacer) = &pacer {
                    pacer.pace(data.len() as u64).await;
                }
            }
            chunk
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::atomic::AtomicBool;

    fn chunks(sizes: &[usize]) -> Vec<Result<Bytes, std::io::Error>> {
        sizes.iter().map(|n| Ok(Bytes::from(vec![0u8; *n]))).collect()
    }

    #[tokio::test]
    async fn test_counts_bytes_and_completes_once() {
        let recorded = Arc::new(AtomicU64::new(u64::MAX));
        let recorded_clone = recorded.clone();

        let stream = metered_stream(stream::iter(chunks(&[100, 250, 50])), None, move |total| {
            recorded_clone.store(total, Ordering::SeqCst);
        });
        let collected: Vec<_> = stream.collect().await;

        assert_eq!(collected.len(), 3);
        assert_eq!(recorded.load(Ordering::SeqCst), 400);
    }

    #[tokio::test]
    async fn test_completion_fires_on_early_drop() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let mut stream = Box::pin(metered_stream(
            stream::iter(chunks(&[10, 10, 10])),
            None,
            move |total| {
                assert_eq!(total, 10);
                fired_clone.store(true, Ordering::SeqCst);
            },
        ));

        let first = stream.next().await;
        assert!(first.is_some());
        drop(stream);

        assert!(fired.load(Ordering::SeqCst), "callback must fire when the client goes away");
    }

    #[tokio::test]
    async fn test_errors_pass_through_without_counting() {
        let recorded = Arc::new(AtomicU64::new(0));
        let recorded_clone = recorded.clone();

        let items: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"abcd")),
            Err(std::io::Error::other("upstream reset")),
        ];
        let collected: Vec<_> = metered_stream(stream::iter(items), None, move |total| {
            recorded_clone.store(total, Ordering::SeqCst);
        })
        .collect()
        .await;

        assert!(collected[0].is_ok());
        assert!(collected[1].is_err());
        assert_eq!(recorded.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_pacer_allows_burst_then_delays() {
        let pacer = Pacer::new(1000);

        // Within the one-second burst: effectively immediate.
        let start = Instant::now();
        pacer.pace(1000).await;
        assert!(start.elapsed() < Duration::from_millis(50));

        // Budget exhausted: the next 500 bytes cost ~500ms.
        let start = Instant::now();
        pacer.pace(500).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "paced too fast: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_throttled_stream_is_paced() {
        let start = Instant::now();
        let collected: Vec<Result<Bytes, std::io::Error>> =
            metered_stream(stream::iter(chunks(&[1000, 1000])), Some(2000), |_| {})
                .collect()
                .await;
        assert_eq!(collected.len(), 2);
        // 2000 bytes at 2000 B/s with a 2000-byte burst: no meaningful delay.
        assert!(start.elapsed() < Duration::from_millis(200));

        let start = Instant::now();
        let collected: Vec<Result<Bytes, std::io::Error>> =
            metered_stream(stream::iter(chunks(&[1000, 1000, 1000])), Some(1000), |_| {})
                .collect()
                .await;
        assert_eq!(collected.len(), 3);
        // 3000 bytes at 1000 B/s with a 1000-byte burst: ~2s of pacing.
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }
}
