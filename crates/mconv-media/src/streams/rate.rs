//! Frame-rate limited re-emission.

use futures::{stream, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Rate used when none is given.
pub const DEFAULT_FPS: u32 = 4;

/// Re-emit items from `source` at most `fps` times per second.
///
/// Up to `fps` items are read ahead; beyond that the source is
/// backpressured. Must be called inside a Tokio runtime.
pub fn rate_limited<S>(source: S, fps: u32) -> impl Stream<Item = S::Item> + Send + 'static
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    let fps = if fps == 0 { DEFAULT_FPS } else { fps };
    let (tx, rx) = mpsc::channel(fps as usize);

    tokio::spawn(async move {
        let mut source = Box::pin(source);
        while let Some(item) = source.next().await {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    let period = Duration::from_secs_f64(1.0 / f64::from(fps));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    stream::unfold((rx, ticker), |(mut rx, mut ticker)| async move {
        ticker.tick().await;
        let item = rx.recv().await?;
        Some((item, (rx, ticker)))
    })
}
