//! Splits one byte stream into independently consumed forks.
//!
//! A pump task reads the original stream while the forker is resumed and
//! hands every chunk to each attached fork. Forks buffer without bound, so a
//! slow fork never stalls its siblings. The original stream is dropped once,
//! when the last attached fork goes away or the forker is destroyed.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::ByteStream;
use crate::error::{MediaError, MediaResult};

type ChunkSender = mpsc::UnboundedSender<io::Result<Bytes>>;

/// Fan-out over a single byte stream.
///
/// Must be created inside a Tokio runtime.
pub struct StreamForker {
    shared: Arc<ForkerShared>,
}

struct ForkerShared {
    label: String,
    state: Mutex<ForkerState>,
    flowing: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

#[derive(Default)]
struct ForkerState {
    slots: Vec<Slot>,
    live: usize,
    started: bool,
    finished: bool,
    destroyed: bool,
}

struct Slot {
    attached: bool,
    tx: Option<ChunkSender>,
}

impl StreamForker {
    /// Take ownership of `source`. The forker starts paused.
    pub fn new(source: ByteStream, label: impl Into<String>) -> Self {
        let (flowing, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(ForkerShared {
            label: label.into(),
            state: Mutex::new(ForkerState::default()),
            flowing,
            shutdown,
        });

        tokio::spawn(pump(shared.clone(), source));

        Self { shared }
    }

    /// Create a new fork.
    ///
    /// A fork created after data started flowing only sees chunks from that
    /// point on and reports itself as partial.
    pub fn fork(&self) -> MediaResult<Fork> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.shared.state.lock();
        if state.destroyed {
            return Err(MediaError::ForkerDestroyed);
        }

        let id = state.slots.len();
        let partial = state.started;
        let tx = (!state.finished).then_some(tx);
        state.slots.push(Slot { attached: true, tx });
        state.live += 1;
        drop(state);

        if partial {
            debug!(forker = %self.shared.label, fork = id, "Fork created after data started flowing");
        }

        Ok(Fork {
            id,
            rx,
            shared: self.shared.clone(),
            partial,
            detached: false,
        })
    }

    /// Stop reading the original stream.
    pub fn pause(&self) {
        self.shared.flowing.send_replace(false);
    }

    /// Resume reading the original stream.
    pub fn resume(&self) {
        self.shared.flowing.send_replace(true);
    }

    /// Whether the original stream is being read.
    pub fn is_flowing(&self) -> bool {
        *self.shared.flowing.borrow()
    }

    /// Drop the original stream and end every fork.
    ///
    /// Returns `false` if the forker was already destroyed.
    pub fn destroy(&self) -> bool {
        self.shared.destroy()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.state.lock().destroyed
    }

    /// Number of forks still attached.
    pub fn live_forks(&self) -> usize {
        self.shared.state.lock().live
    }
}

impl Drop for StreamForker {
    fn drop(&mut self) {
        let idle = self.shared.state.lock().live == 0;
        if idle {
            self.shared.destroy();
        }
    }
}

impl std::fmt::Debug for StreamForker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("StreamForker")
            .field("label", &self.shared.label)
            .field("live", &state.live)
            .field("started", &state.started)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

impl ForkerShared {
    fn broadcast(&self, chunk: Bytes) {
        let mut state = self.state.lock();
        state.started = true;
        for tx in state.slots.iter().filter_map(|s| s.tx.as_ref()) {
            let _ = tx.send(Ok(chunk.clone()));
        }
    }

    fn fail(&self, err: io::Error) {
        let mut state = self.state.lock();
        state.finished = true;
        for slot in state.slots.iter_mut() {
            if let Some(tx) = slot.tx.take() {
                let _ = tx.send(Err(io::Error::new(err.kind(), err.to_string())));
            }
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        for slot in state.slots.iter_mut() {
            slot.tx = None;
        }
    }

    fn detach(&self, id: usize) {
        let last = {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.get_mut(id) else {
                return;
            };
            if !slot.attached {
                return;
            }
            slot.attached = false;
            slot.tx = None;
            state.live -= 1;
            state.live == 0
        };

        if last {
            debug!(forker = %self.label, "Last fork detached");
            self.destroy();
        }
    }

    fn destroy(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return false;
            }
            state.destroyed = true;
            for slot in state.slots.iter_mut() {
                slot.tx = None;
            }
        }

        self.shutdown.send_replace(true);
        true
    }
}

async fn pump(shared: Arc<ForkerShared>, mut source: ByteStream) {
    let mut flowing = shared.flowing.subscribe();
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        tokio::select! {
            biased;
            _ = wait_until(&mut shutdown, true) => break,
            resumed = wait_until(&mut flowing, true) => {
                if !resumed {
                    break;
                }
            }
        }

        let next = tokio::select! {
            biased;
            _ = wait_until(&mut shutdown, true) => break,
            next = source.next() => next,
        };

        match next {
            Some(Ok(chunk)) => shared.broadcast(chunk),
            Some(Err(err)) => {
                debug!(forker = %shared.label, error = %err, "Source stream failed");
                shared.fail(err);
                break;
            }
            None => {
                shared.finish();
                break;
            }
        }
    }

    drop(source);
    debug!(forker = %shared.label, "Source stream released");
}

async fn wait_until(rx: &mut watch::Receiver<bool>, wanted: bool) -> bool {
    rx.wait_for(|value| *value == wanted).await.is_ok()
}

/// One branch of a [`StreamForker`].
pub struct Fork {
    id: usize,
    rx: mpsc::UnboundedReceiver<io::Result<Bytes>>,
    shared: Arc<ForkerShared>,
    partial: bool,
    detached: bool,
}

impl Fork {
    /// Whether this fork missed data emitted before it was created.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Stop consuming. The original stream keeps feeding other forks.
    pub fn end(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.detached {
            self.detached = true;
            self.rx.close();
            self.shared.detach(self.id);
        }
    }
}

impl Stream for Fork {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(None) => {
                this.detach();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for Fork {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Fork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fork")
            .field("forker", &self.shared.label)
            .field("id", &self.id)
            .field("partial", &self.partial)
            .finish()
    }
}
