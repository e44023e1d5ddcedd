//! Conversion lifecycle events and phases.

use std::sync::Arc;

use mconv_models::ProbeResult;
use tokio::sync::broadcast;

use crate::error::MediaError;
use crate::progress::FfmpegProgress;

/// Where a conversion is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversionPhase {
    /// Endpoints are being configured
    #[default]
    Idle,
    /// Input sources and output directories are being resolved
    Preparing,
    /// Endpoint arguments are being collected, probes included
    Assembling,
    PipeAllocation,
    /// The transcoder is running and its streams are wired
    Running,
    Ended,
}

impl ConversionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended)
    }
}

/// Observable events of a conversion.
#[derive(Debug, Clone)]
pub enum ConversionEvent {
    /// The final transcoder command line
    Arguments(Vec<String>),
    /// The transcoder was spawned
    Start { pid: Option<u32> },
    Progress(FfmpegProgress),
    /// First video stream description reported by the transcoder
    InputCodec(String),
    /// An input's probe finished
    Probed { input: usize, result: Arc<ProbeResult> },
    /// A non-fatal diagnostic line
    ConversionError(String),
    Error(MediaError),
    /// Emitted exactly once, with the terminal error if there was one
    End(Option<MediaError>),
}

/// Fan-out of [`ConversionEvent`]s to every subscriber.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ConversionEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send to current subscribers. Nobody listening is fine.
    pub fn emit(&self, event: ConversionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversionEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let sink = EventSink::new(8);
        sink.emit(ConversionEvent::InputCodec("ignored".into()));

        let mut rx = sink.subscribe();
        sink.emit(ConversionEvent::Start { pid: Some(42) });

        assert!(matches!(rx.recv().await, Ok(ConversionEvent::Start { pid: Some(42) })));
    }

    #[test]
    fn test_phase_default() {
        assert_eq!(ConversionPhase::default(), ConversionPhase::Idle);
        assert!(ConversionPhase::Ended.is_terminal());
        assert!(!ConversionPhase::Running.is_terminal());
    }
}
