//! Progress event stream
//!
//! One producer (the workflow task) and one consumer (the transport). The
//! stream is ordered and always finite: it ends with exactly one terminal
//! event, [`ProgressEvent::Done`] or [`ProgressEvent::Failure`]. If the
//! producer disappears without one, the consumer sees
//! [`ControlPlaneError::Aborted`] instead of hanging.

use crate::error::{ControlPlaneError, Result};
use tokio::sync::mpsc;

/// Events buffered before the producer waits for the consumer
pub const DEFAULT_CAPACITY: usize = 16;

#[derive(Debug)]
pub enum ProgressEvent {
    /// Human-readable progress message
    Progress(String),
    /// Terminal failure
    Failure(ControlPlaneError),
    /// Terminal success
    Done,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Progress(_))
    }
}

/// Create a connected sender/stream pair
pub fn channel(capacity: usize) -> (ProgressSender, ProgressStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ProgressSender { tx },
        ProgressStream {
            rx,
            finished: false,
        },
    )
}

/// Producing half. The terminal methods consume it, so a workflow can end
/// its stream only once.
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSender {
    /// Emit a progress message, waiting while the buffer is full
    pub async fn send(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(progress = %message);
        if self.tx.send(ProgressEvent::Progress(message)).await.is_err() {
            tracing::debug!("Progress consumer is gone, continuing without it");
        }
    }

    pub async fn finish(self) {
        let _ = self.tx.send(ProgressEvent::Done).await;
    }

    pub async fn fail(self, err: ControlPlaneError) {
        tracing::error!(error = %err, "Operation failed");
        let _ = self.tx.send(ProgressEvent::Failure(err)).await;
    }

    /// End the stream with the outcome of a workflow
    pub async fn complete(self, result: Result<()>) {
        match result {
            Ok(()) => self.finish().await,
            Err(err) => self.fail(err).await,
        }
    }
}

/// Consuming half
pub struct ProgressStream {
    rx: mpsc::Receiver<ProgressEvent>,
    finished: bool,
}

impl ProgressStream {
    /// Next event in production order; `None` once a terminal event was returned
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }

        match self.rx.recv().await {
            Some(event) => {
                if event.is_terminal() {
                    self.finished = true;
                    self.rx.close();
                }
                Some(event)
            }
            None => {
                self.finished = true;
                Some(ProgressEvent::Failure(ControlPlaneError::Aborted))
            }
        }
    }

    /// Drain the stream
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (tx, stream) = channel(2);
        tokio::spawn(async move {
            for i in 0..10 {
                tx.send(format!("step {}", i)).await;
            }
            tx.finish().await;
        });

        let events = stream.collect().await;
        assert_eq!(events.len(), 11);
        for (i, event) in events[..10].iter().enumerate() {
            assert!(matches!(event, ProgressEvent::Progress(m) if *m == format!("step {}", i)));
        }
        assert!(matches!(events[10], ProgressEvent::Done));
    }

    #[tokio::test]
    async fn test_failure_is_last_event() {
        let (tx, mut stream) = channel(DEFAULT_CAPACITY);
        tx.send("working").await;
        tx.fail(ControlPlaneError::Conflict("taken".into())).await;

        assert!(matches!(stream.next().await, Some(ProgressEvent::Progress(_))));
        assert!(matches!(
            stream.next().await,
            Some(ProgressEvent::Failure(ControlPlaneError::Conflict(_)))
        ));
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_producer_aborts() {
        let (tx, stream) = channel(DEFAULT_CAPACITY);
        tx.send("half way").await;
        drop(tx);

        let events = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            ProgressEvent::Failure(ControlPlaneError::Aborted)
        ));
    }

    #[tokio::test]
    async fn test_send_without_consumer_does_not_block() {
        let (tx, stream) = channel(1);
        drop(stream);
        tx.send("one").await;
        tx.send("two").await;
        tx.finish().await;
    }
}
