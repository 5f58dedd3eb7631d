//! Relays a progress stream onto a message transport
//!
//! Progress messages become text frames. The terminal event becomes a close
//! frame whose code tells the caller how the operation ended; a failure is
//! also sent in full as a text frame first, since close reasons are short.

use crate::error::CloseCode;
use crate::progress::{ProgressEvent, ProgressStream};
use futures_util::{Sink, SinkExt};

/// Longest close reason a WebSocket close frame can carry, in bytes
pub const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: u16, reason: String },
}

fn close_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

/// Forward every event of `stream` to `sink` and return how the stream ended.
///
/// Fails only when the sink does; the operation behind the stream keeps
/// running either way.
pub async fn relay<S>(mut stream: ProgressStream, sink: &mut S) -> Result<CloseCode, S::Error>
where
    S: Sink<Frame> + Unpin,
{
    while let Some(event) = stream.next().await {
        match event {
            ProgressEvent::Progress(message) => sink.send(Frame::Text(message)).await?,
            ProgressEvent::Done => {
                let code = CloseCode::Normal;
                sink.send(Frame::Close {
                    code: code.code(),
                    reason: String::new(),
                })
                .await?;
                return Ok(code);
            }
            ProgressEvent::Failure(err) => {
                let code = err.close_code();
                let message = err.to_string();
                sink.send(Frame::Text(format!("error: {}", message))).await?;
                sink.send(Frame::Close {
                    code: code.code(),
                    reason: close_reason(message),
                })
                .await?;
                return Ok(code);
            }
        }
    }

    // A stream always yields a terminal event before it ends
    Ok(CloseCode::InternalError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlPlaneError;
    use crate::progress::{DEFAULT_CAPACITY, channel};

    #[tokio::test]
    async fn test_success_closes_normally() {
        let (tx, stream) = channel(DEFAULT_CAPACITY);
        tx.send("Created VPC vpc-1").await;
        tx.finish().await;

        let mut frames: Vec<Frame> = Vec::new();
        let code = relay(stream, &mut frames).await.unwrap();

        assert_eq!(code, CloseCode::Normal);
        assert_eq!(
            frames,
            vec![
                Frame::Text("Created VPC vpc-1".to_string()),
                Frame::Close {
                    code: 1000,
                    reason: String::new()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_conflict_is_policy_violation() {
        let (tx, stream) = channel(DEFAULT_CAPACITY);
        tx.fail(ControlPlaneError::Conflict("environment qa already exists".into()))
            .await;

        let mut frames: Vec<Frame> = Vec::new();
        let code = relay(stream, &mut frames).await.unwrap();

        assert_eq!(code, CloseCode::PolicyViolation);
        assert_eq!(
            frames,
            vec![
                Frame::Text("error: conflict: environment qa already exists".to_string()),
                Frame::Close {
                    code: 1008,
                    reason: "conflict: environment qa already exists".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_aborted_producer_is_internal_error() {
        let (tx, stream) = channel(DEFAULT_CAPACITY);
        drop(tx);

        let mut frames: Vec<Frame> = Vec::new();
        assert_eq!(
            relay(stream, &mut frames).await.unwrap(),
            CloseCode::InternalError
        );
        assert!(matches!(frames.last(), Some(Frame::Close { code: 1011, .. })));
    }

    #[test]
    fn test_close_reason_is_truncated_on_char_boundary() {
        let reason = close_reason("é".repeat(100));
        assert!(reason.len() <= MAX_CLOSE_REASON);
        assert_eq!(reason.chars().count(), 61);

        assert_eq!(close_reason("short".to_string()), "short");
    }
}
