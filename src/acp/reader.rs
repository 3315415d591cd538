//! ACP reader task.
//!
//! Reads newline-delimited JSON messages from a byte stream (agent stdout,
//! agent stdin on the agent side, or an in-memory duplex in tests) and
//! forwards each decoded [`Frame`] through a tokio [`mpsc`] channel.
//!
//! The reader is driven by [`FramedRead`] backed by [`AcpCodec`], which
//! enforces the 1 MiB per-line limit before any heap allocation for JSON
//! parsing and drops lines that are not protocol envelopes.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::{AcpCodec, Frame};

/// How a reader task finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The stream reached EOF.
    Eof,
    /// The underlying stream failed.
    Error(String),
    /// The cancellation token fired.
    Cancelled,
    /// The frame receiver was dropped.
    ReceiverClosed,
}

impl StreamEnd {
    /// Human-readable reason used in close frames and logs.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::Eof => "stream closed".to_owned(),
            Self::Error(err) => format!("stream error: {err}"),
            Self::Cancelled => "cancelled".to_owned(),
            Self::ReceiverClosed => "receiver closed".to_owned(),
        }
    }
}

/// ACP reader task — reads NDJSON lines from `stream` and emits [`Frame`]s.
///
/// Malformed, blank and oversized lines are logged and skipped by the codec;
/// they do **not** terminate the reader task.
///
/// # Cancellation
///
/// Respects `cancel`: when the token fires the reader exits with
/// [`StreamEnd::Cancelled`].
pub async fn run_reader<R>(
    label: String,
    stream: R,
    frame_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) -> StreamEnd
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stream, AcpCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(label, "acp reader: cancellation received, stopping");
                return StreamEnd::Cancelled;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(label, "acp reader: EOF detected");
                        return StreamEnd::Eof;
                    }

                    Some(Err(err)) => {
                        warn!(label, error = %err, "acp reader: IO error, stopping");
                        return StreamEnd::Error(err.to_string());
                    }

                    Some(Ok(frame)) => {
                        if frame_tx.send(frame).await.is_err() {
                            debug!(label, "acp reader: frame_tx closed, stopping");
                            return StreamEnd::ReceiverClosed;
                        }
                    }
                }
            }
        }
    }
}
