//! ACP writer task.
//!
//! Receives outbound lines from an unbounded tokio [`mpsc`] channel and writes each one
//! as an NDJSON line through a [`FramedWrite`] over [`AcpCodec`].
//!
//! Lines are written verbatim: the bridge relays client text unchanged and
//! the state machines pre-serialise their envelopes with
//! [`Envelope::to_line`](crate::acp::envelope::Envelope::to_line).

use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::AcpCodec;
use crate::{AppError, Result};

/// ACP writer task — writes each received line to `sink` followed by `\n`.
///
/// The task exits cleanly when:
/// - `cancel` is triggered (graceful shutdown), or
/// - `line_rx` is closed (all senders dropped).
///
/// The channel is unbounded so that synchronous producers (permission
/// continuations, the bridge relay) never block; the pipe itself provides
/// the only backpressure.
///
/// Embedded newlines are stripped from each line so that one logical
/// message can never be split into two frames on the far side.
///
/// # Errors
///
/// - [`AppError::TransportClosed`]`("write failed: …")` if the write fails
///   (e.g. the agent process has exited).
pub async fn run_writer<W>(
    label: String,
    sink: W,
    mut line_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut framed = FramedWrite::new(sink, AcpCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(label, "acp writer: cancellation received, stopping");
                break;
            }

            line = line_rx.recv() => {
                let Some(line) = line else {
                    debug!(label, "acp writer: line channel closed, stopping");
                    break;
                };

                let line = if line.contains('\n') {
                    line.replace(['\r', '\n'], "")
                } else {
                    line
                };

                framed.send(line).await.map_err(|err| {
                    warn!(label, error = %err, "acp writer: write failed");
                    AppError::TransportClosed(format!("write failed: {err}"))
                })?;
            }
        }
    }

    Ok(())
}
