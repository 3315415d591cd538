//! NDJSON frame codec for ACP streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a configurable maximum line
//! length to prevent memory exhaustion caused by unterminated or maliciously
//! large messages from a misbehaving agent process.
//!
//! # Usage
//!
//! Use [`AcpCodec`] as the codec parameter for
//! [`tokio_util::codec::FramedRead`] (inbound) and
//! [`tokio_util::codec::FramedWrite`] (outbound).  Both directions use
//! UTF-8 line framing delimited by `\n`.
//!
//! The decoder yields one [`Frame`] per line that parses as an
//! [`Envelope`]. Blank lines, invalid UTF-8, lines that are not envelopes
//! and oversized lines are dropped with a diagnostic log entry and never surface as
//! stream errors: agents routinely print banners and warnings on stdout.

use std::io::ErrorKind;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::acp::envelope::Envelope;
use crate::{AppError, Result};

/// Maximum line length accepted by the ACP codec: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded line: the verbatim text and its parsed envelope.
///
/// The bridge relays [`Frame::line`] untouched; state machines consume
/// [`Frame::envelope`].
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Line content without the trailing newline.
    pub line: String,
    /// The parsed envelope.
    pub envelope: Envelope,
}

impl Frame {
    /// Parse a single line into a frame.
    ///
    /// Returns `None` for blank lines and for anything that is not a valid
    /// envelope; the reason is logged at `DEBUG`.
    #[must_use]
    pub fn from_line(line: String) -> Option<Self> {
        if line.trim().is_empty() {
            return None;
        }
        match Envelope::parse(&line) {
            Ok(envelope) => Some(Self { line, envelope }),
            Err(err) => {
                debug!(error = %err, raw_line = %line, "acp codec: dropping non-protocol line");
                None
            }
        }
    }
}

/// NDJSON codec for bidirectional ACP streams.
///
/// # Decoder
///
/// Yields [`Frame`]s. Lines longer than [`MAX_LINE_BYTES`] are discarded up
/// to the next newline and logged at `WARN`. I/O errors are mapped to
/// [`AppError::Io`].
///
/// # Encoder
///
/// Outbound strings are encoded as `item\n`.  The max-length limit is a
/// decoder-side concern and is not enforced during encoding.
///
/// # Examples
///
/// ```rust,ignore
/// use tokio_util::codec::FramedRead;
/// use uplink::acp::codec::AcpCodec;
///
/// let reader = FramedRead::new(child_stdout, AcpCodec::new());
/// ```
#[derive(Debug)]
pub struct AcpCodec {
    lines: LinesCodec,
}

impl AcpCodec {
    /// Create a new `AcpCodec` with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn next_frame(&mut self, src: &mut BytesMut, eof: bool) -> Result<Option<Frame>> {
        loop {
            let decoded = if eof {
                self.lines.decode_eof(src)
            } else {
                self.lines.decode(src)
            };

            match decoded {
                Ok(Some(line)) => {
                    if let Some(frame) = Frame::from_line(line) {
                        return Ok(Some(frame));
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(
                        limit = self.lines.max_length(),
                        "acp codec: line too long, discarding"
                    );
                }
                Err(LinesCodecError::Io(err)) if err.kind() == ErrorKind::InvalidData => {
                    // The offending line is already consumed.
                    warn!(error = %err, "acp codec: line is not valid UTF-8, discarding");
                }
                Err(LinesCodecError::Io(err)) => return Err(AppError::Io(err.to_string())),
            }
        }
    }
}

impl Default for AcpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AcpCodec {
    type Item = Frame;
    type Error = AppError;

    /// Decode the next valid frame from `src`.
    ///
    /// Returns `Ok(None)` when `src` holds no further complete line.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.next_frame(src, false)
    }

    /// Decode the final frame when the stream reaches EOF.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.next_frame(src, true)
    }
}

impl Encoder<String> for AcpCodec {
    type Error = AppError;

    /// Encode `item` as a `\n`-terminated NDJSON line into `dst`.
    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.lines.encode(item, dst).map_err(|err| match err {
            LinesCodecError::MaxLineLengthExceeded => AppError::Io("line too long".into()),
            LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
        })
    }
}
