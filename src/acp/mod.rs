//! Agent Client Protocol (ACP) stream handling.
//!
//! This module manages bidirectional NDJSON stream communication with
//! agent processes. Every stream is driven by a pair of tasks: a reader that
//! frames incoming lines and a writer that serialises outbound ones.
//!
//! Submodules:
//! - `envelope`: JSON-RPC 2.0 envelope and its strict classification.
//! - `types`: typed ACP payloads (updates, tool calls, permissions, handshake).
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based stream framing for NDJSON messages.
//! - `reader`: async read task emitting decoded [`Frame`](codec::Frame)s.
//! - `writer`: async write task for outbound lines.
//! - `correlation`: request id → single-use waiter table.
//! - `spawner`: process spawning with environment overlay and stdio capture.

pub mod codec;
pub mod correlation;
pub mod envelope;
pub mod reader;
pub mod spawner;
pub mod types;
pub mod writer;
