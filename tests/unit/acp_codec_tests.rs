//! Unit tests for the NDJSON codec, the reader task and the writer task.
//!
//! Covers:
//! - a single envelope decodes into a frame carrying the verbatim line
//! - partial delivery is buffered until the newline arrives
//! - blank lines, non-JSON banners and non-envelope JSON are skipped
//! - an oversized line is discarded without ending the stream
//! - a line that is not valid UTF-8 is discarded the same way
//! - the reader reports EOF and forwards every valid frame in order
//! - the writer terminates every line and strips embedded newlines

use std::io::Cursor;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;

use uplink::acp::codec::{AcpCodec, Frame, MAX_LINE_BYTES};
use uplink::acp::envelope::RequestId;
use uplink::acp::reader::{run_reader, StreamEnd};
use uplink::acp::writer::run_writer;

const INIT: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":1}}"#;
const UPDATE: &str = r#"{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"s","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"hi"}}}}"#;

async fn decode_all(input: String, codec: AcpCodec) -> Vec<Frame> {
    FramedRead::new(Cursor::new(input.into_bytes()), codec)
        .map(|item| item.expect("codec never fails on in-memory input"))
        .collect()
        .await
}

// ── Decoding ─────────────────────────────────────────────────────────────────

#[test]
fn single_envelope_decodes_with_verbatim_line() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from(format!("{INIT}\n").as_str());

    let frame = codec
        .decode(&mut buf)
        .expect("decode must succeed")
        .expect("one frame must be available");

    assert_eq!(frame.line, INIT, "line must be relayed byte-for-byte");
    assert_eq!(frame.envelope.id, Some(RequestId::Number(1)));
    assert_eq!(frame.envelope.method.as_deref(), Some("initialize"));
}

#[test]
fn partial_delivery_is_buffered_until_newline() {
    let mut codec = AcpCodec::new();
    let (head, tail) = INIT.split_at(20);

    let mut buf = BytesMut::from(head);
    assert!(
        codec.decode(&mut buf).expect("decode").is_none(),
        "no frame before the newline"
    );

    buf.extend_from_slice(tail.as_bytes());
    buf.extend_from_slice(b"\n");
    let frame = codec.decode(&mut buf).expect("decode");
    assert!(frame.is_some(), "frame must be yielded once complete");
}

#[tokio::test]
async fn noise_lines_are_skipped() {
    let input = format!("\n   \nWelcome to the agent!\n{{\"foo\":1}}\n{INIT}\n[1,2,3]\n{UPDATE}\n");

    let frames = decode_all(input, AcpCodec::new()).await;

    let lines: Vec<&str> = frames.iter().map(|f| f.line.as_str()).collect();
    assert_eq!(lines, vec![INIT, UPDATE], "only envelopes survive, in order");
}

#[tokio::test]
async fn oversized_line_is_discarded_and_stream_continues() {
    let long = format!(
        r#"{{"jsonrpc":"2.0","method":"session/update","params":{{"pad":"{}"}}}}"#,
        "x".repeat(512)
    );
    let input = format!("{long}\n{INIT}\n");

    let frames = decode_all(input, AcpCodec::with_max_length(256)).await;

    assert_eq!(frames.len(), 1, "the oversized line must be dropped");
    assert_eq!(frames[0].line, INIT);
}

#[tokio::test]
async fn invalid_utf8_line_is_discarded_and_stream_continues() {
    let mut input = b"\xff\xfe garbage\n".to_vec();
    input.extend_from_slice(format!("{INIT}\n").as_bytes());

    let items: Vec<_> = FramedRead::new(Cursor::new(input), AcpCodec::new())
        .collect()
        .await;

    assert_eq!(items.len(), 1, "the undecodable line yields nothing");
    let frame = items.into_iter().next().expect("one item").expect("not an error");
    assert_eq!(frame.line, INIT);
}

#[test]
fn invalid_utf8_at_eof_is_not_an_error() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from(&b"\xc3\x28 trailing"[..]);

    assert!(codec.decode_eof(&mut buf).expect("decode_eof").is_none());
    assert!(buf.is_empty(), "the bad tail is consumed");
}

#[test]
fn default_limit_is_one_mebibyte() {
    assert_eq!(MAX_LINE_BYTES, 1024 * 1024);
}

#[tokio::test]
async fn final_line_without_newline_is_decoded_at_eof() {
    let frames = decode_all(INIT.to_owned(), AcpCodec::new()).await;
    assert_eq!(frames.len(), 1);
}

// ── Reader task ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn reader_forwards_frames_then_reports_eof() {
    let input = Cursor::new(format!("{INIT}\nnot json\n{UPDATE}\n").into_bytes());
    let (tx, mut rx) = mpsc::channel(8);

    let end = run_reader("test".into(), input, tx, CancellationToken::new()).await;

    assert_eq!(end, StreamEnd::Eof);
    let first = rx.recv().await.expect("first frame");
    let second = rx.recv().await.expect("second frame");
    assert_eq!(first.line, INIT);
    assert_eq!(second.line, UPDATE);
    assert!(rx.recv().await.is_none(), "sender dropped after EOF");
}

#[tokio::test]
async fn reader_stops_on_cancellation() {
    let (_keep_open, stream) = tokio::io::duplex(64);
    let (tx, _rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let end = run_reader("test".into(), stream, tx, cancel).await;

    assert_eq!(end, StreamEnd::Cancelled);
}

// ── Writer task ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn writer_terminates_lines_and_strips_embedded_newlines() {
    let (sink, mut read_half) = tokio::io::duplex(1024);
    let (tx, rx) = mpsc::unbounded_channel();

    tx.send(INIT.to_owned()).expect("send");
    tx.send("{\"a\":\n1}".to_owned()).expect("send");
    drop(tx);

    run_writer("test".into(), sink, rx, CancellationToken::new())
        .await
        .expect("writer must exit cleanly once the channel closes");

    let mut out = String::new();
    read_half.read_to_string(&mut out).await.expect("read");
    assert_eq!(out, format!("{INIT}\n{{\"a\":1}}\n"));
}
