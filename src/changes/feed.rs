//! Incremental decoder for the continuous change feed.
//!
//! The feed is newline-delimited JSON: one change record per line, blank
//! lines as heartbeats, and a final `{"last_seq": N}` line when the server
//! ends the feed. Chunks arrive at arbitrary boundaries, so the decoder
//! accumulates bytes and only yields events for complete lines.
//!
//! A malformed line is yielded as an error *event* rather than failing the
//! decoder: the subscription logs and skips it, and the feed stays alive.

use crate::error::{Error, Result};
use crate::types::{DatabaseChange, SequenceNumber};
use bytes::BytesMut;
use serde::Deserialize;

/// One decoded feed event.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A document changed.
    Change(DatabaseChange),
    /// Keep-alive blank line.
    Heartbeat,
    /// The server ended the feed, reporting its final sequence.
    End(SequenceNumber),
}

#[derive(Deserialize)]
struct WireRev {
    rev: String,
}

#[derive(Deserialize)]
struct WireChange {
    seq: SequenceNumber,
    id: String,
    changes: Vec<WireRev>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireLine {
    Change(WireChange),
    End { last_seq: SequenceNumber },
}

/// Accumulates feed bytes and yields complete events.
#[derive(Debug, Default)]
pub struct FeedDecoder {
    buffer: BytesMut,
}

impl FeedDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        FeedDecoder {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Feed bytes to the decoder; returns one entry per completed line.
    ///
    /// Decode failures are per-line: an `Err` entry covers exactly one
    /// malformed line and later lines decode normally.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<FeedEvent>> {
        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let line = trim_line(&line);
            if line.is_empty() {
                events.push(Ok(FeedEvent::Heartbeat));
                continue;
            }
            events.push(decode_line(line));
        }

        events
    }
}

fn trim_line(raw: &[u8]) -> &[u8] {
    let mut line = raw;
    while let [rest @ .., last] = line {
        if *last == b'\n' || *last == b'\r' {
            line = rest;
        } else {
            break;
        }
    }
    line
}

fn decode_line(line: &[u8]) -> Result<FeedEvent> {
    match serde_json::from_slice::<WireLine>(line)? {
        WireLine::Change(change) => {
            let rev = change
                .changes
                .into_iter()
                .next()
                .ok_or_else(|| Error::Decode("change record without revisions".into()))?;
            Ok(FeedEvent::Change(DatabaseChange {
                seq: change.seq,
                id: change.id,
                rev: rev.rev.into(),
                deleted: change.deleted,
            }))
        }
        WireLine::End { last_seq } => Ok(FeedEvent::End(last_seq)),
    }
}
