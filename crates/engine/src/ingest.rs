use std::collections::VecDeque;

use apothecary_api::ApiResult;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use snafu::IntoError;

use super::error::{IngestResult, InvalidUtf8Snafu, SourceSnafu, TruncatedUtf8Snafu};

/// Prefix that marks a data record in an event-framed body.
pub const DATA_MARKER: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";
const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

pub type IncrementStream = BoxStream<'static, IngestResult<String>>;

/// Wire shape of a chat reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamShape {
    /// Plain UTF-8 text, folded as it arrives.
    Raw,
    /// Newline-delimited `data:` records carrying JSON payloads.
    EventFramed,
    /// Picks a shape from the response `Content-Type`.
    #[default]
    Auto,
}

impl StreamShape {
    pub fn resolve(self, content_type: Option<&str>) -> Self {
        match self {
            Self::Raw | Self::EventFramed => self,
            Self::Auto => {
                let is_event_stream = content_type
                    .and_then(|value| value.split(';').next())
                    .is_some_and(|mime| {
                        mime.trim().eq_ignore_ascii_case(EVENT_STREAM_CONTENT_TYPE)
                    });
                if is_event_stream {
                    Self::EventFramed
                } else {
                    Self::Raw
                }
            }
        }
    }
}

/// Stateful UTF-8 decoder that carries incomplete multi-byte sequences to the next chunk.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
    consumed: usize,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes every complete character available after appending `chunk`.
    pub fn decode(&mut self, chunk: &[u8]) -> IngestResult<String> {
        self.pending.extend_from_slice(chunk);

        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(error) => {
                if error.error_len().is_some() {
                    return InvalidUtf8Snafu {
                        stage: "decode-raw-chunk",
                        offset: self.consumed + error.valid_up_to(),
                    }
                    .fail();
                }
                error.valid_up_to()
            }
        };

        let offset = self.consumed;
        let decoded = self.pending.drain(..valid_up_to).collect::<Vec<_>>();
        self.consumed += decoded.len();
        String::from_utf8(decoded).map_err(|error| {
            InvalidUtf8Snafu {
                stage: "decode-raw-prefix",
                offset: offset + error.utf8_error().valid_up_to(),
            }
            .build()
        })
    }

    /// Fails if the body ended in the middle of a character.
    pub fn finish(&mut self) -> IngestResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        TruncatedUtf8Snafu {
            stage: "finish-raw-stream",
            pending: self.pending.len(),
        }
        .fail()
    }
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Longest record the event decoder buffers before discarding it.
pub const MAX_RECORD_BYTES: usize = 1 << 20;

/// Reassembles newline-delimited records across chunk boundaries and extracts delta text.
///
/// A record longer than the limit is dropped up to its terminating newline, so a body that
/// never sends one cannot grow the buffer without bound.
#[derive(Debug)]
pub struct EventFrameDecoder {
    line: Vec<u8>,
    limit: usize,
    oversized: bool,
}

impl Default for EventFrameDecoder {
    fn default() -> Self {
        Self::with_record_limit(MAX_RECORD_BYTES)
    }
}

impl EventFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record_limit(limit: usize) -> Self {
        Self {
            line: Vec::new(),
            limit,
            oversized: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut deltas = Vec::new();
        for byte in chunk {
            if *byte == b'\n' {
                deltas.extend(self.take_line());
            } else if self.oversized {
                continue;
            } else if self.line.len() >= self.limit {
                tracing::debug!(limit = self.limit, "dropping oversized event record");
                self.line = Vec::new();
                self.oversized = true;
            } else {
                self.line.push(*byte);
            }
        }
        deltas
    }

    /// Processes a final record that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<String> {
        self.take_line().into_iter().collect()
    }

    fn take_line(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.line);
        if std::mem::take(&mut self.oversized) {
            return None;
        }
        Self::parse_line(&line)
    }

    fn parse_line(line: &[u8]) -> Option<String> {
        let Ok(line) = std::str::from_utf8(line) else {
            tracing::debug!(bytes = line.len(), "skipping event record with invalid UTF-8");
            return None;
        };
        parse_record(line)
    }
}

/// Extracts the text of one `delta` record; every other line yields `None`.
pub fn parse_record(line: &str) -> Option<String> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return None;
    }

    let Some(payload) = line.strip_prefix(DATA_MARKER) else {
        tracing::debug!(line = %line, "skipping non-data event line");
        return None;
    };
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload.trim() == DONE_SENTINEL {
        return None;
    }

    match serde_json::from_str::<EventRecord>(payload) {
        Ok(record) if record.kind == "delta" => record.text,
        Ok(record) => {
            tracing::debug!(kind = %record.kind, "ignoring non-delta event record");
            None
        }
        Err(error) => {
            tracing::debug!(error = %error, "skipping malformed event record");
            None
        }
    }
}

enum Decoder {
    Raw(Utf8Decoder),
    EventFramed(EventFrameDecoder),
}

impl Decoder {
    fn for_shape(shape: StreamShape) -> Self {
        match shape {
            StreamShape::EventFramed => Self::EventFramed(EventFrameDecoder::new()),
            // Auto is resolved by the caller; an unresolved shape decodes as raw text.
            StreamShape::Raw | StreamShape::Auto => Self::Raw(Utf8Decoder::new()),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> IngestResult<Vec<String>> {
        match self {
            Self::Raw(decoder) => decoder.decode(chunk).map(|text| vec![text]),
            Self::EventFramed(decoder) => Ok(decoder.push(chunk)),
        }
    }

    fn finish(&mut self) -> IngestResult<Vec<String>> {
        match self {
            Self::Raw(decoder) => decoder.finish().map(|()| Vec::new()),
            Self::EventFramed(decoder) => Ok(decoder.finish()),
        }
    }
}

struct IngestState<S> {
    source: S,
    decoder: Decoder,
    ready: VecDeque<String>,
    finished: bool,
}

impl<S> IngestState<S> {
    fn enqueue(&mut self, pieces: Vec<String>) {
        self.ready
            .extend(pieces.into_iter().filter(|piece| !piece.is_empty()));
    }
}

/// Turns a response body into a lazy, one-shot stream of text increments.
///
/// The stream ends when the body ends, or right after yielding the first error.
pub fn ingest<S>(source: S, shape: StreamShape) -> IncrementStream
where
    S: Stream<Item = ApiResult<Bytes>> + Send + Unpin + 'static,
{
    let state = IngestState {
        source,
        decoder: Decoder::for_shape(shape),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(increment) = state.ready.pop_front() {
                return Some((Ok(increment), state));
            }
            if state.finished {
                return None;
            }

            let pieces = match state.source.next().await {
                Some(Ok(chunk)) => state.decoder.push(&chunk),
                Some(Err(source)) => Err(SourceSnafu {
                    stage: "read-reply-chunk",
                }
                .into_error(source)),
                None => {
                    state.finished = true;
                    state.decoder.finish()
                }
            };

            match pieces {
                Ok(pieces) => state.enqueue(pieces),
                Err(error) => {
                    state.finished = true;
                    state.ready.clear();
                    return Some((Err(error), state));
                }
            }
        }
    })
    .boxed()
}

/// Feeds every increment to `on_increment` and returns how many were delivered.
pub async fn drain<F>(mut increments: IncrementStream, mut on_increment: F) -> IngestResult<usize>
where
    F: FnMut(&str),
{
    let mut delivered = 0;
    while let Some(increment) = increments.next().await {
        let increment: String = increment?;
        on_increment(&increment);
        delivered += 1;
    }
    Ok(delivered)
}
