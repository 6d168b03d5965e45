use crate::cancel::CancellationToken;
use crate::llm::{GatewayError, StreamEnd};
use futures::{Stream, StreamExt};
use serde_json::Value;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";
/// Upper bound on a single undelimited line held between chunks.
const MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;

/// Payload layout of the `data:` lines a channel emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireShape {
    /// `choices[0].delta.content`
    ChatCompletions,
    /// `candidates[0].content.parts[*].text`
    GeminiEvents,
}

impl WireShape {
    pub fn delta(&self, payload: &Value) -> Option<String> {
        let text = match self {
            Self::ChatCompletions => payload
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
                .map(str::to_owned),
            Self::GeminiEvents => payload
                .pointer("/candidates/0/content/parts")
                .and_then(Value::as_array)
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|part| part.get("text").and_then(Value::as_str))
                        .collect::<String>()
                }),
        }?;
        (!text.is_empty()).then_some(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Delta(String),
    Done,
    Failed(String),
    Skip,
}

/// Interprets one complete line of an event stream.
pub fn parse_line(shape: WireShape, line: &str) -> LineEvent {
    let line = line.trim();
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return LineEvent::Skip;
    };
    let data = data.trim_start();
    if data == DONE_SENTINEL {
        return LineEvent::Done;
    }
    let payload: Value = match serde_json::from_str(data) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::debug!(error = %err, "skipping undecodable stream line");
            return LineEvent::Skip;
        }
    };
    if let Some(error) = payload.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| error.to_string());
        return LineEvent::Failed(message);
    }
    match shape.delta(&payload) {
        Some(text) => LineEvent::Delta(text),
        None => LineEvent::Skip,
    }
}

/// Splits a byte stream into lines. A trailing partial line is held until the
/// next chunk completes it, so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
    /// Prefix of `pending` already known to contain no newline.
    scanned: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, GatewayError> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut cursor = self.scanned;
        while let Some(offset) = self.pending[cursor..].iter().position(|&byte| byte == b'\n') {
            let end = cursor + offset;
            let line = String::from_utf8_lossy(&self.pending[start..end]);
            lines.push(line.trim_end_matches('\r').to_string());
            start = end + 1;
            cursor = start;
        }
        self.pending.drain(..start);
        self.scanned = self.pending.len();
        if self.pending.len() > MAX_PENDING_BYTES {
            return Err(GatewayError::Stream(
                "response line exceeded buffer limit".to_string(),
            ));
        }
        Ok(lines)
    }

    /// Remaining bytes once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        self.scanned = 0;
        Some(String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string())
    }
}

enum Flow {
    Continue,
    Stop,
}

fn dispatch(
    shape: WireShape,
    line: &str,
    sink: &mut (dyn for<'s> FnMut(&'s str) + Send),
) -> Result<Flow, GatewayError> {
    match parse_line(shape, line) {
        LineEvent::Delta(text) => {
            sink(&text);
            Ok(Flow::Continue)
        }
        LineEvent::Done => Ok(Flow::Stop),
        LineEvent::Failed(message) => Err(GatewayError::Stream(message)),
        LineEvent::Skip => Ok(Flow::Continue),
    }
}

/// Drives a chunked response body, forwarding each text delta to `sink` as it
/// is decoded. Returns early when `cancel` fires.
pub async fn pump_event_stream<S, B, E, F>(
    body: S,
    shape: WireShape,
    cancel: &CancellationToken,
    sink: &mut (dyn for<'s> FnMut(&'s str) + Send),
    map_err: F,
) -> Result<StreamEnd, GatewayError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    F: Fn(E) -> GatewayError,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = LineDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            next = body.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(&map_err)?;
        for line in decoder.push(chunk.as_ref())? {
            if cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }
            if let Flow::Stop = dispatch(shape, &line, sink)? {
                return Ok(StreamEnd::Completed);
            }
        }
    }

    if let Some(line) = decoder.finish() {
        dispatch(shape, &line, sink)?;
    }
    Ok(StreamEnd::Completed)
}
