//! Delta stream normalization
//!
//! Provider pulses become `StreamUnit`s on an ordered channel. A producer task
//! owns the event source; dropping it (on cancel or terminal signal) drops the
//! HTTP response underneath.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::constants::{MAX_LINE_LENGTH, MAX_STREAM_LINES};
use crate::logging::StreamMetric;
use crate::types::*;

pub const STREAM_CHANNEL_CAPACITY: usize = 256;

pub type PulseStream = BoxStream<'static, Result<ProviderPulse>>;

/// Maps one provider pulse to at most one unit. `Ok(None)` is a heartbeat.
pub fn normalize_pulse(pulse: &ProviderPulse) -> Result<Option<StreamUnit>> {
    let choice = match pulse.choices.first() {
        Some(c) => c,
        None => return Ok(None),
    };

    if let Some(reason) = FinishReason::from_provider(choice.finish_reason.as_deref())? {
        tracing::debug!("[STREAM] finish_reason={}", reason);
        return Ok(Some(StreamUnit::FinishSignal(reason)));
    }

    if let Some(deltas) = &choice.delta.tool_calls {
        if !deltas.is_empty() {
            return Ok(Some(StreamUnit::ToolCallDeltaBatch(deltas.clone())));
        }
    }

    match &choice.delta.content {
        Some(text) if !text.is_empty() => Ok(Some(StreamUnit::TextFragment(text.clone()))),
        _ => Ok(None),
    }
}

pub struct StreamNormalizer;

impl StreamNormalizer {
    /// Starts the producer task and hands back the consuming end.
    pub fn spawn<S>(events: S, cancel: CancellationToken) -> mpsc::Receiver<Result<StreamUnit>>
    where
        S: Stream<Item = Result<ProviderPulse>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let turn_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("stream", turn_id = %turn_id);
        tokio::spawn(Self::run(events, cancel, tx, turn_id).instrument(span));
        rx
    }

    async fn run<S>(
        mut events: S,
        cancel: CancellationToken,
        tx: mpsc::Sender<Result<StreamUnit>>,
        turn_id: String,
    ) where
        S: Stream<Item = Result<ProviderPulse>> + Send + Unpin + 'static,
    {
        tracing::debug!("[STREAM] Turn {} started", turn_id);
        let mut metrics = StreamMetric::new(turn_id);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("[STREAM] Cancellation requested, dropping provider stream");
                    if tx.send(Ok(StreamUnit::FinishSignal(FinishReason::Cancelled))).await.is_err() {
                        tracing::trace!("[STREAM] Consumer already gone");
                    }
                    break;
                }
                next = events.next() => next,
            };

            let pulse = match next {
                Some(Ok(pulse)) => pulse,
                Some(Err(e)) => {
                    tracing::error!("[STREAM] Event source failed: {}", e.inner);
                    if tx.send(Err(e)).await.is_err() {
                        tracing::trace!("[STREAM] Consumer already gone");
                    }
                    break;
                }
                None => {
                    tracing::debug!("[STREAM] Event source exhausted without a terminal signal");
                    break;
                }
            };

            metrics.record_chunk(&pulse);

            match normalize_pulse(&pulse) {
                Ok(Some(unit)) => {
                    let terminal = matches!(&unit, StreamUnit::FinishSignal(r) if r.ends_stream());
                    if tx.send(Ok(unit)).await.is_err() {
                        tracing::trace!("[STREAM] Consumer dropped the channel, stopping");
                        break;
                    }
                    if terminal {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("[STREAM] {}", e.inner);
                    if tx.send(Err(e)).await.is_err() {
                        tracing::trace!("[STREAM] Consumer already gone");
                    }
                    break;
                }
            }
        }

        drop(events);
        metrics.log_summary();
    }
}

/// True when the error (or anything in its source chain) is a peer reset.
pub fn is_connection_reset(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
            ) {
                return true;
            }
            // `io::Error::source` skips the wrapped error itself.
            if let Some(inner) = io.get_ref() {
                if is_connection_reset(inner) {
                    return true;
                }
            }
        }
        let text = e.to_string().to_lowercase();
        if text.contains("econnreset") || text.contains("connection reset") {
            return true;
        }
        current = e.source();
    }
    false
}

fn classify_line_error(e: LinesCodecError) -> ObservedError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => CellstreamError::Protocol(format!(
            "SSE line exceeded {} bytes",
            MAX_LINE_LENGTH
        ))
        .into(),
        LinesCodecError::Io(io) => {
            if is_connection_reset(&io) {
                CellstreamError::ConnectionReset(io.to_string()).into()
            } else {
                CellstreamError::Io(io).into()
            }
        }
    }
}

fn provider_error(err: ProviderError) -> ObservedError {
    let status = err
        .error
        .code
        .as_ref()
        .and_then(|c| match c {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse::<u64>().ok(),
            _ => None,
        })
        .and_then(|code| u16::try_from(code).ok())
        .and_then(|code| reqwest::StatusCode::from_u16(code).ok());

    match status {
        Some(status) => CellstreamError::ProviderHttp {
            status,
            message: err.error.message,
        }
        .into(),
        None => CellstreamError::Protocol(format!("Provider error: {}", err.error.message)).into(),
    }
}

struct SseState<R> {
    lines: FramedRead<StreamReader<R, Bytes>, LinesCodec>,
    line_count: usize,
    done: bool,
}

/// Frames a raw SSE byte stream into provider pulses. Stops at `[DONE]`.
pub fn sse_events<R>(bytes: R) -> PulseStream
where
    R: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + Unpin + 'static,
{
    let state = SseState {
        lines: FramedRead::new(
            StreamReader::new(bytes),
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        ),
        line_count: 0,
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            let line = state.lines.next().await?;
            state.line_count += 1;
            if state.line_count > MAX_STREAM_LINES {
                tracing::error!("[STREAM] Stream exceeded max line limit ({})", MAX_STREAM_LINES);
                state.done = true;
                let err = CellstreamError::Protocol("Stream exceeded max line limit".into());
                return Some((Err(err.into()), state));
            }

            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("[STREAM] Line read error: {}", e);
                    state.done = true;
                    return Some((Err(classify_line_error(e)), state));
                }
            };

            let data = match line.strip_prefix("data:") {
                Some(d) => d.trim_start(),
                None => continue,
            };
            if data == "[DONE]" {
                tracing::debug!("[STREAM] Stream end marker [DONE] received");
                return None;
            }

            match parse_provider_line(data) {
                LineEvent::Pulse(pulse) => return Some((Ok(pulse), state)),
                LineEvent::Error(err) => {
                    tracing::error!("[STREAM] Provider error event: {}", err.error.message);
                    state.done = true;
                    return Some((Err(provider_error(err)), state));
                }
                LineEvent::Unknown(_) => continue,
            }
        }
    })
    .boxed()
}

/// Adapts a reqwest response body into pulses.
pub fn response_events(response: reqwest::Response) -> PulseStream {
    let bytes = response.bytes_stream().map(|r| {
        r.map_err(|e| {
            if is_connection_reset(&e) {
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, e)
            } else {
                std::io::Error::other(e)
            }
        })
    });
    sse_events(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + Unpin + 'static {
        futures_util::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))))
    }

    #[test]
    fn test_normalize_text_and_heartbeat() {
        let unit = normalize_pulse(&ProviderPulse::text("hi")).unwrap();
        assert_eq!(unit, Some(StreamUnit::TextFragment("hi".into())));
        assert_eq!(normalize_pulse(&ProviderPulse::text("")).unwrap(), None);
        assert_eq!(normalize_pulse(&ProviderPulse::default()).unwrap(), None);
    }

    #[test]
    fn test_normalize_tool_calls_take_precedence_over_text() {
        let mut pulse = ProviderPulse::tool_calls(vec![ToolCallDelta {
            index: 0,
            ..Default::default()
        }]);
        pulse.choices[0].delta.content = Some("ignored".into());
        assert!(matches!(
            normalize_pulse(&pulse).unwrap(),
            Some(StreamUnit::ToolCallDeltaBatch(d)) if d.len() == 1
        ));
    }

    #[test]
    fn test_normalize_unknown_finish_reason_is_fatal() {
        let err = normalize_pulse(&ProviderPulse::finish("eos")).unwrap_err();
        assert!(matches!(err.inner, CellstreamError::UnhandledFinishReason(_)));
    }

    #[tokio::test]
    async fn test_sse_events_split_across_chunks() {
        let stream = sse_events(byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"He",
            "llo\"},\"finish_reason\":null}]}\n\n",
            ": keep-alive\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n",
            "data: [DONE]\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
        ]));
        let pulses: Vec<_> = stream.collect().await;
        assert_eq!(pulses.len(), 2);
        let first = pulses[0].as_ref().unwrap();
        assert_eq!(first.choices[0].delta.content.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn test_sse_error_event_with_status_code() {
        let stream = sse_events(byte_stream(vec![
            "data: {\"error\":{\"message\":\"quota\",\"type\":\"x\",\"code\":429}}\n",
        ]));
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        match &items[0] {
            Err(e) => assert!(matches!(
                &e.inner,
                CellstreamError::ProviderHttp { status, .. } if status.as_u16() == 429
            )),
            Ok(p) => panic!("expected error, got {:?}", p),
        }
    }

    #[tokio::test]
    async fn test_io_reset_classified() {
        let stream = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer")),
        ]);
        let items: Vec<_> = sse_events(stream).collect().await;
        assert!(items[0].is_ok());
        assert!(matches!(
            items.last().map(|r| r.as_ref().map_err(|e| &e.inner)),
            Some(Err(CellstreamError::ConnectionReset(_)))
        ));
    }

    #[tokio::test]
    async fn test_normalizer_stops_after_terminal_signal() {
        let pulses = vec![
            Ok(ProviderPulse::text("a")),
            Ok(ProviderPulse::finish("stop")),
            Ok(ProviderPulse::text("never")),
        ];
        let mut rx = StreamNormalizer::spawn(
            futures_util::stream::iter(pulses),
            CancellationToken::new(),
        );
        let mut units = Vec::new();
        while let Some(u) = rx.recv().await {
            units.push(u.unwrap());
        }
        assert_eq!(
            units,
            vec![
                StreamUnit::TextFragment("a".into()),
                StreamUnit::FinishSignal(FinishReason::Stop)
            ]
        );
    }

    #[tokio::test]
    async fn test_normalizer_emits_cancelled_when_token_set() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut rx = StreamNormalizer::spawn(futures_util::stream::pending::<Result<ProviderPulse>>(), cancel);
        let unit = rx.recv().await.unwrap().unwrap();
        assert_eq!(unit, StreamUnit::FinishSignal(FinishReason::Cancelled));
        assert!(rx.recv().await.is_none());
    }
}
