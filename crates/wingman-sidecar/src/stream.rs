use crate::decoder::StreamDecoder;
use crate::error::{Result, SidecarError, TransportError, TransportErrorKind};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wingman_wire::StreamEvent;

/// Decoded prompt stream. Ends after `Completed`, on the first transport
/// error, at EOF, or as soon as the cancellation token fires.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Longest line accepted before the stream is treated as malformed.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a byte stream into lines. Bytes are buffered until a newline so a
/// multi-byte character split across chunks is decoded intact.
#[derive(Debug)]
pub struct LineSplitter {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
    max_line: usize,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
        }
    }

    /// Complete lines in `bytes`, or `MalformedResponse` once an unterminated
    /// line grows past the cap.
    pub fn push(&mut self, bytes: &[u8]) -> std::result::Result<Vec<String>, TransportError> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            let line = &self.buf[start..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
            self.scanned = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if self.buf.len() > self.max_line {
            let held = self.buf.len();
            self.buf.clear();
            self.scanned = 0;
            return Err(TransportError::new(
                TransportErrorKind::MalformedResponse,
                format!("stream line exceeds {} bytes ({held} buffered)", self.max_line),
            ));
        }
        Ok(lines)
    }

    /// Whatever trails the last newline at EOF.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        let text = String::from_utf8_lossy(&rest);
        Some(text.trim_end_matches('\r').to_string())
    }
}

/// Drives `bytes` through a [`LineSplitter`] and a [`StreamDecoder`].
/// `idle_timeout` bounds the wait for each chunk, not the whole stream.
/// Transport failures after the response started surface as
/// [`SidecarError::StreamInterrupted`].
pub fn event_stream<S, B, E>(
    bytes: S,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<SidecarError> + Send,
{
    Box::pin(async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut splitter = LineSplitter::new();
        let mut decoder = StreamDecoder::new();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Prompt stream cancelled by caller");
                    return;
                }
                next = tokio::time::timeout(idle_timeout, bytes.next()) => next,
            };

            let lines = match next {
                Err(_) => {
                    yield Err(SidecarError::StreamInterrupted(TransportError::new(
                        TransportErrorKind::TimedOut,
                        format!("no stream data for {}s", idle_timeout.as_secs()),
                    )));
                    return;
                }
                Ok(Some(Ok(chunk))) => match splitter.push(chunk.as_ref()) {
                    Ok(lines) => lines,
                    Err(e) => {
                        tracing::warn!("Prompt stream rejected: {}", e);
                        yield Err(SidecarError::StreamInterrupted(e));
                        return;
                    }
                },
                Ok(Some(Err(e))) => {
                    let err = match e.into() {
                        SidecarError::Transport(t) => SidecarError::StreamInterrupted(t),
                        other => other,
                    };
                    tracing::warn!("Prompt stream interrupted: {}", err);
                    yield Err(err);
                    return;
                }
                Ok(None) => {
                    for event in splitter.finish().iter().flat_map(|l| decoder.decode_line(l)) {
                        yield Ok(event);
                    }
                    for event in decoder.finish() {
                        yield Ok(event);
                    }
                    return;
                }
            };

            for line in lines {
                for event in decoder.decode_line(&line) {
                    let terminal = event.is_terminal();
                    yield Ok(event);
                    if terminal {
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: Vec<&'static [u8]>) -> impl Stream<Item = std::result::Result<Vec<u8>, SidecarError>> {
        stream::iter(parts.into_iter().map(|p| Ok(p.to_vec())))
    }

    #[test]
    fn splitter_keeps_utf8_split_across_chunks() {
        let text = "data: {\"type\":\"text\",\"text\":\"héllo\"}\r\n".as_bytes();
        let cut = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(&text[..cut]).unwrap().is_empty());
        let lines = splitter.push(&text[cut..]).unwrap();
        assert_eq!(lines, vec!["data: {\"type\":\"text\",\"text\":\"héllo\"}"]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn splitter_returns_trailing_partial_line() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"a\nb\n\nc").unwrap(), vec!["a", "b", ""]);
        assert_eq!(splitter.finish(), Some("c".to_string()));
    }

    #[test]
    fn splitter_resumes_scanning_where_it_left_off() {
        let mut splitter = LineSplitter::new();
        for byte in b"data: abc" {
            assert!(splitter.push(&[*byte]).unwrap().is_empty());
        }
        assert_eq!(splitter.push(b"\r").unwrap(), Vec::<String>::new());
        assert_eq!(splitter.push(b"\nnext\n").unwrap(), vec!["data: abc", "next"]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn splitter_rejects_unterminated_line_past_cap() {
        let mut splitter = LineSplitter::with_max_line(8);
        assert_eq!(splitter.push(b"12345678\n").unwrap(), vec!["12345678"]);
        assert!(splitter.push(b"1234").unwrap().is_empty());
        let err = splitter.push(b"56789").unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn oversized_line_ends_stream_as_malformed() {
        let huge = vec![b'x'; MAX_LINE_BYTES + 1];
        let parts: Vec<std::result::Result<Vec<u8>, SidecarError>> = vec![
            Ok(b"data: {\"type\":\"status\",\"label\":\"Thinking\"}\n".to_vec()),
            Ok(b"data: ".to_vec()),
            Ok(huge),
            Ok(b"\ndata: [DONE]\n".to_vec()),
        ];
        let events: Vec<_> =
            event_stream(stream::iter(parts), Duration::from_secs(5), CancellationToken::new())
                .collect()
                .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Ok(StreamEvent::Status(_))));
        assert!(matches!(
            &events[1],
            Err(SidecarError::StreamInterrupted(TransportError {
                kind: TransportErrorKind::MalformedResponse,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn nothing_after_done_sentinel() {
        let events: Vec<_> = event_stream(
            chunks(vec![
                b"data: {\"type\":\"status\",\"label\":\"Thinking\"}\n",
                b"data: [DONE]\ndata: {\"type\":\"status\",\"label\":\"late\"}\n",
            ]),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .collect()
        .await;

        let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![StreamEvent::Status("Thinking".into()), StreamEvent::Completed]
        );
    }

    #[tokio::test]
    async fn transport_error_ends_stream() {
        let parts: Vec<std::result::Result<Vec<u8>, SidecarError>> = vec![
            Ok(b"data: {\"type\":\"text\",\"text\":\"partial\"}\n".to_vec()),
            Err(SidecarError::Transport(TransportError::new(
                TransportErrorKind::ConnectionLost,
                "reset",
            ))),
            Ok(b"data: [DONE]\n".to_vec()),
        ];
        let events: Vec<_> =
            event_stream(stream::iter(parts), Duration::from_secs(5), CancellationToken::new())
                .collect()
                .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Ok(StreamEvent::TextDelta(t)) if t == "partial"));
        match &events[1] {
            Err(err @ SidecarError::StreamInterrupted(t)) => {
                assert_eq!(t.kind, TransportErrorKind::ConnectionLost);
                assert!(err.user_message().contains("lost"));
            }
            other => panic!("expected interrupted stream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_stops_a_silent_stream() {
        let cancel = CancellationToken::new();
        let pending = stream::pending::<std::result::Result<Vec<u8>, SidecarError>>();
        let mut events = event_stream(pending, Duration::from_secs(3600), cancel.clone());
        cancel.cancel();
        assert!(events.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_times_out() {
        let pending = stream::pending::<std::result::Result<Vec<u8>, SidecarError>>();
        let mut events = event_stream(pending, Duration::from_secs(120), CancellationToken::new());
        let first = events.next().await;
        assert!(matches!(
            first,
            Some(Err(SidecarError::StreamInterrupted(TransportError {
                kind: TransportErrorKind::TimedOut,
                ..
            })))
        ));
        assert!(events.next().await.is_none());
    }
}
