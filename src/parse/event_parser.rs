//! The per-connection SSE interpreter.
//!
//! [`EventParser`] consumes lines from a [`LineSource`], applies the field
//! semantics of the HTML spec (§9.2.6), and emits completed events through
//! the dispatcher — or, in streaming-data mode, hands the handler a lazy
//! [`DataReader`](super::event::DataReader) the moment a `data` field shows
//! up. Malformed fields are tolerated, never fatal; the only errors are
//! transport failures and invalid UTF-8 from the line source.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytes_utils::{Str, StrMut};
use futures_util::FutureExt;
use tracing::error;
use url::Url;

use super::constants::{EMPTY_STR, MESSAGE_STR};
use super::event::{DataReader, MessageEvent, ReaderState};
use super::line_source::{DataPeek, LineSource};
use super::parser::{EventLine, FieldName, parse_line};
use crate::dispatch::AsyncDispatcher;
use crate::error::ClientError;

/// The narrow capability surface the parser gets into the connection
/// controller: stream directives mutate controller state, nothing else.
pub(crate) trait StreamDirectives: Send + Sync {
    /// A valid `retry` field arrived.
    fn set_reconnect_time(&self, time: Duration);
    /// An event was dispatched; `id` is the event's id buffer (possibly
    /// empty, which clears the session id).
    fn set_last_event_id(&self, id: &str);
}

/// Accumulated `data` field values.
///
/// The common case is a single `data` line per event, so the first value is
/// kept as an immutable [`Str`] and only upgraded to a mutable buffer when
/// a second line arrives.
#[derive(Debug, Default)]
enum DataBuffer {
    #[default]
    Unset,
    Single(Str),
    Joined(StrMut),
}

impl DataBuffer {
    fn push(&mut self, value: Str) {
        match self {
            Self::Unset => *self = Self::Single(value),
            Self::Single(first) => {
                let capacity = first.len() + 1 + value.len();
                let inner = bytes::BytesMut::with_capacity(capacity);
                // Safety: a freshly allocated buffer holds no bytes at all,
                // valid UTF-8 included.
                let mut buf = unsafe { StrMut::from_inner_unchecked(inner) };
                buf.push_str(first);
                buf.push('\n');
                buf.push_str(&value);
                *self = Self::Joined(buf);
            }
            Self::Joined(buf) => {
                buf.push('\n');
                buf.push_str(&value);
            }
        }
    }

    fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    fn freeze(self) -> Str {
        match self {
            Self::Unset => EMPTY_STR,
            Self::Single(value) => value,
            Self::Joined(buf) => buf.freeze(),
        }
    }
}

/// Parser behavior knobs snapshotted from the client configuration.
pub(crate) struct ParserOptions {
    pub(crate) stream_event_data: bool,
    pub(crate) expect_event: bool,
    pub(crate) expect_id: bool,
    /// The session id carried over from configuration or a prior connection.
    pub(crate) initial_last_event_id: Str,
}

pub(crate) struct EventParser {
    lines: LineSource,
    origin: Arc<Url>,
    dispatcher: Arc<AsyncDispatcher>,
    directives: Arc<dyn StreamDirectives>,
    stream_event_data: bool,
    expect_event: bool,
    expect_id: bool,
    // In-progress event state, reset at each blank line.
    event_name: Str,
    data: DataBuffer,
    seen_event: bool,
    seen_id: bool,
    buffered_fallback: bool,
    reader_state: ReaderState,
    // The id buffer outlives individual events within a connection.
    id_buffer: Str,
}

impl EventParser {
    pub(crate) fn new(
        lines: LineSource,
        origin: Arc<Url>,
        dispatcher: Arc<AsyncDispatcher>,
        directives: Arc<dyn StreamDirectives>,
        options: ParserOptions,
    ) -> Self {
        Self {
            lines,
            origin,
            dispatcher,
            directives,
            stream_event_data: options.stream_event_data,
            expect_event: options.expect_event,
            expect_id: options.expect_id,
            event_name: EMPTY_STR,
            data: DataBuffer::default(),
            seen_event: false,
            seen_id: false,
            buffered_fallback: false,
            reader_state: ReaderState::Done,
            id_buffer: options.initial_last_event_id,
        }
    }

    /// Drives the parser until the stream ends cleanly or fails.
    pub(crate) async fn run(&mut self) -> Result<(), ClientError> {
        loop {
            if self.stream_event_data && !self.buffered_fallback {
                match self.lines.peek_data_field().await? {
                    DataPeek::Data => {
                        if self.expectations_met() {
                            self.dispatch_streaming().await?;
                        } else {
                            // A required field has not arrived yet; buffer
                            // this whole event instead.
                            self.buffered_fallback = true;
                            let rest = self.lines.next_line().await?.unwrap_or_default();
                            self.append_data(rest)?;
                        }
                        continue;
                    }
                    DataPeek::NotData => {}
                    DataPeek::EndOfInput => return Ok(()),
                }
            }
            let Some(line) = self.lines.next_line().await? else {
                return Ok(());
            };
            self.process_line(line).await?;
        }
    }

    fn expectations_met(&self) -> bool {
        (!self.expect_event || self.seen_event) && (!self.expect_id || self.seen_id)
    }

    async fn process_line(&mut self, line: Bytes) -> Result<(), ClientError> {
        match parse_line(&line)? {
            EventLine::Empty => self.complete_event().await,
            EventLine::Comment(text) => {
                self.dispatcher.submit_comment(text).await;
                Ok(())
            }
            EventLine::Field { name, value } => {
                self.apply_field(name, value);
                Ok(())
            }
        }
    }

    fn apply_field(&mut self, name: FieldName, value: Str) {
        match name {
            FieldName::Event => {
                self.event_name = value;
                self.seen_event = true;
            }
            FieldName::Data => {
                self.data.push(value);
            }
            FieldName::Id => {
                // An id containing NUL is ignored entirely.
                if memchr::memchr(0, value.as_bytes()).is_none() {
                    self.id_buffer = value;
                    self.seen_id = true;
                }
            }
            FieldName::Retry => self.apply_retry(&value),
            FieldName::Ignored => {}
        }
    }

    fn apply_retry(&self, value: &str) {
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return;
        }
        // All-digit values too large for u64 are ignored as well.
        if let Ok(millis) = value.parse::<u64>() {
            self.directives.set_reconnect_time(Duration::from_millis(millis));
        }
    }

    fn append_data(&mut self, raw_value: Bytes) -> Result<(), ClientError> {
        let value = match str::from_utf8(raw_value.as_ref()) {
            // Safety: checked by the `from_utf8` call right above.
            Ok(_) => unsafe { Str::from_inner_unchecked(raw_value) },
            Err(e) => return Err(e.into()),
        };
        self.data.push(value);
        Ok(())
    }

    /// A blank line arrived: dispatch the event if it is eligible, and
    /// reset the per-event state either way.
    async fn complete_event(&mut self) -> Result<(), ClientError> {
        let data = std::mem::take(&mut self.data);
        let name = std::mem::replace(&mut self.event_name, EMPTY_STR);
        self.reset_event_state();

        // No `data` field, no event; the id buffer still stands, but the
        // session id only advances when an event goes out.
        if data.is_unset() {
            return Ok(());
        }

        let name = if name.is_empty() { MESSAGE_STR } else { name };
        self.directives.set_last_event_id(&self.id_buffer);
        let event = MessageEvent::buffered(
            name,
            data.freeze(),
            self.id_buffer.clone(),
            Arc::clone(&self.origin),
        );
        self.dispatcher.submit_message(event).await;
        Ok(())
    }

    /// Streaming-data mode: dispatch as soon as the first `data` field
    /// appears, handing the handler a reader over the live line source.
    async fn dispatch_streaming(&mut self) -> Result<(), ClientError> {
        let name = if self.event_name.is_empty() {
            MESSAGE_STR
        } else {
            self.event_name.clone()
        };
        self.directives.set_last_event_id(&self.id_buffer);

        // Let every queued callback finish so handler calls stay serialized.
        self.dispatcher.flush().await;

        let handler = self.dispatcher.handler();
        self.reader_state = ReaderState::InValue;
        {
            let reader = DataReader::new(&mut self.lines, &mut self.reader_state);
            let event =
                MessageEvent::streaming(name, self.id_buffer.clone(), Arc::clone(&self.origin), reader);
            if AssertUnwindSafe(handler.on_message(event))
                .catch_unwind()
                .await
                .is_err()
            {
                error!("event handler panicked in on_message; continuing");
            }
        }

        // Discard whatever the handler left unread.
        DataReader::new(&mut self.lines, &mut self.reader_state)
            .close()
            .await?;

        // The event is already delivered; skip the rest of it. Late
        // `event`/`id`/`data` fields have no effect, `retry` still counts.
        loop {
            let Some(line) = self.lines.next_line().await? else {
                break;
            };
            match parse_line(&line)? {
                EventLine::Empty => break,
                EventLine::Comment(text) => self.dispatcher.submit_comment(text).await,
                EventLine::Field {
                    name: FieldName::Retry,
                    value,
                } => self.apply_retry(&value),
                EventLine::Field { .. } => {}
            }
        }

        self.event_name = EMPTY_STR;
        self.reset_event_state();
        Ok(())
    }

    fn reset_event_state(&mut self) {
        self.seen_event = false;
        self.seen_id = false;
        self.buffered_fallback = false;
        self.data = DataBuffer::default();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures_util::StreamExt as _;
    use parking_lot::Mutex;

    use super::*;
    use crate::handler::EventHandler;
    use crate::parse::event::EventData;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Message {
            name: String,
            data: String,
            id: Option<String>,
        },
        Comment(String),
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Seen>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn on_message(&self, event: MessageEvent<'_>) {
            let name = event.name().to_string();
            let id = event.last_event_id().map(str::to_string);
            let data = match event.into_data() {
                EventData::Buffered(data) => data.to_string(),
                EventData::Streaming(mut reader) => {
                    reader.read_to_string().await.unwrap_or_default()
                }
            };
            self.seen.lock().push(Seen::Message { name, data, id });
        }

        async fn on_comment(&self, comment: Str) {
            self.seen.lock().push(Seen::Comment(comment.to_string()));
        }
    }

    #[derive(Default)]
    struct Directives {
        reconnect: Mutex<Option<Duration>>,
        last_id: Mutex<Option<String>>,
    }

    impl StreamDirectives for Directives {
        fn set_reconnect_time(&self, time: Duration) {
            *self.reconnect.lock() = Some(time);
        }

        fn set_last_event_id(&self, id: &str) {
            *self.last_id.lock() = if id.is_empty() {
                None
            } else {
                Some(id.to_string())
            };
        }
    }

    struct Run {
        recorder: Arc<Recorder>,
        directives: Arc<Directives>,
        result: Result<(), ClientError>,
    }

    impl Run {
        fn seen(&self) -> Vec<Seen> {
            self.recorder.seen.lock().clone()
        }

        fn messages(&self) -> Vec<(String, String, Option<String>)> {
            self.seen()
                .into_iter()
                .filter_map(|s| match s {
                    Seen::Message { name, data, id } => Some((name, data, id)),
                    Seen::Comment(_) => None,
                })
                .collect()
        }
    }

    async fn parse(wire: &[&'static [u8]], options: ParserOptions) -> Run {
        let recorder = Arc::new(Recorder::default());
        let directives = Arc::new(Directives::default());
        let dispatcher = Arc::new(AsyncDispatcher::new(recorder.clone(), 0));
        dispatcher.spawn_worker();

        let stream = futures_util::stream::iter(
            wire.iter()
                .map(|&c| Ok(Bytes::from_static(c)))
                .collect::<Vec<Result<_, ClientError>>>(),
        )
        .boxed();
        let origin = Arc::new(Url::parse("http://example.com/stream").expect("valid url"));
        let mut parser = EventParser::new(
            LineSource::new(stream, 64),
            origin,
            dispatcher.clone(),
            directives.clone(),
            options,
        );
        let result = parser.run().await;
        dispatcher.flush().await;

        Run {
            recorder,
            directives,
            result,
        }
    }

    fn buffered() -> ParserOptions {
        ParserOptions {
            stream_event_data: false,
            expect_event: false,
            expect_id: false,
            initial_last_event_id: EMPTY_STR,
        }
    }

    fn streaming(expect_event: bool) -> ParserOptions {
        ParserOptions {
            stream_event_data: true,
            expect_event,
            expect_id: false,
            initial_last_event_id: EMPTY_STR,
        }
    }

    #[tokio::test]
    async fn single_data_line() {
        let run = parse(&[b"data: hello\n\n"], buffered()).await;
        assert_eq!(
            run.messages(),
            [("message".to_string(), "hello".to_string(), None)]
        );
    }

    #[tokio::test]
    async fn multi_line_data_with_event_name() {
        let run = parse(&[b"event: greet\ndata: hello\ndata: world\n\n"], buffered()).await;
        assert_eq!(
            run.messages(),
            [("greet".to_string(), "hello\nworld".to_string(), None)]
        );
    }

    #[tokio::test]
    async fn spec_stream_examples() {
        let run = parse(
            &[b": test stream\n\ndata: first event\nid: 1\n\ndata:second event\nid\n\ndata:  third event\n\n"],
            buffered(),
        )
        .await;
        assert_eq!(
            run.messages(),
            [
                (
                    "message".to_string(),
                    "first event".to_string(),
                    Some("1".to_string())
                ),
                ("message".to_string(), "second event".to_string(), None),
                ("message".to_string(), " third event".to_string(), None),
            ]
        );
    }

    #[tokio::test]
    async fn bare_data_and_empty_value() {
        let run = parse(&[b"data\n\ndata\ndata\n\ndata:\n"], buffered()).await;
        assert_eq!(
            run.messages(),
            [
                ("message".to_string(), String::new(), None),
                ("message".to_string(), "\n".to_string(), None),
            ]
        );
    }

    #[tokio::test]
    async fn event_without_data_is_not_dispatched() {
        let run = parse(&[b"event: noop\n\ndata: x\n\n"], buffered()).await;
        // The lone `event:` group vanishes; the event name does not leak
        // into the following event.
        assert_eq!(
            run.messages(),
            [("message".to_string(), "x".to_string(), None)]
        );
    }

    #[tokio::test]
    async fn id_persists_until_replaced_and_empty_id_clears() {
        let run = parse(
            &[b"id: 7\ndata: a\n\ndata: b\n\nid\ndata: c\n\n"],
            buffered(),
        )
        .await;
        assert_eq!(
            run.messages(),
            [
                ("message".to_string(), "a".to_string(), Some("7".to_string())),
                ("message".to_string(), "b".to_string(), Some("7".to_string())),
                ("message".to_string(), "c".to_string(), None),
            ]
        );
        assert_eq!(*run.directives.last_id.lock(), None);
    }

    #[tokio::test]
    async fn id_on_empty_event_advances_session_only_on_dispatch() {
        let run = parse(&[b"id: 42\n\ndata: x\n\n"], buffered()).await;
        // No event carried the id directly, but the buffer persisted into
        // the next dispatched event.
        assert_eq!(
            run.messages(),
            [("message".to_string(), "x".to_string(), Some("42".to_string()))]
        );
        assert_eq!(*run.directives.last_id.lock(), Some("42".to_string()));
    }

    #[tokio::test]
    async fn nul_in_id_is_ignored() {
        let run = parse(&[b"id: 1\ndata: a\n\nid: 4\x002\ndata: b\n\n"], buffered()).await;
        assert_eq!(
            run.messages(),
            [
                ("message".to_string(), "a".to_string(), Some("1".to_string())),
                ("message".to_string(), "b".to_string(), Some("1".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn retry_requires_all_digits() {
        let run = parse(
            &[b"retry: 2500\ndata: a\n\nretry: 3s\ndata: b\n\nretry: -1\ndata: c\n\n"],
            buffered(),
        )
        .await;
        assert!(run.result.is_ok());
        assert_eq!(*run.directives.reconnect.lock(), Some(Duration::from_millis(2500)));
    }

    #[tokio::test]
    async fn comments_are_delivered() {
        let run = parse(&[b": ping\ndata: x\n\n"], buffered()).await;
        assert_eq!(
            run.seen(),
            [
                Seen::Comment(" ping".to_string()),
                Seen::Message {
                    name: "message".to_string(),
                    data: "x".to_string(),
                    id: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn chunk_boundaries_do_not_matter() {
        let run = parse(&[b"data: He", b"llo,", b" wor", b"ld\n", b"\n"], buffered()).await;
        assert_eq!(
            run.messages(),
            [("message".to_string(), "Hello, world".to_string(), None)]
        );
    }

    #[tokio::test]
    async fn streaming_mode_delivers_joined_chunks() {
        let run = parse(
            &[b"event: big\ndata: chunk1\ndata: chunk2\n\n"],
            streaming(true),
        )
        .await;
        assert_eq!(
            run.messages(),
            [("big".to_string(), "chunk1\nchunk2".to_string(), None)]
        );
    }

    #[tokio::test]
    async fn streaming_mode_falls_back_when_expected_field_is_late() {
        let run = parse(&[b"data: chunk1\nevent: big\n\n"], streaming(true)).await;
        // The event name arrived after `data`, so this event was buffered
        // and the name is intact.
        assert_eq!(
            run.messages(),
            [("big".to_string(), "chunk1".to_string(), None)]
        );
    }

    #[tokio::test]
    async fn streaming_mode_ignores_fields_after_dispatch() {
        let run = parse(
            &[b"data: payload\nevent: late\nid: 9\n\ndata: next\n\n"],
            streaming(false),
        )
        .await;
        assert_eq!(
            run.messages(),
            [
                ("message".to_string(), "payload".to_string(), None),
                // The post-dispatch id was discarded along with the event
                // name.
                ("message".to_string(), "next".to_string(), None),
            ]
        );
    }

    #[tokio::test]
    async fn streaming_mode_honors_retry_after_dispatch() {
        let run = parse(
            &[b"data: payload\nretry: 1250\n\n"],
            streaming(false),
        )
        .await;
        assert_eq!(
            run.messages(),
            [("message".to_string(), "payload".to_string(), None)]
        );
        assert_eq!(*run.directives.reconnect.lock(), Some(Duration::from_millis(1250)));
    }

    #[tokio::test]
    async fn streaming_mode_without_trailing_blank_line_still_delivers() {
        let run = parse(&[b"data: cut off"], streaming(false)).await;
        assert_eq!(
            run.messages(),
            [("message".to_string(), "cut off".to_string(), None)]
        );
    }

    #[tokio::test]
    async fn streaming_fallback_resets_per_event() {
        let run = parse(
            &[b"data: first\nevent: a\n\nevent: b\ndata: second\n\n"],
            streaming(true),
        )
        .await;
        // First event buffered (late name), second streamed (name first).
        assert_eq!(
            run.messages(),
            [
                ("a".to_string(), "first".to_string(), None),
                ("b".to_string(), "second".to_string(), None),
            ]
        );
    }
}
