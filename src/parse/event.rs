//! Events delivered to the caller's handler.

use std::fmt;
use std::sync::Arc;

use bytes_utils::Str;
use url::Url;

use super::constants::NEWLINE_STR;
use super::line_source::{DataPeek, LineSource, LineSpan};
use crate::error::ClientError;

/// A parsed SSE event.
///
/// `data` is either fully buffered, or — in streaming-data mode — a
/// [`DataReader`] that hands out the payload incrementally while the event
/// is still arriving. Multiple `data` field values are joined with a single
/// `\n`; no trailing newline is appended.
pub struct MessageEvent<'a> {
    name: Str,
    data: EventData<'a>,
    last_event_id: Str,
    origin: Arc<Url>,
}

/// The payload of a [`MessageEvent`].
pub enum EventData<'a> {
    /// The whole payload, read before dispatch.
    Buffered(Str),
    /// A lazy payload source; only handed out in streaming-data mode.
    Streaming(DataReader<'a>),
}

impl MessageEvent<'static> {
    pub(crate) fn buffered(name: Str, data: Str, last_event_id: Str, origin: Arc<Url>) -> Self {
        Self {
            name,
            data: EventData::Buffered(data),
            last_event_id,
            origin,
        }
    }
}

impl<'a> MessageEvent<'a> {
    pub(crate) fn streaming(
        name: Str,
        last_event_id: Str,
        origin: Arc<Url>,
        reader: DataReader<'a>,
    ) -> Self {
        Self {
            name,
            data: EventData::Streaming(reader),
            last_event_id,
            origin,
        }
    }

    /// The event type, `"message"` when the wire did not name one.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The id in effect when this event was dispatched, if any.
    pub fn last_event_id(&self) -> Option<&str> {
        if self.last_event_id.is_empty() {
            None
        } else {
            Some(&self.last_event_id)
        }
    }

    /// The URL of the stream this event arrived on.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// The buffered payload, or `None` if this event is streaming.
    pub fn data(&self) -> Option<&str> {
        match &self.data {
            EventData::Buffered(data) => Some(data),
            EventData::Streaming(_) => None,
        }
    }

    /// Consumes the event, yielding its payload.
    pub fn into_data(self) -> EventData<'a> {
        self.data
    }
}

impl fmt::Debug for MessageEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEvent")
            .field("name", &&*self.name)
            .field(
                "data",
                &match &self.data {
                    EventData::Buffered(data) => &**data,
                    EventData::Streaming(_) => "<streaming>",
                },
            )
            .field("last_event_id", &self.last_event_id())
            .field("origin", &self.origin.as_str())
            .finish()
    }
}

/// Progress of a streaming data run; owned by the parser so the remainder
/// can be drained after the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReaderState {
    /// Inside the value of a `data` line.
    InValue,
    /// The current `data` line ended; continuation not yet decided.
    AtLineEnd,
    /// The data run is over.
    Done,
}

/// Incremental access to a streaming event's payload.
///
/// Chunks arrive in wire order with a `"\n"` chunk between consecutive
/// `data` lines. The reader borrows the connection's line source, so it
/// cannot outlive the handler invocation; anything left unread when the
/// handler returns is discarded.
pub struct DataReader<'a> {
    lines: &'a mut LineSource,
    state: &'a mut ReaderState,
}

impl<'a> DataReader<'a> {
    pub(crate) fn new(lines: &'a mut LineSource, state: &'a mut ReaderState) -> Self {
        Self { lines, state }
    }

    /// The next chunk of payload, or `None` once the data run is over.
    pub async fn next_chunk(&mut self) -> Result<Option<Str>, ClientError> {
        loop {
            match *self.state {
                ReaderState::Done => return Ok(None),
                ReaderState::InValue => match self.lines.next_span().await? {
                    LineSpan::Chunk(chunk) => return Ok(Some(chunk)),
                    LineSpan::EndOfLine => *self.state = ReaderState::AtLineEnd,
                    LineSpan::EndOfInput => {
                        *self.state = ReaderState::Done;
                        return Ok(None);
                    }
                },
                ReaderState::AtLineEnd => match self.lines.peek_data_field().await? {
                    DataPeek::Data => {
                        *self.state = ReaderState::InValue;
                        return Ok(Some(NEWLINE_STR));
                    }
                    DataPeek::NotData | DataPeek::EndOfInput => {
                        *self.state = ReaderState::Done;
                        return Ok(None);
                    }
                },
            }
        }
    }

    /// Reads the remaining payload into one string.
    pub async fn read_to_string(&mut self) -> Result<String, ClientError> {
        let mut out = String::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.push_str(&chunk);
        }
        Ok(out)
    }

    /// Discards whatever payload has not been read yet.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        while self.next_chunk().await?.is_some() {}
        Ok(())
    }
}

impl fmt::Debug for DataReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataReader").field("state", &self.state).finish()
    }
}
