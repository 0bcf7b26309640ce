//! Caller-implemented callback surfaces.

use async_trait::async_trait;
use bytes_utils::Str;

use crate::error::ClientError;
use crate::parse::event::MessageEvent;

/// Receives everything a stream produces.
///
/// All callbacks for one client are serialized on a dedicated worker and
/// never overlap: `on_open` precedes any `on_message`/`on_comment` of a
/// connection, and `on_closed` follows all of them before the next
/// `on_open`. Panics in a callback are logged and swallowed.
///
/// In streaming-data mode, `on_message` runs on the stream worker itself
/// and must fully consume (or [`close`](crate::DataReader::close)) the
/// event's [`DataReader`](crate::DataReader) before returning; the stream
/// does not advance until it does.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// A connection was established (or re-established).
    async fn on_open(&self) {}

    /// The current connection ended; the client may reconnect afterwards.
    async fn on_closed(&self) {}

    /// A complete event arrived (or, in streaming-data mode, began).
    async fn on_message(&self, event: MessageEvent<'_>);

    /// A comment line arrived; `comment` is the text after the colon.
    async fn on_comment(&self, comment: Str) {
        let _ = comment;
    }

    /// A connection attempt or established stream failed.
    ///
    /// Only called when the [`ConnectionErrorHandler`] decided to proceed;
    /// never called for a clean server close.
    async fn on_error(&self, error: &ClientError) {
        let _ = error;
    }
}

#[async_trait]
impl<T: EventHandler + ?Sized> EventHandler for std::sync::Arc<T> {
    async fn on_open(&self) {
        (**self).on_open().await;
    }

    async fn on_closed(&self) {
        (**self).on_closed().await;
    }

    async fn on_message(&self, event: MessageEvent<'_>) {
        (**self).on_message(event).await;
    }

    async fn on_comment(&self, comment: Str) {
        (**self).on_comment(comment).await;
    }

    async fn on_error(&self, error: &ClientError) {
        (**self).on_error(error).await;
    }
}

/// What to do about a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Keep going: report the error to the handler and reconnect.
    Proceed,
    /// Give up: shut the client down without reporting to the handler.
    Shutdown,
}

/// Decides, before the user handler hears about it, whether a connection
/// failure stops the client.
///
/// Invoked for transport errors, unsuccessful responses, and clean server
/// closes (the last never reaches [`EventHandler::on_error`] regardless).
pub trait ConnectionErrorHandler: Send + Sync {
    /// Classify a connection failure.
    fn on_connection_error(&self, error: &ClientError) -> ErrorAction;
}

impl<F> ConnectionErrorHandler for F
where
    F: Fn(&ClientError) -> ErrorAction + Send + Sync,
{
    fn on_connection_error(&self, error: &ClientError) -> ErrorAction {
        self(error)
    }
}

/// The default policy: always [`ErrorAction::Proceed`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnectionErrorHandler;

impl ConnectionErrorHandler for DefaultConnectionErrorHandler {
    fn on_connection_error(&self, _error: &ClientError) -> ErrorAction {
        ErrorAction::Proceed
    }
}
