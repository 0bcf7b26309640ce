//! Server-Sent Events client for long-lived streams.
//!
//! This crate implements the client side of the
//! [SSE protocol](https://html.spec.whatwg.org/multipage/server-sent-events.html)
//! with the pragmatics a non-browser consumer needs:
//!
//! - **Incremental parsing**: a bounded-memory `text/event-stream` parser
//!   handling CR / LF / CRLF, a leading BOM, and every field rule of the
//!   spec, with an opt-in streaming mode that hands the handler event data
//!   while it is still arriving.
//! - **Auto-reconnection**: jittered exponential backoff with a reset
//!   threshold for healthy connections, `Last-Event-ID` resumption, and
//!   server-driven `retry:` overrides.
//! - **Serialized delivery**: all handler callbacks run in order on one
//!   dedicated worker, with optional backpressure that slows the stream
//!   reader instead of piling up events.
//! - **Caller-controlled policy**: a [`ConnectionErrorHandler`] decides
//!   per failure whether to keep retrying or shut down.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use sse_client::{ClientConfig, EventHandler, EventSource, MessageEvent};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_message(&self, event: MessageEvent<'_>) {
//!         println!("{}: {:?}", event.name(), event.data());
//!     }
//! }
//!
//! # async fn example() -> sse_client::Result<()> {
//! let config = ClientConfig::new("https://example.com/stream")
//!     .last_event_id("evt-1000");
//! let client = EventSource::new(config, Printer)?;
//! client.start();
//! # Ok(())
//! # }
//! ```
//!
//! # Module Index
//!
//! | Module | Description |
//! |--------|-------------|
//! | `client` | [`EventSource`], [`ReadyState`], the connection lifecycle |
//! | `config` | [`ClientConfig`] builder for connection settings |
//! | `handler` | [`EventHandler`] and [`ConnectionErrorHandler`] traits |
//! | `error` | [`ClientError`] and the crate [`Result`] |
//! | `parse` | [`MessageEvent`], [`EventData`], [`DataReader`] |

pub mod client;
pub mod config;
mod dispatch;
pub mod error;
pub mod handler;
pub mod parse;
mod reconnect;

// Re-export the payload string type; handler signatures mention it.
pub use bytes_utils::Str;

pub use client::{EventSource, ReadyState};
pub use config::{ClientConfig, RequestTransformer};
pub use error::{ClientError, Result};
pub use handler::{
    ConnectionErrorHandler, DefaultConnectionErrorHandler, ErrorAction, EventHandler,
};
pub use parse::{DataReader, EventData, MessageEvent};
