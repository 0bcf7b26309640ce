//! Incremental `text/event-stream` parsing.
//!
//! The pipeline is layered bottom-up: [`line_source`] turns transport byte
//! chunks into logical lines (buffered or streamed), [`parser`] scans a
//! single line into fields, and [`event_parser`] applies the SSE event
//! semantics and hands finished events to the dispatcher.

pub(crate) mod constants;
pub mod event;
pub(crate) mod event_parser;
pub(crate) mod line_source;
pub(crate) mod parser;

pub use event::{DataReader, EventData, MessageEvent};
