//! String constants shared across the parser layer.

use bytes_utils::Str;

/// Event type used when the wire names none.
pub(crate) const MESSAGE_STR: Str = Str::from_static("message");
/// Reusable empty value.
pub(crate) const EMPTY_STR: Str = Str::from_static("");
/// Joint inserted between consecutive `data` field values.
pub(crate) const NEWLINE_STR: Str = Str::from_static("\n");
