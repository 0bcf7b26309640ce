//! Field-level scanning of single SSE lines.

use core::str::Utf8Error;

use bytes::Bytes;
use bytes_utils::Str;

use super::constants::EMPTY_STR;

/// Field names recognized by the
/// [spec](https://html.spec.whatwg.org/multipage/server-sent-events.html#event-stream-interpretation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldName {
    Event,
    Data,
    Id,
    Retry,
    Ignored,
}

/// A fully classified SSE line.
#[derive(Debug, Clone)]
pub(crate) enum EventLine {
    /// Comment line (starts with `:`); carries the text after the colon.
    Comment(Str),
    /// An empty line (event delimiter).
    Empty,
    /// A field line. A line with no colon is a field with an empty value.
    Field { name: FieldName, value: Str },
}

fn validate_utf8(bytes: Bytes) -> Result<Str, Utf8Error> {
    match str::from_utf8(bytes.as_ref()) {
        // Safety: checked by the `from_utf8` call right above.
        Ok(_) => Ok(unsafe { Str::from_inner_unchecked(bytes) }),
        Err(e) => Err(e),
    }
}

fn field_name(name: &[u8]) -> FieldName {
    match name {
        b"event" => FieldName::Event,
        b"data" => FieldName::Data,
        b"id" => FieldName::Id,
        b"retry" => FieldName::Retry,
        _ => FieldName::Ignored,
    }
}

/// Classifies one terminator-stripped line into an [`EventLine`].
///
/// Values are sliced out of `line` without copying; a single leading space
/// after the colon is stripped per the field-parsing algorithm.
pub(crate) fn parse_line(line: &Bytes) -> Result<EventLine, Utf8Error> {
    if line.is_empty() {
        return Ok(EventLine::Empty);
    }

    match memchr::memchr(b':', line) {
        Some(0) => Ok(EventLine::Comment(validate_utf8(line.slice(1..))?)),
        Some(colon) => {
            let mut value_start = colon + 1;
            if line.get(value_start) == Some(&b' ') {
                value_start += 1;
            }
            Ok(EventLine::Field {
                name: field_name(&line[..colon]),
                value: validate_utf8(line.slice(value_start..))?,
            })
        }
        None => Ok(EventLine::Field {
            name: field_name(line),
            value: EMPTY_STR,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(line: &str) -> (FieldName, String) {
        match parse_line(&Bytes::copy_from_slice(line.as_bytes())).expect("valid line") {
            EventLine::Field { name, value } => (name, value.to_string()),
            other => panic!("expected a field line, got {other:?}"),
        }
    }

    #[test]
    fn field_with_value() {
        assert_eq!(field("data: hello"), (FieldName::Data, "hello".to_string()));
        // Only one leading space is stripped.
        assert_eq!(
            field("data:  hello"),
            (FieldName::Data, " hello".to_string())
        );
        assert_eq!(field("data:hello"), (FieldName::Data, "hello".to_string()));
        assert_eq!(field("event: tick"), (FieldName::Event, "tick".to_string()));
        assert_eq!(field("id: 1"), (FieldName::Id, "1".to_string()));
        assert_eq!(field("retry: 250"), (FieldName::Retry, "250".to_string()));
    }

    #[test]
    fn field_without_colon_has_empty_value() {
        assert_eq!(field("data"), (FieldName::Data, String::new()));
        assert_eq!(field("wat"), (FieldName::Ignored, String::new()));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        assert_eq!(field("datum: x"), (FieldName::Ignored, "x".to_string()));
        // Field names are case-sensitive.
        assert_eq!(field("DATA: x"), (FieldName::Ignored, "x".to_string()));
    }

    #[test]
    fn comment_carries_text() {
        match parse_line(&Bytes::from_static(b": keep-alive")).expect("valid line") {
            EventLine::Comment(text) => assert_eq!(&*text, " keep-alive"),
            other => panic!("expected a comment, got {other:?}"),
        }
    }

    #[test]
    fn empty_line() {
        assert!(matches!(
            parse_line(&Bytes::new()).expect("valid line"),
            EventLine::Empty
        ));
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        assert!(parse_line(&Bytes::from_static(b"data: \xff\xfe")).is_err());
    }
}
