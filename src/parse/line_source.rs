//! Conversion of a transport byte stream into logical SSE lines.
//!
//! [`LineSource`] accepts CR, LF, and CRLF as line terminators and strips
//! them. It offers two modes: buffered (`next_line`, the whole line at
//! once) and streaming (`next_span` plus `peek_data_field`), which lets
//! the data reader hand out pieces of a `data` line without ever holding
//! the full line in memory.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_utils::Str;
use futures_util::StreamExt;

use crate::error::ClientError;

const LF: u8 = b'\n';
const CR: u8 = b'\r';
/// UTF-8 bytes of U+FEFF; a stream may open with one, dropped on sight.
const BOM: &[u8] = "\u{FEFF}".as_bytes();
/// Spelled-out `data` field name, for the line-start peek.
const DATA_FIELD: &[u8] = b"data";

/// Boxed chunk stream fed by the HTTP response body.
pub(crate) type ByteStream = futures_util::stream::BoxStream<'static, Result<Bytes, ClientError>>;

/// A piece of a line handed out in streaming mode.
#[derive(Debug, Clone)]
pub(crate) enum LineSpan {
    /// Bytes of the current line, carved at a UTF-8 boundary.
    Chunk(Str),
    /// The current line's terminator was consumed.
    EndOfLine,
    /// Clean end of the underlying stream.
    EndOfInput,
}

/// Outcome of peeking whether the next line is a `data` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataPeek {
    /// The line is a `data` field; the field name, colon, and one optional
    /// leading value space have been consumed.
    Data,
    /// Some other line; nothing was consumed.
    NotData,
    /// Clean end of the underlying stream.
    EndOfInput,
}

enum BomCheck {
    Strip,
    Absent,
    NeedMoreData,
}

/// Compares the buffered prefix against the BOM byte by byte. With fewer
/// than three bytes on hand the answer can still go either way.
fn check_bom(buf: &[u8]) -> BomCheck {
    let overlap = buf.iter().zip(BOM).take_while(|(a, b)| a == b).count();
    if overlap == BOM.len() {
        BomCheck::Strip
    } else if overlap == buf.len() {
        BomCheck::NeedMoreData
    } else {
        BomCheck::Absent
    }
}

pub(crate) struct LineSource {
    stream: ByteStream,
    buffer: BytesMut,
    bom_checked: bool,
    eof: bool,
}

impl LineSource {
    pub(crate) fn new(stream: ByteStream, read_buffer_size: usize) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(read_buffer_size),
            bom_checked: false,
            eof: false,
        }
    }

    /// Pulls the next chunk off the stream into the buffer.
    ///
    /// On end of input, a trailing CR can no longer be half of a CRLF pair,
    /// so it is promoted to a full terminator by appending LF.
    async fn fill(&mut self) -> Result<(), ClientError> {
        if self.eof {
            return Ok(());
        }
        loop {
            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.buffer.extend_from_slice(&chunk);
                    return Ok(());
                }
                Some(Err(e)) => return Err(e),
                None => {
                    self.eof = true;
                    if self.buffer.last() == Some(&CR) {
                        self.buffer.put_u8(LF);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Resolves the leading-BOM question before the first line is read.
    async fn ensure_started(&mut self) -> Result<(), ClientError> {
        while !self.bom_checked {
            match check_bom(&self.buffer) {
                BomCheck::Strip => {
                    self.buffer.advance(BOM.len());
                    self.bom_checked = true;
                }
                BomCheck::Absent => self.bom_checked = true,
                // A one- or two-byte stream that matches a BOM prefix is
                // just data.
                BomCheck::NeedMoreData if self.eof => self.bom_checked = true,
                BomCheck::NeedMoreData => self.fill().await?,
            }
        }
        Ok(())
    }

    /// Buffered mode: the next terminator-stripped line as raw bytes.
    ///
    /// Returns `None` on clean end of input. An unterminated trailing line
    /// is discarded, matching the stream format grammar.
    pub(crate) async fn next_line(&mut self) -> Result<Option<Bytes>, ClientError> {
        self.ensure_started().await?;
        loop {
            if let Some(line) = self.pop_line() {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(None);
            }
            self.fill().await?;
        }
    }

    /// Splits one complete line off the front of the buffer and eats its
    /// terminator. `None` means no full line is buffered yet; in
    /// particular, a CR sitting at the very tail is kept back, since the
    /// LF completing a CRLF pair may still be in flight.
    fn pop_line(&mut self) -> Option<Bytes> {
        let at = memchr::memchr2(CR, LF, &self.buffer)?;
        if self.buffer[at] == CR && at + 1 == self.buffer.len() && !self.eof {
            return None;
        }
        let line = self.buffer.split_to(at).freeze();
        let terminator = if self.buffer.starts_with(b"\r\n") { 2 } else { 1 };
        self.buffer.advance(terminator);
        Some(line)
    }

    /// Streaming mode: the next span of the current line.
    pub(crate) async fn next_span(&mut self) -> Result<LineSpan, ClientError> {
        self.ensure_started().await?;
        loop {
            match memchr::memchr2(CR, LF, &self.buffer) {
                Some(0) => {
                    if self.buffer[0] == LF {
                        self.buffer.advance(1);
                        return Ok(LineSpan::EndOfLine);
                    }
                    // Leading CR: wait for one more byte to rule out CRLF.
                    if self.buffer.len() >= 2 {
                        let skip = if self.buffer[1] == LF { 2 } else { 1 };
                        self.buffer.advance(skip);
                        return Ok(LineSpan::EndOfLine);
                    }
                    if self.eof {
                        self.buffer.advance(1);
                        return Ok(LineSpan::EndOfLine);
                    }
                }
                Some(terminator) => {
                    let chunk = self.buffer.split_to(terminator).freeze();
                    return Ok(LineSpan::Chunk(validate_chunk(chunk)?));
                }
                None => {
                    if let Some(chunk) = self.take_utf8_prefix()? {
                        return Ok(LineSpan::Chunk(chunk));
                    }
                    if self.eof {
                        if self.buffer.is_empty() {
                            return Ok(LineSpan::EndOfInput);
                        }
                        // Only an incomplete code point can remain here.
                        validate_chunk(self.buffer.split_to(self.buffer.len()).freeze())?;
                    }
                }
            }
            self.fill().await?;
        }
    }

    /// Decides, at a line start, whether the coming line is a `data` field,
    /// looking at no more than six buffered bytes.
    pub(crate) async fn peek_data_field(&mut self) -> Result<DataPeek, ClientError> {
        self.ensure_started().await?;
        loop {
            let probe = self.buffer.len().min(DATA_FIELD.len());
            if self.buffer[..probe] != DATA_FIELD[..probe] {
                return Ok(DataPeek::NotData);
            }
            if self.buffer.len() > DATA_FIELD.len() {
                return match self.buffer[DATA_FIELD.len()] {
                    b':' => {
                        self.buffer.advance(DATA_FIELD.len() + 1);
                        self.skip_value_space().await?;
                        Ok(DataPeek::Data)
                    }
                    // A bare `data` name with no colon: an empty value.
                    CR | LF => {
                        self.buffer.advance(DATA_FIELD.len());
                        Ok(DataPeek::Data)
                    }
                    _ => Ok(DataPeek::NotData),
                };
            }
            if self.eof {
                // Whatever is left is an unterminated final line.
                return Ok(if self.buffer.is_empty() {
                    DataPeek::EndOfInput
                } else {
                    DataPeek::NotData
                });
            }
            self.fill().await?;
        }
    }

    /// Consumes the single optional space that may follow `data:`.
    async fn skip_value_space(&mut self) -> Result<(), ClientError> {
        loop {
            if let Some(&first) = self.buffer.first() {
                if first == b' ' {
                    self.buffer.advance(1);
                }
                return Ok(());
            }
            if self.eof {
                return Ok(());
            }
            self.fill().await?;
        }
    }

    /// Splits off the longest valid-UTF-8 prefix of the buffer, leaving an
    /// incomplete trailing code point (if any) for the next chunk to finish.
    fn take_utf8_prefix(&mut self) -> Result<Option<Str>, ClientError> {
        let valid_len = match str::from_utf8(&self.buffer) {
            Ok(_) => self.buffer.len(),
            Err(e) if e.error_len().is_some() => return Err(e.into()),
            Err(e) => e.valid_up_to(),
        };
        if valid_len == 0 {
            return Ok(None);
        }
        let bytes = self.buffer.split_to(valid_len).freeze();
        // Safety: `valid_len` came from the validation pass above, so the
        // split lands on a char boundary.
        Ok(Some(unsafe { Str::from_inner_unchecked(bytes) }))
    }
}

fn validate_chunk(bytes: Bytes) -> Result<Str, ClientError> {
    match str::from_utf8(bytes.as_ref()) {
        // Safety: `from_utf8` succeeded on these exact bytes.
        Ok(_) => Ok(unsafe { Str::from_inner_unchecked(bytes) }),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt as _;

    use super::*;

    fn source(chunks: Vec<&'static [u8]>) -> LineSource {
        let stream = futures_util::stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))),
        )
        .boxed();
        LineSource::new(stream, 64)
    }

    async fn all_lines(mut src: LineSource) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = src.next_line().await.expect("read line") {
            lines.push(String::from_utf8(line.to_vec()).expect("utf8 line"));
        }
        lines
    }

    #[tokio::test]
    async fn terminator_variants_are_equivalent() {
        for wire in [
            b"a\nb\nc\n".as_slice(),
            b"a\r\nb\r\nc\r\n".as_slice(),
            b"a\rb\rc\r".as_slice(),
            b"a\nb\r\nc\r".as_slice(),
        ] {
            assert_eq!(all_lines(source(vec![wire])).await, ["a", "b", "c"]);
        }
    }

    #[tokio::test]
    async fn crlf_split_across_chunks() {
        let src = source(vec![b"one\r", b"\ntwo\n"]);
        assert_eq!(all_lines(src).await, ["one", "two"]);
    }

    #[tokio::test]
    async fn lone_cr_at_end_of_input_terminates_the_line() {
        let src = source(vec![b"one\r"]);
        assert_eq!(all_lines(src).await, ["one"]);
    }

    #[tokio::test]
    async fn unterminated_final_line_is_discarded() {
        let src = source(vec![b"one\ntwo"]);
        assert_eq!(all_lines(src).await, ["one"]);
    }

    #[tokio::test]
    async fn bom_is_stripped_once() {
        let src = source(vec![b"\xEF\xBB\xBFdata: x\n"]);
        assert_eq!(all_lines(src).await, ["data: x"]);

        // Split across chunks.
        let src = source(vec![b"\xEF\xBB", b"\xBFdata: x\n"]);
        assert_eq!(all_lines(src).await, ["data: x"]);

        // Only the first BOM goes away.
        let src = source(vec![b"\xEF\xBB\xBF\xEF\xBB\xBFx\n"]);
        assert_eq!(all_lines(src).await, ["\u{FEFF}x"]);
    }

    #[tokio::test]
    async fn empty_chunks_are_skipped() {
        let src = source(vec![b"da", b"", b"ta: x\n"]);
        assert_eq!(all_lines(src).await, ["data: x"]);
    }

    #[tokio::test]
    async fn spans_cover_a_line_in_pieces() {
        let mut src = source(vec![b"hel", b"lo\nrest\n"]);
        let mut text = String::new();
        loop {
            match src.next_span().await.expect("span") {
                LineSpan::Chunk(c) => text.push_str(&c),
                LineSpan::EndOfLine => break,
                LineSpan::EndOfInput => panic!("unexpected end of input"),
            }
        }
        assert_eq!(text, "hello");
        // The rest of the stream is untouched.
        assert_eq!(all_lines(src).await, ["rest"]);
    }

    #[tokio::test]
    async fn spans_hold_back_incomplete_utf8() {
        // "é" (0xC3 0xA9) split across chunks must not be carved mid-char.
        let mut src = source(vec![b"a\xC3", b"\xA9b\n"]);
        let mut pieces = Vec::new();
        loop {
            match src.next_span().await.expect("span") {
                LineSpan::Chunk(c) => pieces.push(c.to_string()),
                LineSpan::EndOfLine => break,
                LineSpan::EndOfInput => panic!("unexpected end of input"),
            }
        }
        assert_eq!(pieces.concat(), "a\u{e9}b");
        for piece in pieces {
            assert!(piece.is_char_boundary(piece.len()));
        }
    }

    #[tokio::test]
    async fn peek_detects_data_lines() {
        let mut src = source(vec![b"data: hello\n"]);
        assert_eq!(
            src.peek_data_field().await.expect("peek"),
            DataPeek::Data
        );
        // Prefix and space are gone; the value remains.
        assert!(matches!(
            src.next_span().await.expect("span"),
            LineSpan::Chunk(c) if &*c == "hello"
        ));
    }

    #[tokio::test]
    async fn peek_leaves_other_lines_alone() {
        let mut src = source(vec![b"event: tick\ndata: x\n"]);
        assert_eq!(
            src.peek_data_field().await.expect("peek"),
            DataPeek::NotData
        );
        assert_eq!(all_lines(src).await, ["event: tick", "data: x"]);
    }

    #[tokio::test]
    async fn peek_rejects_longer_field_names() {
        let mut src = source(vec![b"database: x\n"]);
        assert_eq!(
            src.peek_data_field().await.expect("peek"),
            DataPeek::NotData
        );
    }

    #[tokio::test]
    async fn peek_accepts_bare_data_name() {
        let mut src = source(vec![b"data\n\n"]);
        assert_eq!(src.peek_data_field().await.expect("peek"), DataPeek::Data);
        assert!(matches!(
            src.next_span().await.expect("span"),
            LineSpan::EndOfLine
        ));
    }

    #[tokio::test]
    async fn peek_decides_across_chunk_boundaries() {
        let mut src = source(vec![b"da", b"ta", b":", b" x\n"]);
        assert_eq!(src.peek_data_field().await.expect("peek"), DataPeek::Data);
        assert!(matches!(
            src.next_span().await.expect("span"),
            LineSpan::Chunk(c) if &*c == "x"
        ));
    }

    #[tokio::test]
    async fn peek_reports_end_of_input() {
        let mut src = source(vec![]);
        assert_eq!(
            src.peek_data_field().await.expect("peek"),
            DataPeek::EndOfInput
        );
    }
}
