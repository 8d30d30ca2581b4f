//! Recursive-descent value parser and indirect-object body reader.
//!
//! A `Context`-free recursive descent over `Token`s from `Lexer`, with
//! one-token-of-backtracking to distinguish `N G R` / `N G obj` from a bare
//! integer followed by another integer.

pub mod lexer;
pub mod string;

pub use lexer::{Lexer, Token};

use crate::error::{PdfError, Result};
use crate::primitive::{Dictionary, PdfStream, PdfString, PlainRef, Primitive};
use bitflags::bitflags;

bitflags! {
    /// Parser tolerance toggles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ParseFlags: u32 {
        /// Accept a stream whose declared `/Length` doesn't lead to a
        /// `endstream` keyword, falling back to scanning for it.
        const TOLERANT_STREAM_LENGTH = 0b0001;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub flags: ParseFlags,
    pub max_depth: usize,
}
impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions { flags: ParseFlags::TOLERANT_STREAM_LENGTH, max_depth: 20 }
    }
}

/// Parse a single PDF value starting at the lexer's current position.
/// Handles the `N G R` indirect-reference backtrack: after parsing an
/// integer, if the next two tokens are `Integer`, `Keyword("R")`, the
/// triple collapses into a `Primitive::Reference`.
pub fn parse_value(lexer: &mut Lexer, depth: usize, opts: &ParseOptions) -> Result<Primitive> {
    if depth > opts.max_depth {
        return Err(PdfError::corrupt("max parse recursion depth exceeded"));
    }
    let tok = lexer
        .next_token()?
        .ok_or_else(|| PdfError::corrupt("unexpected end of input while parsing value"))?;
    match tok {
        Token::Integer(n) => {
            // Look ahead for "G R" to recognize an indirect reference.
            let after_first = lexer.pos();
            if let Ok(Some(Token::Integer(g))) = lexer.next_token() {
                let after_second = lexer.pos();
                if let Ok(Some(Token::Keyword(kw))) = lexer.next_token() {
                    if kw == "R" && n >= 0 && (0..=u16::MAX as i64).contains(&g) {
                        return Ok(Primitive::Reference(PlainRef { id: n as u32, gen: g as u16 }));
                    }
                }
                lexer.seek(after_second);
            }
            lexer.seek(after_first);
            Ok(Primitive::Integer(n))
        }
        Token::Real(f) => Ok(Primitive::Real(f)),
        Token::Name(n) => Ok(Primitive::Name(n)),
        Token::String(bytes) => Ok(Primitive::String(PdfString::new(bytes))),
        Token::ArrayStart => {
            let mut items = Vec::new();
            loop {
                let before = lexer.pos();
                match lexer.next_token()? {
                    Some(Token::ArrayEnd) => break,
                    Some(_) => {
                        lexer.seek(before);
                        items.push(parse_value(lexer, depth + 1, opts)?);
                    }
                    None => return Err(PdfError::corrupt("unterminated array")),
                }
            }
            Ok(Primitive::Array(items))
        }
        Token::DictStart => {
            let dict = parse_dict_body(lexer, depth, opts)?;
            // A dict immediately followed by `stream` becomes a PdfStream.
            if lexer.peek_keyword("stream") {
                let _ = lexer.next_token()?; // consume "stream"
                let data = read_stream_payload(lexer, &dict, opts)?;
                Ok(Primitive::Stream(PdfStream { info: dict, data }))
            } else {
                Ok(Primitive::Dictionary(dict))
            }
        }
        Token::Keyword(kw) => match kw.as_str() {
            "true" => Ok(Primitive::Boolean(true)),
            "false" => Ok(Primitive::Boolean(false)),
            "null" => Ok(Primitive::Null),
            other => Err(PdfError::corrupt(format!("unexpected keyword '{}' in value position", other))),
        },
        other => Err(PdfError::corrupt(format!("unexpected token {:?} in value position", other))),
    }
}

fn parse_dict_body(lexer: &mut Lexer, depth: usize, opts: &ParseOptions) -> Result<Dictionary> {
    let mut dict = Dictionary::new();
    loop {
        match lexer.next_token()? {
            Some(Token::DictEnd) => break,
            Some(Token::Name(key)) => {
                let value = parse_value(lexer, depth + 1, opts)?;
                dict.insert(key, value);
            }
            Some(other) => return Err(PdfError::corrupt(format!("expected /Name or >> in dict, found {:?}", other))),
            None => return Err(PdfError::corrupt("unterminated dictionary")),
        }
    }
    Ok(dict)
}

/// Consume the bytes between `stream` and `endstream`. The first EOL after
/// `stream` (`LF` or `CR LF`) is not part of the payload.
fn read_stream_payload(lexer: &mut Lexer, dict: &Dictionary, opts: &ParseOptions) -> Result<Vec<u8>> {
    let buf = lexer.buf();
    let mut pos = lexer.pos();
    match buf.get(pos) {
        Some(b'\r') => {
            pos += 1;
            if buf.get(pos) == Some(&b'\n') {
                pos += 1;
            }
        }
        Some(b'\n') => pos += 1,
        _ => {}
    }
    let length = dict.get("Length").and_then(|p| p.as_integer().ok());
    let (data, end_pos) = if let Some(len) = length.filter(|&l| l >= 0) {
        let len = len as usize;
        if pos + len <= buf.len() && has_endstream_nearby(buf, pos + len) {
            (buf[pos..pos + len].to_vec(), pos + len)
        } else if opts.flags.contains(ParseFlags::TOLERANT_STREAM_LENGTH) {
            scan_for_endstream(buf, pos)?
        } else {
            return Err(PdfError::corrupt("stream /Length does not lead to 'endstream'"));
        }
    } else {
        scan_for_endstream(buf, pos)?
    };
    lexer.seek(end_pos);
    // consume trailing "endstream"
    let after = lexer.buf()[lexer.pos()..].to_vec();
    let mut tail_lexer = Lexer::new(&after);
    match tail_lexer.next_token()? {
        Some(Token::Keyword(kw)) if kw == "endstream" => {
            lexer.seek(lexer.pos() + tail_lexer.pos());
        }
        _ => return Err(PdfError::corrupt("expected 'endstream' keyword")),
    }
    Ok(data)
}

fn has_endstream_nearby(buf: &[u8], pos: usize) -> bool {
    let window = &buf[pos..(pos + 32).min(buf.len())];
    window.windows(b"endstream".len()).any(|w| w == b"endstream")
}

fn scan_for_endstream(buf: &[u8], start: usize) -> Result<(Vec<u8>, usize)> {
    let needle = b"endstream";
    let hay = &buf[start..];
    let idx = hay
        .windows(needle.len())
        .position(|w| w == needle)
        .ok_or_else(|| PdfError::corrupt("no 'endstream' found"))?;
    let mut end = start + idx;
    // strip the single EOL that precedes "endstream"
    if end > start && buf[end - 1] == b'\n' {
        end -= 1;
        if end > start && buf[end - 1] == b'\r' {
            end -= 1;
        }
    } else if end > start && buf[end - 1] == b'\r' {
        end -= 1;
    }
    Ok((buf[start..end].to_vec(), start + idx))
}

/// Parse `N G obj <value> endobj`, returning the object number, generation,
/// and parsed value. `pos` must point at the leading object number.
pub fn parse_indirect_object(buf: &[u8], pos: usize, opts: &ParseOptions) -> Result<(u32, u16, Primitive)> {
    let mut lexer = Lexer::with_offset(buf, pos);
    let id = match lexer.next_token()? {
        Some(Token::Integer(n)) if n >= 0 => n as u32,
        other => return Err(PdfError::corrupt(format!("expected object number, found {:?}", other))),
    };
    let gen = match lexer.next_token()? {
        Some(Token::Integer(n)) if (0..=u16::MAX as i64).contains(&n) => n as u16,
        other => return Err(PdfError::corrupt(format!("expected generation number, found {:?}", other))),
    };
    match lexer.next_token()? {
        Some(Token::Keyword(kw)) if kw == "obj" => {}
        other => return Err(PdfError::corrupt(format!("expected 'obj' keyword, found {:?}", other))),
    }
    let value = parse_value(&mut lexer, 0, opts)?;
    lexer.skip_whitespace();
    match lexer.next_token()? {
        Some(Token::Keyword(kw)) if kw == "endobj" => {}
        other => return Err(PdfError::corrupt(format!("expected 'endobj' keyword, found {:?}", other))),
    }
    Ok((id, gen, value))
}

/// Extract the declared header version from `%PDF-1.N` near the start of
/// the file. Returns `None` if the comment is missing or malformed (the
/// linear-scan recovery path in `xref.rs` falls back to 1.4 in that case).
pub fn parse_header_version(buf: &[u8]) -> Option<f32> {
    let window = &buf[..buf.len().min(1024)];
    let needle = b"%PDF-";
    let idx = window.windows(needle.len()).position(|w| w == needle)?;
    let rest = &window[idx + needle.len()..];
    let end = rest.iter().position(|&b| lexer::is_whitespace(b) || b == b'%').unwrap_or(rest.len());
    std::str::from_utf8(&rest[..end]).ok()?.parse::<f32>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_vs_plain_integers() {
        let opts = ParseOptions::default();
        let mut lexer = Lexer::new(b"12 0 R");
        let v = parse_value(&mut lexer, 0, &opts).unwrap();
        assert_eq!(v, Primitive::Reference(PlainRef { id: 12, gen: 0 }));

        let mut lexer = Lexer::new(b"[1 2 3]");
        let v = parse_value(&mut lexer, 0, &opts).unwrap();
        assert_eq!(v, Primitive::Array(vec![Primitive::Integer(1), Primitive::Integer(2), Primitive::Integer(3)]));
    }

    #[test]
    fn parses_dict_and_nested_array() {
        let opts = ParseOptions::default();
        let mut lexer = Lexer::new(b"<< /Type /Catalog /Kids [1 0 R 2 0 R] >>");
        let v = parse_value(&mut lexer, 0, &opts).unwrap();
        let dict = v.into_dictionary().unwrap();
        assert_eq!(dict.get("Type").unwrap().as_name().unwrap(), "Catalog");
        assert_eq!(dict.get("Kids").unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn parses_indirect_object_with_stream() {
        let opts = ParseOptions::default();
        let data = b"7 0 obj\n<< /Length 5 >>\nstream\nhello\nendstream\nendobj\n";
        let (id, gen, value) = parse_indirect_object(data, 0, &opts).unwrap();
        assert_eq!((id, gen), (7, 0));
        let stream = value.into_stream().unwrap();
        assert_eq!(stream.data, b"hello");
    }

    #[test]
    fn header_version_detected() {
        assert_eq!(parse_header_version(b"%PDF-1.7\n%stuff\n"), Some(1.7));
    }
}
