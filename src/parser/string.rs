//! Escape decoding for literal `( )` and hex `< >` strings.
//!
//! A `StringLexer` walks a `(`-delimited buffer applying backslash escapes
//! and nested-paren counting; a `HexStringLexer` walks a `<`-delimited
//! buffer pairing nibbles.

use crate::error::{PdfError, Result};

/// Decodes the body of a literal string. `buf` must start right after the
/// opening `(` and may extend past the matching `)` — decoding stops there.
pub struct StringLexer<'a> {
    pos: usize,
    nested: i32,
    buf: &'a [u8],
}
impl<'a> StringLexer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        StringLexer { pos: 0, nested: 0, buf }
    }
    pub fn get_offset(&self) -> usize {
        self.pos
    }
    /// Decode the whole string, returning the consumed byte count
    /// (position right after the matching closing paren).
    pub fn decode(buf: &'a [u8]) -> Result<(Vec<u8>, usize)> {
        let mut lexer = StringLexer::new(buf);
        let mut out = Vec::new();
        while let Some(b) = lexer.next_lexeme()? {
            out.push(b);
        }
        Ok((out, lexer.get_offset()))
    }

    fn next_lexeme(&mut self) -> Result<Option<u8>> {
        match self.next_byte()? {
            b'\\' => match self.next_byte()? {
                b'n' => Ok(Some(b'\n')),
                b'r' => Ok(Some(b'\r')),
                b't' => Ok(Some(b'\t')),
                b'b' => Ok(Some(0x08)),
                b'f' => Ok(Some(0x0c)),
                b'(' => Ok(Some(b'(')),
                b')' => Ok(Some(b')')),
                b'\n' => {
                    if let Ok(b'\r') = self.peek_byte() {
                        let _ = self.next_byte();
                    }
                    self.next_lexeme()
                }
                b'\r' => {
                    if let Ok(b'\n') = self.peek_byte() {
                        let _ = self.next_byte();
                    }
                    self.next_lexeme()
                }
                b'\\' => Ok(Some(b'\\')),
                _ => {
                    self.back()?;
                    let mut char_code: u16 = 0;
                    for _ in 0..3 {
                        let c = self.peek_byte()?;
                        if (b'0'..=b'7').contains(&c) {
                            self.next_byte()?;
                            char_code = char_code * 8 + (c - b'0') as u16;
                        } else {
                            break;
                        }
                    }
                    Ok(Some(char_code as u8))
                }
            },
            b'(' => {
                self.nested += 1;
                Ok(Some(b'('))
            }
            b')' => {
                self.nested -= 1;
                if self.nested < 0 {
                    Ok(None)
                } else {
                    Ok(Some(b')'))
                }
            }
            c => Ok(Some(c)),
        }
    }
    fn next_byte(&mut self) -> Result<u8> {
        if self.pos < self.buf.len() {
            self.pos += 1;
            Ok(self.buf[self.pos - 1])
        } else {
            Err(PdfError::corrupt("unterminated literal string"))
        }
    }
    fn back(&mut self) -> Result<()> {
        if self.pos > 0 {
            self.pos -= 1;
            Ok(())
        } else {
            Err(PdfError::corrupt("string lexer underflow"))
        }
    }
    fn peek_byte(&mut self) -> Result<u8> {
        self.buf.get(self.pos).copied().ok_or_else(|| PdfError::corrupt("unterminated literal string"))
    }
}

/// Decodes the body of a hex string. `buf` must start right after `<`. An
/// odd number of digits pads the final nibble with a trailing zero.
pub fn decode_hex_string(buf: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let high = match next_hex_nibble(buf, &mut pos)? {
            None => break,
            Some(h) => h,
        };
        match next_hex_nibble(buf, &mut pos)? {
            Some(low) => out.push((high << 4) | low),
            None => {
                out.push(high << 4);
                break;
            }
        }
    }
    Ok((out, pos))
}

fn next_hex_nibble(buf: &[u8], pos: &mut usize) -> Result<Option<u8>> {
    loop {
        let c = *buf.get(*pos).ok_or_else(|| PdfError::corrupt("unterminated hex string"))?;
        *pos += 1;
        match c {
            b' ' | b'\t' | b'\n' | b'\r' | 0x0c => continue,
            b'0'..=b'9' => return Ok(Some(c - b'0')),
            b'a'..=b'f' => return Ok(Some(c - b'a' + 0xa)),
            b'A'..=b'F' => return Ok(Some(c - b'A' + 0xA)),
            b'>' => return Ok(None),
            _ => return Err(PdfError::corrupt(format!("invalid hex string byte {:#x}", c))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_escape_decoding() {
        let (out, consumed) = StringLexer::decode(b"a\\nb\\)c)").unwrap();
        assert_eq!(out, b"a\nb)c");
        assert_eq!(consumed, b"a\\nb\\)c)".len());
    }

    #[test]
    fn nested_parens_preserved() {
        let (out, _) = StringLexer::decode(b"a(b)c)").unwrap();
        assert_eq!(out, b"a(b)c");
    }

    #[test]
    fn octal_escape() {
        let (out, _) = StringLexer::decode(b"\\101\\102)").unwrap();
        assert_eq!(out, b"AB");
    }

    #[test]
    fn hex_string_odd_digit_pads_zero() {
        let (out, consumed) = decode_hex_string(b"41A>").unwrap();
        assert_eq!(out, vec![0x41, 0xA0]);
        assert_eq!(consumed, 4);
    }
}
