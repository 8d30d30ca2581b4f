//! Byte-source access: locating the header and the tail-anchored `startxref`.
//!
//! Only an in-memory `Vec<u8>`/`&[u8]` backend ships here; the `Backend`
//! trait exists so a future memory-mapped backend (see the optional `mmap`
//! feature) can be added without touching the parser or xref layers.

use crate::error::{PdfError, Result};

pub trait Backend: AsRef<[u8]> {}
impl Backend for Vec<u8> {}
impl<'a> Backend for &'a [u8] {}

/// Scan the first kilobyte for the `%PDF-` header comment and return its
/// byte offset (not the offset of the version digits).
pub fn locate_start_offset(buf: &[u8]) -> Result<usize> {
    let window = &buf[..buf.len().min(1024)];
    window
        .windows(5)
        .position(|w| w == b"%PDF-")
        .ok_or_else(|| PdfError::corrupt("no %PDF- header found in first 1024 bytes"))
}

/// Seek from the end for `startxref` and read the integer offset that
/// follows it.
pub fn locate_xref_offset(buf: &[u8]) -> Result<usize> {
    let tail_start = buf.len().saturating_sub(2048);
    let tail = &buf[tail_start..];
    let idx = tail
        .windows(b"startxref".len())
        .rposition(|w| w == b"startxref")
        .ok_or_else(|| PdfError::corrupt("no 'startxref' keyword found near end of file"))?;
    let after = &tail[idx + b"startxref".len()..];
    let mut lexer = crate::parser::Lexer::new(after);
    match lexer.next_token()? {
        Some(crate::parser::Token::Integer(n)) if n >= 0 => Ok(n as usize),
        other => Err(PdfError::corrupt(format!("expected integer offset after 'startxref', found {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_header_and_tail_offset() {
        let data = b"%PDF-1.7\n1 0 obj<<>>endobj\nxref\n0 1\n0000000000 65535 f \ntrailer<<>>\nstartxref\n9\n%%EOF";
        assert_eq!(locate_start_offset(data).unwrap(), 0);
        assert_eq!(locate_xref_offset(data).unwrap(), 9);
    }
}
