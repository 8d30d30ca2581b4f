//! Object-stream decoding: unpacking the `N` compressed objects packed into
//! one `/Type /ObjStm` stream.
//!
//! The stream payload, once run through the filter pipeline, begins with
//! `N` whitespace-separated decimal pairs `(objNr, relativeOffset)`,
//! followed at `First` by the concatenated direct values themselves.

use crate::enc::decode_stream;
use crate::error::{PdfError, Result};
use crate::parser::{parse_value, Lexer, ParseOptions, Token};
use crate::primitive::{PdfStream, Primitive};

/// A decoded object stream: the byte offset (relative to `first`) of each
/// contained object, indexed by its position within the stream (not its
/// object number).
pub struct ObjectStream {
    decoded: Vec<u8>,
    /// (object number, relative offset) pairs, in on-disk order.
    index: Vec<(u32, usize)>,
    first: usize,
}

impl ObjectStream {
    pub fn parse(stream: &PdfStream) -> Result<ObjectStream> {
        if stream.info.type_name() != Some("ObjStm") {
            return Err(PdfError::corrupt("expected /Type /ObjStm stream"));
        }
        let n = stream
            .info
            .get("N")
            .ok_or_else(|| PdfError::corrupt("ObjStm missing /N"))?
            .as_usize()?;
        let first = stream
            .info
            .get("First")
            .ok_or_else(|| PdfError::corrupt("ObjStm missing /First"))?
            .as_usize()?;
        debug!("decoding object stream with N={}, First={}", n, first);
        let decoded = decode_stream(&stream.info, &stream.data)?;
        let mut lexer = Lexer::new(&decoded);
        let mut index = Vec::with_capacity(n);
        for _ in 0..n {
            let obj_nr = match lexer.next_token()? {
                Some(Token::Integer(v)) if v >= 0 => v as u32,
                other => return Err(PdfError::corrupt(format!("ObjStm header: expected object number, found {:?}", other))),
            };
            let offset = match lexer.next_token()? {
                Some(Token::Integer(v)) if v >= 0 => v as usize,
                other => return Err(PdfError::corrupt(format!("ObjStm header: expected offset, found {:?}", other))),
            };
            index.push((obj_nr, offset));
        }
        Ok(ObjectStream { decoded, index, first })
    }

    pub fn n_objects(&self) -> usize {
        self.index.len()
    }

    /// The object number nominally stored at slot `idx` (per the stream's
    /// own header) -- used to detect self-referential `/Extends` loops.
    pub fn object_number_at(&self, idx: usize) -> Option<u32> {
        self.index.get(idx).map(|&(id, _)| id)
    }

    /// Parse and return the `idx`th contained object as a direct value.
    pub fn get(&self, idx: usize, opts: &ParseOptions) -> Result<Primitive> {
        let (_, rel_offset) = *self
            .index
            .get(idx)
            .ok_or_else(|| PdfError::corrupt(format!("ObjStm index {} out of range (N={})", idx, self.index.len())))?;
        let start = self.first + rel_offset;
        if start > self.decoded.len() {
            return Err(PdfError::corrupt("ObjStm object offset past end of decoded stream"));
        }
        let mut lexer = Lexer::with_offset(&self.decoded, start);
        parse_value(&mut lexer, 0, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::Dictionary;

    fn build_objstm(pairs: &[(u32, &str)]) -> PdfStream {
        let mut header = String::new();
        let mut body = String::new();
        for (id, val) in pairs {
            header.push_str(&format!("{} {} ", id, body.len()));
            body.push_str(val);
            body.push(' ');
        }
        let payload = format!("{}{}", header, body);
        let mut info = Dictionary::new();
        info.insert("Type", Primitive::name("ObjStm"));
        info.insert("N", Primitive::Integer(pairs.len() as i64));
        info.insert("First", Primitive::Integer(header.len() as i64));
        PdfStream { info, data: payload.into_bytes() }
    }

    #[test]
    fn unpacks_contained_objects() {
        let stream = build_objstm(&[(5, "42"), (6, "/Foo")]);
        let objstm = ObjectStream::parse(&stream).unwrap();
        assert_eq!(objstm.n_objects(), 2);
        let opts = ParseOptions::default();
        assert_eq!(objstm.get(0, &opts).unwrap(), Primitive::Integer(42));
        assert_eq!(objstm.get(1, &opts).unwrap(), Primitive::Name("Foo".into()));
    }
}
