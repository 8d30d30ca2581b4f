//! The PDF value sum type and its dictionary/string/stream helpers.
//!
//! The CORE talks to values and dictionaries directly rather than through
//! a typed, derive-macro-backed object schema (that machinery mainly
//! exists to map fonts/annotations/colorspaces, which are out of scope
//! here).

use crate::error::{bail, PdfError, Result};
use itertools::Itertools;
use std::collections::{btree_map, BTreeMap};
use std::fmt;
use std::io;
use std::ops::Deref;

/// An indirect reference: (object number, generation number).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlainRef {
    pub id: u32,
    pub gen: u16,
}

/// The closed sum type of PDF values.
#[derive(Clone, Debug, PartialEq)]
pub enum Primitive {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Name(String),
    String(PdfString),
    Array(Vec<Primitive>),
    Dictionary(Dictionary),
    Stream(PdfStream),
    Reference(PlainRef),
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Primitive::Null => write!(f, "null"),
            Primitive::Boolean(b) => write!(f, "{}", b),
            Primitive::Integer(i) => write!(f, "{}", i),
            Primitive::Real(n) => write!(f, "{}", n),
            Primitive::Name(s) => write!(f, "/{}", s),
            Primitive::String(s) => write!(f, "{:?}", s),
            Primitive::Array(a) => write!(f, "[{}]", a.iter().format(" ")),
            Primitive::Dictionary(d) => write!(f, "{}", d),
            Primitive::Stream(_) => write!(f, "stream"),
            Primitive::Reference(r) => write!(f, "{} {} R", r.id, r.gen),
        }
    }
}

impl Primitive {
    pub fn name(s: impl Into<String>) -> Primitive {
        Primitive::Name(s.into())
    }

    pub fn get_debug_name(&self) -> &'static str {
        match self {
            Primitive::Null => "Null",
            Primitive::Boolean(..) => "Boolean",
            Primitive::Integer(..) => "Integer",
            Primitive::Real(..) => "Real",
            Primitive::Name(..) => "Name",
            Primitive::String(..) => "String",
            Primitive::Array(..) => "Array",
            Primitive::Dictionary(..) => "Dictionary",
            Primitive::Stream(..) => "Stream",
            Primitive::Reference(..) => "Reference",
        }
    }

    fn unexpected(&self, expected: &'static str) -> PdfError {
        PdfError::corrupt(format!("expected {}, found {}", expected, self.get_debug_name()))
    }

    pub fn as_integer(&self) -> Result<i64> {
        match *self {
            Primitive::Integer(i) => Ok(i),
            ref p => Err(p.unexpected("Integer")),
        }
    }
    pub fn as_u32(&self) -> Result<u32> {
        match *self {
            Primitive::Integer(i) if i >= 0 => Ok(i as u32),
            Primitive::Integer(_) => bail!("negative integer where unsigned expected"),
            ref p => Err(p.unexpected("Integer")),
        }
    }
    pub fn as_usize(&self) -> Result<usize> {
        self.as_u32().map(|v| v as usize)
    }
    pub fn as_real(&self) -> Result<f64> {
        match *self {
            Primitive::Integer(i) => Ok(i as f64),
            Primitive::Real(f) => Ok(f),
            ref p => Err(p.unexpected("Real")),
        }
    }
    pub fn as_bool(&self) -> Result<bool> {
        match *self {
            Primitive::Boolean(b) => Ok(b),
            ref p => Err(p.unexpected("Boolean")),
        }
    }
    pub fn as_name(&self) -> Result<&str> {
        match self {
            Primitive::Name(s) => Ok(s.as_str()),
            p => Err(p.unexpected("Name")),
        }
    }
    pub fn as_string(&self) -> Result<&PdfString> {
        match self {
            Primitive::String(s) => Ok(s),
            p => Err(p.unexpected("String")),
        }
    }
    pub fn as_array(&self) -> Result<&[Primitive]> {
        match self {
            Primitive::Array(v) => Ok(v),
            p => Err(p.unexpected("Array")),
        }
    }
    pub fn as_dict(&self) -> Result<&Dictionary> {
        match self {
            Primitive::Dictionary(d) => Ok(d),
            p => Err(p.unexpected("Dictionary")),
        }
    }
    pub fn as_reference(&self) -> Result<PlainRef> {
        match self {
            Primitive::Reference(r) => Ok(*r),
            p => Err(p.unexpected("Reference")),
        }
    }
    pub fn into_array(self) -> Result<Vec<Primitive>> {
        match self {
            Primitive::Array(v) => Ok(v),
            p => Err(p.unexpected("Array")),
        }
    }
    pub fn into_dictionary(self) -> Result<Dictionary> {
        match self {
            Primitive::Dictionary(d) => Ok(d),
            Primitive::Stream(s) => Ok(s.info),
            p => Err(p.unexpected("Dictionary")),
        }
    }
    pub fn into_name(self) -> Result<String> {
        match self {
            Primitive::Name(s) => Ok(s),
            p => Err(p.unexpected("Name")),
        }
    }
    pub fn into_string(self) -> Result<PdfString> {
        match self {
            Primitive::String(s) => Ok(s),
            p => Err(p.unexpected("String")),
        }
    }
    pub fn into_stream(self) -> Result<PdfStream> {
        match self {
            Primitive::Stream(s) => Ok(s),
            p => Err(p.unexpected("Stream")),
        }
    }

    /// Normalized byte encoding, per the object model's encode-to-bytes operation.
    pub fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        match self {
            Primitive::Null => write!(out, "null")?,
            Primitive::Boolean(b) => write!(out, "{}", b)?,
            Primitive::Integer(i) => write!(out, "{}", i)?,
            Primitive::Real(n) => write!(out, "{}", format_real(*n))?,
            Primitive::Name(s) => serialize_name(s, out)?,
            Primitive::String(s) => s.serialize(out)?,
            Primitive::Array(arr) => {
                write!(out, "[")?;
                for (i, p) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(out, " ")?;
                    }
                    p.serialize(out)?;
                }
                write!(out, "]")?;
            }
            Primitive::Dictionary(d) => d.serialize(out)?,
            Primitive::Stream(s) => s.serialize(out)?,
            Primitive::Reference(r) => write!(out, "{} {} R", r.id, r.gen)?,
        }
        Ok(())
    }
}

/// Minimal-digits round-trippable real formatting (no trailing zeros, no
/// exponent notation, since PDF numbers never use scientific notation).
fn format_real(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        let s = format!("{}", n);
        s
    }
}

/// Escape bytes outside the printable ASCII set as `#hh`; names always
/// serialize uppercase-hex escaped.
pub fn serialize_name(s: &str, out: &mut impl io::Write) -> Result<()> {
    write!(out, "/")?;
    for &b in s.as_bytes() {
        match b {
            b'!'..=b'~' if b != b'#' && b != b'/' && b != b'(' && b != b')' && b != b'<' && b != b'>'
                && b != b'[' && b != b']' && b != b'{' && b != b'}' && b != b'%' =>
            {
                out.write_all(&[b])?;
            }
            _ => write!(out, "#{:02X}", b)?,
        }
    }
    Ok(())
}

/// A PDF name, borrowed.
#[derive(Debug)]
pub struct Name<'a>(pub &'a str);
impl<'a> Deref for Name<'a> {
    type Target = str;
    fn deref(&self) -> &str {
        self.0
    }
}

/// Dict: `BTreeMap`-backed so `encode-to-bytes` has a deterministic, stable
/// key order without needing to separately track insertion order (key
/// order inside a dict carries no semantic meaning in PDF).
#[derive(Default, Clone, PartialEq)]
pub struct Dictionary {
    map: BTreeMap<String, Primitive>,
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary { map: BTreeMap::new() }
    }
    pub fn len(&self) -> usize {
        self.map.len()
    }
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
    pub fn find(&self, key: &str) -> Option<&Primitive> {
        self.map.get(key)
    }
    pub fn get(&self, key: &str) -> Option<&Primitive> {
        self.map.get(key)
    }
    pub fn insert(&mut self, key: impl Into<String>, val: Primitive) -> Option<Primitive> {
        self.map.insert(key.into(), val)
    }
    pub fn update(&mut self, key: impl Into<String>, val: Primitive) {
        self.map.insert(key.into(), val);
    }
    pub fn delete(&mut self, key: &str) -> Option<Primitive> {
        self.map.remove(key)
    }
    pub fn remove(&mut self, key: &str) -> Option<Primitive> {
        self.map.remove(key)
    }
    pub fn require(&mut self, typ: &'static str, key: &str) -> Result<Primitive> {
        self.remove(key)
            .ok_or_else(|| PdfError::corrupt(format!("{} missing required key /{}", typ, key)))
    }
    pub fn iter(&self) -> btree_map::Iter<String, Primitive> {
        self.map.iter()
    }
    pub fn type_name(&self) -> Option<&str> {
        self.get("Type").and_then(|p| p.as_name().ok())
    }
    fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        write!(out, "<<")?;
        for (k, v) in self.iter() {
            write!(out, "/{} ", k)?;
            v.serialize(out)?;
            write!(out, " ")?;
        }
        write!(out, ">>")?;
        Ok(())
    }
}
impl Deref for Dictionary {
    type Target = BTreeMap<String, Primitive>;
    fn deref(&self) -> &BTreeMap<String, Primitive> {
        &self.map
    }
}
impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{{")?;
        for (k, v) in self {
            writeln!(f, "  /{}: {}", k, v)?;
        }
        write!(f, "}}")
    }
}
impl fmt::Display for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<<{}>>", self.iter().format_with(" ", |(k, v), f| f(&format_args!("/{} {}", k, v))))
    }
}
impl IntoIterator for Dictionary {
    type Item = (String, Primitive);
    type IntoIter = btree_map::IntoIter<String, Primitive>;
    fn into_iter(self) -> Self::IntoIter {
        self.map.into_iter()
    }
}
impl<'a> IntoIterator for &'a Dictionary {
    type Item = (&'a String, &'a Primitive);
    type IntoIter = btree_map::Iter<'a, String, Primitive>;
    fn into_iter(self) -> Self::IntoIter {
        self.map.iter()
    }
}
impl FromIterator<(String, Primitive)> for Dictionary {
    fn from_iter<I: IntoIterator<Item = (String, Primitive)>>(iter: I) -> Self {
        Dictionary { map: iter.into_iter().collect() }
    }
}

/// A dict plus a raw (possibly filter-encoded) byte payload.
#[derive(Clone, Debug, PartialEq)]
pub struct PdfStream {
    pub info: Dictionary,
    pub data: Vec<u8>,
}
impl PdfStream {
    pub fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        self.info.serialize(out)?;
        writeln!(out, "stream")?;
        out.write_all(&self.data)?;
        write!(out, "\nendstream")?;
        Ok(())
    }
}

/// A PDF string value. Byte-identity is preserved; UTF-16BE detection is
/// exposed via `to_string_lossy`/`as_str` rather than baked into storage, so
/// round-tripping through the writer never silently re-encodes a string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PdfString {
    data: Vec<u8>,
}
impl PdfString {
    pub fn new(data: Vec<u8>) -> Self {
        PdfString { data }
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
    pub fn is_utf16be(&self) -> bool {
        self.data.starts_with(&[0xFE, 0xFF])
    }
    /// Decode per the string handling invariant: `FE FF`-prefixed strings are
    /// UTF-16BE, everything else is treated as raw document-encoded bytes and
    /// is only lossily convertible to UTF-8 for diagnostics.
    pub fn to_string_lossy(&self) -> String {
        if self.is_utf16be() {
            let units: Vec<u16> = self.data[2..]
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        } else {
            String::from_utf8_lossy(&self.data).into_owned()
        }
    }
    pub fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        if self.data.iter().any(|&b| b >= 0x80) {
            write!(out, "<")?;
            for &b in &self.data {
                write!(out, "{:02X}", b)?;
            }
            write!(out, ">")?;
        } else {
            write!(out, "(")?;
            for &b in &self.data {
                if matches!(b, b'\\' | b'(' | b')') {
                    write!(out, "\\")?;
                }
                out.write_all(&[b])?;
            }
            write!(out, ")")?;
        }
        Ok(())
    }
}
impl fmt::Debug for PdfString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}
impl AsRef<[u8]> for PdfString {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf16_string_roundtrip_to_lossy() {
        let mut data = vec![0xFE, 0xFF];
        for u in "hi".encode_utf16() {
            data.extend_from_slice(&u.to_be_bytes());
        }
        let s = PdfString::new(data);
        assert!(s.is_utf16be());
        assert_eq!(s.to_string_lossy(), "hi");
    }

    #[test]
    fn name_escapes_non_printable_bytes() {
        let mut buf = Vec::new();
        serialize_name("a#b", &mut buf).unwrap();
        assert_eq!(buf, b"/a#23b");
    }

    #[test]
    fn dict_iteration_order_is_deterministic() {
        let mut d = Dictionary::new();
        d.insert("Z", Primitive::Integer(1));
        d.insert("A", Primitive::Integer(2));
        let keys: Vec<_> = d.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec!["A".to_string(), "Z".to_string()]);
    }
}
