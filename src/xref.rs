//! The cross-reference table: object number -> storage location, plus the
//! free-list and refcounting operations needed to mutate a document in
//! memory before it is written back out.
//!
//! Entries are untyped: they point at raw byte offsets, object-stream
//! slots, or the free list. Resolving the `Primitive` behind a slot is the
//! job of whatever implements `Resolve` (see `file.rs`), since that
//! requires the backing byte source.

use crate::error::{PdfError, Result};
use crate::object::pagetree::CancellationToken;
use crate::parser::{parse_header_version, parse_indirect_object, ParseOptions};
use crate::primitive::{Dictionary, PlainRef, Primitive};
use std::collections::HashSet;

pub type ObjNr = u32;

/// A single slot in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XRefEntry {
    /// Part of the free list. `next` is the object number of the next free
    /// slot (0 terminates the chain); `gen` is the generation a future
    /// `insert_and_recycle` at this slot must use.
    Free { next: ObjNr, gen: u16 },
    /// A directly-addressable object living at a byte offset from the start
    /// of the file (or, for objects inserted in memory and not yet written,
    /// a placeholder offset alongside an override in `Storage`).
    InUse { offset: usize, gen: u16 },
    /// An object living inside an object stream's Nth slot. Compressed
    /// objects always have generation 0, so no `gen` field is carried.
    Compressed { container: ObjNr, index: u32 },
}

/// The cross-reference table for one document, merged across the whole
/// `/Prev` chain. Entries are addressed by object number; object number 0
/// is reserved by convention as the head of the free list.
#[derive(Debug, Clone)]
pub struct XRefTable {
    entries: Vec<XRefEntry>,
    refcounts: Vec<u32>,
    /// Declared `%PDF-1.N` header version.
    pub header_version: f32,
    /// `/Version` name in the document catalog, when present and higher
    /// than the header version (readers are expected to prefer it).
    pub root_version: Option<f32>,
}

impl XRefTable {
    /// An empty table of the given size, with every entry on the free list
    /// in object-number order and object 0 terminating the chain with the
    /// conventional generation 65535.
    pub fn empty(size: u32) -> XRefTable {
        let mut entries = Vec::with_capacity(size as usize);
        for i in 0..size {
            let next = if i == 0 { 0 } else { (i + 1) % size };
            let gen = if i == 0 { 65535 } else { 0 };
            entries.push(XRefEntry::Free { next, gen });
        }
        XRefTable { entries, refcounts: vec![0; size as usize], header_version: 1.7, root_version: None }
    }

    pub fn size(&self) -> u32 {
        self.entries.len() as u32
    }

    /// The effective version readers should gate feature support on: the
    /// `/Version` override if present and higher, else the header version.
    pub fn effective_version(&self) -> f32 {
        match self.root_version {
            Some(v) if v > self.header_version => v,
            _ => self.header_version,
        }
    }

    /// Fail with `UnsupportedVersion` unless the effective version is at
    /// least `since`.
    pub fn validate_version(&self, feature: &str, since: f32) -> Result<()> {
        if self.effective_version() + f32::EPSILON >= since {
            Ok(())
        } else {
            Err(PdfError::UnsupportedVersion {
                feature: feature.to_string(),
                since,
                declared: self.effective_version(),
            })
        }
    }

    pub fn find(&self, id: ObjNr) -> Option<XRefEntry> {
        self.entries.get(id as usize).copied()
    }

    fn require_slot(&self, id: ObjNr) -> Result<XRefEntry> {
        self.find(id).ok_or_else(|| PdfError::CorruptRef {
            obj_nr: id,
            gen: 0,
            detail: "object number out of range".into(),
        })
    }

    pub fn refcount(&self, id: ObjNr) -> u32 {
        self.refcounts.get(id as usize).copied().unwrap_or(0)
    }

    fn bump_refcount(&mut self, id: ObjNr, delta: i32) {
        if let Some(c) = self.refcounts.get_mut(id as usize) {
            *c = (*c as i32 + delta).max(0) as u32;
        }
    }

    /// Look up the free-list entry at `id`, failing unless it actually is
    /// free. Used by the writer and by object-recycling callers that want
    /// to confirm a slot is available before claiming it.
    pub fn free(&self, id: ObjNr) -> Result<XRefEntry> {
        match self.require_slot(id)? {
            e @ XRefEntry::Free { .. } => Ok(e),
            _ => Err(PdfError::CorruptRef { obj_nr: id, gen: 0, detail: "object is not free".into() }),
        }
    }

    /// Claim a brand new object number (extending the table by one slot)
    /// and mark it in-use at `offset` with generation 0. Returns the
    /// reference to use for it.
    pub fn insert_new(&mut self, offset: usize) -> PlainRef {
        let id = self.entries.len() as ObjNr;
        self.entries.push(XRefEntry::InUse { offset, gen: 0 });
        self.refcounts.push(0);
        PlainRef { id, gen: 0 }
    }

    /// Reuse a free slot if the free list has one besides the head (object
    /// 0), unlinking it and marking it in-use with its generation
    /// incremented by one (the PDF convention for reused object slots);
    /// otherwise fall back to a freshly-assigned object number. Either way,
    /// returns the reference to use.
    pub fn insert_and_recycle(&mut self, offset: usize) -> PlainRef {
        let head_next = match self.entries[0] {
            XRefEntry::Free { next, .. } => next,
            _ => 0,
        };
        if head_next == 0 {
            return self.insert_new(offset);
        }
        let id = head_next;
        let (next, gen) = match self.entries[id as usize] {
            XRefEntry::Free { next, gen } => (next, gen),
            _ => unreachable!("free list entry {} is not marked free", id),
        };
        if let XRefEntry::Free { next: head_n, .. } = &mut self.entries[0] {
            *head_n = next;
        }
        let new_gen = gen.saturating_add(1);
        self.entries[id as usize] = XRefEntry::InUse { offset, gen: new_gen };
        self.refcounts[id as usize] = 0;
        PlainRef { id, gen: new_gen }
    }

    /// Return an in-use object to the free list, prepending it to the
    /// chain headed by object 0 and bumping its generation so any stale
    /// reference to the old (id, gen) pair is recognizably dangling.
    pub fn free_object(&mut self, id: ObjNr) -> Result<()> {
        let gen = match self.require_slot(id)? {
            XRefEntry::InUse { gen, .. } => gen,
            XRefEntry::Compressed { .. } => {
                return Err(PdfError::CorruptRef {
                    obj_nr: id,
                    gen: 0,
                    detail: "cannot directly free a compressed object".into(),
                })
            }
            XRefEntry::Free { .. } => return Ok(()),
        };
        let head_next = match self.entries[0] {
            XRefEntry::Free { next, .. } => next,
            _ => 0,
        };
        self.entries[id as usize] = XRefEntry::Free { next: head_next, gen: gen.saturating_add(1) };
        self.entries[0] = XRefEntry::Free { next: id, gen: 65535 };
        self.refcounts[id as usize] = 0;
        Ok(())
    }

    /// Free an object and every object reachable only through it: walk the
    /// dict/array/stream-dict children of `value`, decrement each
    /// referenced object's refcount, and recursively free any child whose
    /// refcount reaches zero. `resolve` supplies the child's value so its
    /// own children can be walked in turn.
    pub fn delete_object_graph(
        &mut self,
        root: PlainRef,
        value: &Primitive,
        resolve: &mut impl FnMut(PlainRef) -> Result<Primitive>,
    ) -> Result<()> {
        let mut stack = vec![(root, value.clone())];
        let mut visited = HashSet::new();
        while let Some((r, v)) = stack.pop() {
            if !visited.insert(r.id) {
                continue;
            }
            for child in direct_children(&v) {
                self.bump_refcount(child.id, -1);
                if self.refcount(child.id) == 0 {
                    if let Ok(child_val) = resolve(child) {
                        stack.push((child, child_val));
                    }
                    self.free_object(child.id)?;
                }
            }
        }
        self.free_object(root.id)
    }

    /// Record that a reference to `target` was newly stored somewhere, for
    /// refcounting purposes. Called by the writer/mutator layer.
    pub fn add_reference(&mut self, target: ObjNr) {
        self.bump_refcount(target, 1);
    }

    /// Validate and, where necessary, rebuild the free list so it forms a
    /// single chain through every nominally-free slot, ending at object 0,
    /// as the writer requires before emitting a classical xref table. This
    /// can be needed after incremental updates recycled slots out of the
    /// order a strict reader expects.
    pub fn ensure_valid_free_list(&mut self) {
        self.ensure_valid_free_list_cancellable(&CancellationToken::new()).ok();
    }

    /// Same revalidation, but polling `cancel` once per free-list entry so a
    /// caller can bail out of a pathologically large free list.
    pub fn ensure_valid_free_list_cancellable(&mut self, cancel: &CancellationToken) -> Result<()> {
        let free_ids: Vec<ObjNr> =
            (0..self.entries.len() as ObjNr).filter(|&i| matches!(self.entries[i as usize], XRefEntry::Free { .. })).collect();
        if free_ids.is_empty() {
            return Ok(());
        }
        for w in free_ids.windows(2) {
            cancel.check()?;
            let (a, b) = (w[0], w[1]);
            if let XRefEntry::Free { gen, .. } = self.entries[a as usize] {
                self.entries[a as usize] = XRefEntry::Free { next: b, gen };
            }
        }
        let last = *free_ids.last().unwrap();
        if let XRefEntry::Free { gen, .. } = self.entries[last as usize] {
            self.entries[last as usize] = XRefEntry::Free { next: 0, gen };
        }
        if free_ids[0] != 0 && matches!(self.entries[0], XRefEntry::Free { .. }) {
            if let XRefEntry::Free { gen, .. } = self.entries[0] {
                self.entries[0] = XRefEntry::Free { next: free_ids[0], gen };
            }
        }
        Ok(())
    }

    /// Best-effort reconstruction used when the tail-anchored `startxref`
    /// chain cannot be followed at all: linearly scan every byte offset for
    /// an `N G obj` header and rebuild a table directly from what was
    /// actually found, last occurrence of an object number winning (a later
    /// physical copy of an object is assumed to be the more recent one,
    /// mirroring how incremental updates append). The trailer is recovered
    /// from the last `/Type /Catalog` dict seen, since a trailer dict itself
    /// is not a byte-addressable object this scan can find.
    ///
    /// `start_offset` is the byte offset of the `%PDF-` header; entry
    /// offsets are stored relative to it, same as a normally parsed table.
    pub fn reconstruct(buf: &[u8], start_offset: usize, opts: &ParseOptions) -> Result<(XRefTable, Dictionary)> {
        warn!("xref chain unreadable, reconstructing table via linear object scan");
        let header_version = parse_header_version(buf).unwrap_or(1.4);
        let mut table = XRefTable { entries: Vec::new(), refcounts: Vec::new(), header_version, root_version: None };
        let mut root: Option<PlainRef> = None;

        let mut pos = start_offset;
        while pos < buf.len() {
            if buf[pos].is_ascii_digit() && (pos == 0 || crate::parser::lexer::is_whitespace(buf[pos - 1])) {
                if let Ok((id, gen, value)) = parse_indirect_object(buf, pos, opts) {
                    let needed = id as usize + 1;
                    if table.entries.len() < needed {
                        table.entries.resize(needed, XRefEntry::Free { next: 0, gen: 65535 });
                        table.refcounts.resize(needed, 0);
                    }
                    table.entries[id as usize] = XRefEntry::InUse { offset: pos - start_offset, gen };
                    let dict = match &value {
                        Primitive::Dictionary(d) => Some(d),
                        Primitive::Stream(s) => Some(&s.info),
                        _ => None,
                    };
                    if dict.and_then(|d| d.type_name()) == Some("Catalog") {
                        root = Some(PlainRef { id, gen });
                    }
                }
            }
            pos += 1;
        }
        if table.entries.is_empty() {
            return Err(PdfError::corrupt("linear scan found no indirect objects to reconstruct from"));
        }
        let root = root.ok_or_else(|| PdfError::corrupt("linear scan found no /Type /Catalog object"))?;
        let mut trailer = Dictionary::new();
        trailer.insert("Size", Primitive::Integer(table.entries.len() as i64));
        trailer.insert("Root", Primitive::Reference(root));
        Ok((table, trailer))
    }

    // -- parsing -------------------------------------------------------

    /// Parse the full xref/trailer chain starting at `start_offset`,
    /// following `/Prev` links and merging sections so that entries
    /// encountered earlier in the chain (closer to the start offset, i.e.
    /// the most recently written) take precedence over ones merged in
    /// from an earlier `/Prev` section.
    pub fn parse(buf: &[u8], start_offset: usize, opts: &ParseOptions) -> Result<(XRefTable, Dictionary)> {
        let header_version = parse_header_version(buf).unwrap_or(1.4);
        let mut table = XRefTable { entries: Vec::new(), refcounts: Vec::new(), header_version, root_version: None };
        let mut seen_offsets = HashSet::new();
        let mut offset = Some(start_offset);
        let mut trailer = Dictionary::new();
        let mut first = true;
        while let Some(off) = offset {
            if !seen_offsets.insert(off) {
                warn!("cyclic /Prev chain at offset {}, stopping", off);
                break;
            }
            trace!("parsing xref section at offset {}", off);
            let (section_trailer, next) = table.parse_one_section(buf, off, opts)?;
            if first {
                for (k, v) in section_trailer.iter() {
                    trailer.insert(k.clone(), v.clone());
                }
                first = false;
            } else {
                for (k, v) in section_trailer.iter() {
                    if trailer.get(k).is_none() {
                        trailer.insert(k.clone(), v.clone());
                    }
                }
            }
            offset = next;
        }
        Ok((table, trailer))
    }

    /// Parse one `xref` section or one xref-stream object at `offset`,
    /// merging its entries into `self` (without overwriting slots already
    /// populated by an earlier, more-recent section) and returning its
    /// trailer dict plus the `/Prev` offset, if any.
    fn parse_one_section(&mut self, buf: &[u8], offset: usize, opts: &ParseOptions) -> Result<(Dictionary, Option<usize>)> {
        let window = buf.get(offset..).ok_or_else(|| PdfError::corrupt_at("xref offset past end of file", offset))?;
        let mut skip = 0;
        while window.get(skip).copied().map(crate::parser::lexer::is_whitespace).unwrap_or(false) {
            skip += 1;
        }
        if window[skip..].starts_with(b"xref") {
            self.parse_classical_section(buf, offset + skip, opts)
        } else {
            self.parse_stream_section(buf, offset, opts)
        }
    }

    fn parse_classical_section(&mut self, buf: &[u8], offset: usize, opts: &ParseOptions) -> Result<(Dictionary, Option<usize>)> {
        use crate::parser::{Lexer, Token};
        let mut lexer = Lexer::with_offset(buf, offset);
        match lexer.next_token()? {
            Some(Token::Keyword(kw)) if kw == "xref" => {}
            other => return Err(PdfError::corrupt(format!("expected 'xref', found {:?}", other))),
        }
        loop {
            let save = lexer.pos();
            match lexer.next_token()? {
                Some(Token::Keyword(kw)) if kw == "trailer" => break,
                Some(Token::Integer(start)) => {
                    let count = match lexer.next_token()? {
                        Some(Token::Integer(n)) if n >= 0 => n as u32,
                        other => return Err(PdfError::corrupt(format!("expected subsection count, found {:?}", other))),
                    };
                    let needed = start as u32 + count;
                    if self.entries.len() < needed as usize {
                        self.entries.resize(needed as usize, XRefEntry::Free { next: 0, gen: 65535 });
                        self.refcounts.resize(needed as usize, 0);
                    }
                    for i in 0..count {
                        let id = start as u32 + i;
                        let entry = parse_classical_entry(&mut lexer)?;
                        self.merge_entry(id, entry);
                    }
                }
                other => {
                    lexer.seek(save);
                    return Err(PdfError::corrupt(format!("unexpected token in xref section: {:?}", other)));
                }
            }
        }
        let mut trailer_lexer = Lexer::with_offset(buf, lexer.pos());
        let trailer = crate::parser::parse_value(&mut trailer_lexer, 0, opts)?.into_dictionary()?;
        let prev = trailer.get("Prev").and_then(|p| p.as_usize().ok());
        Ok((trailer, prev))
    }

    fn parse_stream_section(&mut self, buf: &[u8], offset: usize, opts: &ParseOptions) -> Result<(Dictionary, Option<usize>)> {
        let (_, _, value) = parse_indirect_object(buf, offset, opts)?;
        let stream = value.into_stream()?;
        let dict = stream.info.clone();
        if dict.type_name() != Some("XRef") {
            return Err(PdfError::corrupt("expected /Type /XRef stream at xref offset"));
        }
        let size = dict.get("Size").ok_or_else(|| PdfError::corrupt("xref stream missing /Size"))?.as_u32()?;
        let w: Vec<usize> = dict
            .get("W")
            .ok_or_else(|| PdfError::corrupt("xref stream missing /W"))?
            .as_array()?
            .iter()
            .map(|p| p.as_usize())
            .collect::<Result<_>>()?;
        if w.len() != 3 {
            return Err(PdfError::corrupt("xref stream /W must have 3 entries"));
        }
        let index: Vec<i64> = match dict.get("Index") {
            Some(p) => p.as_array()?.iter().map(|p| p.as_integer()).collect::<Result<_>>()?,
            None => vec![0, size as i64],
        };
        let filter = match dict.get("Filter") {
            Some(Primitive::Name(n)) => Some(crate::enc::StreamFilter::from_kind_and_params(n, &dict)?),
            Some(Primitive::Array(a)) if a.len() == 1 => Some(crate::enc::StreamFilter::from_kind_and_params(a[0].as_name()?, &dict)?),
            Some(Primitive::Array(a)) if a.is_empty() => None,
            None => None,
            Some(_) => return Err(PdfError::corrupt("unsupported /Filter shape on xref stream")),
        };
        let decoded = match filter {
            Some(f) => crate::enc::decode(&stream.data, &f)?,
            None => stream.data.clone(),
        };
        let row_len = w[0] + w[1] + w[2];
        if row_len == 0 {
            return Err(PdfError::corrupt("xref stream /W entries are all zero"));
        }
        if self.entries.len() < size as usize {
            self.entries.resize(size as usize, XRefEntry::Free { next: 0, gen: 65535 });
            self.refcounts.resize(size as usize, 0);
        }
        let mut row_iter = decoded.chunks_exact(row_len);
        for pair in index.chunks_exact(2) {
            let (start, count) = (pair[0] as u32, pair[1] as u32);
            for i in 0..count {
                let id = start + i;
                let row = match row_iter.next() {
                    Some(r) => r,
                    None => break,
                };
                let entry = parse_stream_row(row, &w)?;
                if (id as usize) < self.entries.len() {
                    self.merge_entry(id, entry);
                }
            }
        }
        let prev = dict.get("Prev").and_then(|p| p.as_usize().ok());
        Ok((dict, prev))
    }

    /// Write `entry` into slot `id` only if that slot hasn't already been
    /// populated by a more-recent section in this parse pass (the
    /// placeholder value left by `resize` marks an untouched slot).
    fn merge_entry(&mut self, id: ObjNr, entry: XRefEntry) {
        if (id as usize) >= self.entries.len() {
            self.entries.resize(id as usize + 1, XRefEntry::Free { next: 0, gen: 65535 });
            self.refcounts.resize(id as usize + 1, 0);
        }
        let untouched = matches!(self.entries[id as usize], XRefEntry::Free { next: 0, gen: 65535 });
        if untouched {
            self.entries[id as usize] = entry;
        }
    }
}

fn parse_classical_entry(lexer: &mut crate::parser::Lexer) -> Result<XRefEntry> {
    use crate::parser::Token;
    let offset = match lexer.next_token()? {
        Some(Token::Integer(n)) if n >= 0 => n as u32,
        other => return Err(PdfError::corrupt(format!("expected offset/next field, found {:?}", other))),
    };
    let gen = match lexer.next_token()? {
        Some(Token::Integer(n)) if (0..=u16::MAX as i64).contains(&n) => n as u16,
        other => return Err(PdfError::corrupt(format!("expected generation field, found {:?}", other))),
    };
    match lexer.next_token()? {
        Some(Token::Keyword(kw)) if kw == "n" => Ok(XRefEntry::InUse { offset: offset as usize, gen }),
        Some(Token::Keyword(kw)) if kw == "f" => Ok(XRefEntry::Free { next: offset, gen }),
        other => Err(PdfError::corrupt(format!("expected 'n' or 'f', found {:?}", other))),
    }
}

fn parse_stream_row(row: &[u8], w: &[usize]) -> Result<XRefEntry> {
    fn read_field(row: &[u8], pos: &mut usize, width: usize, default: u64) -> u64 {
        if width == 0 {
            return default;
        }
        let mut v: u64 = 0;
        for _ in 0..width {
            v = (v << 8) | row[*pos] as u64;
            *pos += 1;
        }
        v
    }
    let mut pos = 0;
    let kind = read_field(row, &mut pos, w[0], 1);
    let f2 = read_field(row, &mut pos, w[1], 0);
    let f3 = read_field(row, &mut pos, w[2], 0);
    match kind {
        0 => Ok(XRefEntry::Free { next: f2 as u32, gen: f3 as u16 }),
        1 => Ok(XRefEntry::InUse { offset: f2 as usize, gen: f3 as u16 }),
        2 => Ok(XRefEntry::Compressed { container: f2 as u32, index: f3 as u32 }),
        other => Err(PdfError::corrupt(format!("unknown xref stream entry type {}", other))),
    }
}

/// The set of references a dict/array/stream-dict value points at directly
/// (one level deep; used by `delete_object_graph`'s worklist walk).
fn direct_children(value: &Primitive) -> Vec<PlainRef> {
    fn walk(value: &Primitive, out: &mut Vec<PlainRef>) {
        match value {
            Primitive::Reference(r) => out.push(*r),
            Primitive::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Primitive::Dictionary(d) => d.iter().for_each(|(_, v)| walk(v, out)),
            Primitive::Stream(s) => s.info.iter().for_each(|(_, v)| walk(v, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    walk(value, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_free_chain_ends_at_zero() {
        let t = XRefTable::empty(3);
        assert_eq!(t.free(1).unwrap(), XRefEntry::Free { next: 2, gen: 0 });
        assert_eq!(t.free(2).unwrap(), XRefEntry::Free { next: 0, gen: 0 });
    }

    #[test]
    fn insert_and_recycle_bumps_generation() {
        let mut t = XRefTable::empty(3);
        let r = t.insert_and_recycle(100);
        assert_eq!(r, PlainRef { id: 1, gen: 1 });
        assert_eq!(t.find(1), Some(XRefEntry::InUse { offset: 100, gen: 1 }));
    }

    #[test]
    fn insert_and_recycle_falls_back_to_fresh_number_when_free_list_is_exhausted() {
        let mut t = XRefTable::empty(1); // only the head, no recyclable free slots
        let r = t.insert_and_recycle(200);
        assert_eq!(r, PlainRef { id: 1, gen: 0 });
        assert_eq!(t.find(1), Some(XRefEntry::InUse { offset: 200, gen: 0 }));
    }

    #[test]
    fn free_object_relinks_head() {
        let mut t = XRefTable::empty(1);
        let r = t.insert_new(50);
        assert_eq!(r.id, 1);
        t.free_object(1).unwrap();
        assert!(matches!(t.find(1), Some(XRefEntry::Free { .. })));
    }

    #[test]
    fn parses_classical_xref_section() {
        let data = b"%PDF-1.4\n1 0 obj\n<< >>\nendobj\nxref\n0 2\n0000000000 65535 f \n0000000009 00000 n \ntrailer\n<< /Size 2 /Root 1 0 R >>\n";
        let opts = ParseOptions::default();
        let (table, trailer) = XRefTable::parse(data, 27, &opts).unwrap();
        assert_eq!(table.find(1), Some(XRefEntry::InUse { offset: 9, gen: 0 }));
        assert_eq!(trailer.get("Size").unwrap().as_integer().unwrap(), 2);
    }

    #[test]
    fn validate_version_rejects_old_feature() {
        let t = XRefTable { entries: vec![], refcounts: vec![], header_version: 1.3, root_version: None };
        assert!(t.validate_version("object streams", 1.5).is_err());
        let t2 = XRefTable { entries: vec![], refcounts: vec![], header_version: 1.5, root_version: None };
        assert!(t2.validate_version("object streams", 1.5).is_ok());
    }
}
