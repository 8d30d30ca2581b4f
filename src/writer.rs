//! Serializing a document context back into PDF bytes: header + body +
//! xref (classical table or xref stream) + trailer + `startxref`
//! emission. Since the CORE's object model is value-based, there is no
//! typed per-object-kind write dispatch: every in-use (or compressed,
//! expanded in place) entry is resolved to a `Primitive` and serialized
//! generically via `Primitive::serialize`.

use crate::error::Result;
use crate::file::{PdfDocument, WriteOptions};
use crate::object::pagetree::CancellationToken;
use crate::object::Resolve;
use crate::primitive::{Dictionary, PdfString, PlainRef, Primitive};
use crate::xref::XRefEntry;
use std::io::Write as _;

/// Emit `document`'s current state as a full, self-contained rewrite: every
/// non-free object number in object-number order, a fresh xref section, and
/// a trailer. Matches the writer algorithm of §4.7 for the non-incremental
/// case; `opts.incremental` selects the append-only variant instead.
pub fn write(document: &mut PdfDocument<Vec<u8>>, opts: &WriteOptions, cancel: &CancellationToken) -> Result<Vec<u8>> {
    document.storage_mut().xref_mut().ensure_valid_free_list_cancellable(cancel)?;

    if opts.incremental {
        return write_incremental(document, opts, cancel);
    }

    let mut out = Vec::new();
    write_header(&mut out, document)?;

    let size = document.storage().xref().size();
    debug!("writing full rewrite, {} object slots", size);
    let mut offsets = vec![0usize; size as usize];
    for id in 1..size {
        cancel.check()?;
        let (gen, value) = match document.storage().xref().find(id) {
            None | Some(XRefEntry::Free { .. }) => continue,
            Some(XRefEntry::InUse { gen, .. }) => (gen, document.storage().resolve(PlainRef { id, gen })?),
            // Compressed objects have no generation of their own; expanding
            // them into a plain in-use object loses the packing but keeps
            // their content retrievable at the same object number, which is
            // all the roundtrip property requires.
            Some(XRefEntry::Compressed { .. }) => (0, document.storage().resolve(PlainRef { id, gen: 0 })?),
        };
        offsets[id as usize] = out.len();
        write_object(&mut out, id, gen, value)?;
    }

    let xref_offset = out.len();
    if opts.xref_stream {
        document.storage().xref().validate_version("xref streams", 1.5)?;
        write_xref_stream(&mut out, document, &offsets, None, xref_offset)?;
    } else {
        write_classical_xref(&mut out, document, &offsets)?;
        write_trailer(&mut out, document, document.storage().xref().size(), None)?;
    }
    write_tail(&mut out, xref_offset)?;
    Ok(out)
}

/// Append-only variant: write only the objects staged as in-memory changes
/// since parse, followed by a new xref section whose `/Prev` points at the
/// input's own xref offset, then the original bytes are prepended so the
/// result is a standalone file.
fn write_incremental(document: &mut PdfDocument<Vec<u8>>, opts: &WriteOptions, cancel: &CancellationToken) -> Result<Vec<u8>> {
    let previous_xref_offset = crate::backend::locate_xref_offset(document.storage().raw_bytes())?;
    let mut out = document.storage().raw_bytes().to_vec();
    if !out.ends_with(b"\n") {
        out.push(b'\n');
    }

    let changed_ids = document.storage().changed_object_ids();
    let size = document.storage().xref().size();
    let mut offsets = std::collections::HashMap::new();
    for id in changed_ids {
        cancel.check()?;
        let gen = match document.storage().xref().find(id) {
            Some(XRefEntry::InUse { gen, .. }) => gen,
            _ => 0,
        };
        let value = document.storage().resolve(PlainRef { id, gen })?;
        offsets.insert(id, out.len());
        write_object(&mut out, id, gen, value)?;
    }

    let xref_offset = out.len();
    if opts.xref_stream {
        document.storage().xref().validate_version("xref streams", 1.5)?;
        write_xref_stream_sparse(&mut out, document, &offsets, size, Some(previous_xref_offset), xref_offset)?;
    } else {
        write_classical_xref_sparse(&mut out, &offsets)?;
        write_trailer(&mut out, document, size, Some(previous_xref_offset))?;
    }
    write_tail(&mut out, xref_offset)?;
    Ok(out)
}

fn write_header(out: &mut Vec<u8>, document: &PdfDocument<Vec<u8>>) -> Result<()> {
    writeln!(out, "%PDF-{:.1}", document.storage().xref().header_version)?;
    out.extend_from_slice(b"%\xE2\xE3\xCF\xD3\n");
    Ok(())
}

fn write_tail(out: &mut Vec<u8>, xref_offset: usize) -> Result<()> {
    writeln!(out, "startxref")?;
    writeln!(out, "{}", xref_offset)?;
    out.extend_from_slice(b"%%EOF");
    Ok(())
}

fn write_object(out: &mut Vec<u8>, id: u32, gen: u16, value: Primitive) -> Result<()> {
    write!(out, "{} {} obj\n", id, gen)?;
    match value {
        Primitive::Stream(mut s) => {
            s.info.insert("Length", Primitive::Integer(s.data.len() as i64));
            s.serialize(out)?;
        }
        other => other.serialize(out)?,
    }
    out.extend_from_slice(b"\nendobj\n");
    Ok(())
}

fn write_classical_xref(out: &mut Vec<u8>, document: &PdfDocument<Vec<u8>>, offsets: &[usize]) -> Result<()> {
    let xref = document.storage().xref();
    let size = xref.size();
    writeln!(out, "xref")?;
    writeln!(out, "0 {}", size)?;
    for id in 0..size {
        write_classical_entry(out, xref.find(id), offsets.get(id as usize).copied().unwrap_or(0))?;
    }
    Ok(())
}

fn write_classical_entry(out: &mut Vec<u8>, entry: Option<XRefEntry>, offset: usize) -> Result<()> {
    match entry {
        Some(XRefEntry::Free { next, gen }) => write!(out, "{:010} {:05} f \n", next, gen)?,
        Some(XRefEntry::InUse { gen, .. }) => write!(out, "{:010} {:05} n \n", offset, gen)?,
        Some(XRefEntry::Compressed { .. }) => write!(out, "{:010} {:05} n \n", offset, 0)?,
        None => write!(out, "{:010} {:05} f \n", 0, 65535)?,
    }
    Ok(())
}

/// Classical xref section covering only the sparse set of changed ids, laid
/// out as one subsection per maximal run of consecutive object numbers (the
/// form an incremental update is expected to take).
fn write_classical_xref_sparse(out: &mut Vec<u8>, offsets: &std::collections::HashMap<u32, usize>) -> Result<()> {
    let mut ids: Vec<u32> = offsets.keys().copied().collect();
    ids.sort_unstable();
    writeln!(out, "xref")?;
    let mut i = 0;
    while i < ids.len() {
        let start = ids[i];
        let mut j = i;
        while j + 1 < ids.len() && ids[j + 1] == ids[j] + 1 {
            j += 1;
        }
        writeln!(out, "{} {}", start, j - i + 1)?;
        for id in &ids[i..=j] {
            write!(out, "{:010} {:05} n \n", offsets[id], 0)?;
        }
        i = j + 1;
    }
    Ok(())
}

fn write_trailer(out: &mut Vec<u8>, document: &PdfDocument<Vec<u8>>, size: u32, prev: Option<usize>) -> Result<()> {
    let trailer = build_trailer_dict(document, size, prev);
    writeln!(out, "trailer")?;
    Primitive::Dictionary(trailer).serialize(out)?;
    writeln!(out)?;
    Ok(())
}

fn build_trailer_dict(document: &PdfDocument<Vec<u8>>, size: u32, prev: Option<usize>) -> Dictionary {
    let mut trailer = Dictionary::new();
    trailer.insert("Size", Primitive::Integer(size as i64));
    trailer.insert("Root", Primitive::Reference(document.catalog_ref()));
    if let Some(info) = document.trailer().get("Info") {
        trailer.insert("Info", info.clone());
    }
    let id = document.trailer().get("ID").cloned().unwrap_or_else(|| generate_id(document));
    trailer.insert("ID", id);
    if let Some(p) = prev {
        trailer.insert("Prev", Primitive::Integer(p as i64));
    }
    trailer
}

/// A fresh `/ID` pair, per the common writer convention of hashing the
/// document size and current time when the input carried none (a properly
/// incremental update would instead keep the original first element; the
/// CORE only reaches this path for documents that never had an `/ID`).
fn generate_id(document: &PdfDocument<Vec<u8>>) -> Primitive {
    let mut ctx = md5::Context::new();
    ctx.consume(document.storage().xref().size().to_be_bytes());
    if let Ok(elapsed) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        ctx.consume(elapsed.as_nanos().to_be_bytes());
    }
    let digest: [u8; 16] = *ctx.compute();
    let bytes = digest.to_vec();
    Primitive::Array(vec![Primitive::String(PdfString::new(bytes.clone())), Primitive::String(PdfString::new(bytes))])
}

/// Emit the xref as an xref stream (`/Type /XRef`) covering every object
/// number, `W = [1 4 2]` (kind byte, 4-byte offset/container, 2-byte
/// gen/index), plus one more row for the stream object itself: an xref
/// stream describes its own position, so it claims the next free object
/// number and `/Size` counts it.
fn write_xref_stream(out: &mut Vec<u8>, document: &PdfDocument<Vec<u8>>, offsets: &[usize], prev: Option<usize>, self_offset: usize) -> Result<()> {
    let xref = document.storage().xref();
    let size = xref.size();
    let mut rows = Vec::with_capacity((size as usize + 1) * 7);
    for id in 0..size {
        encode_xref_row(&mut rows, xref.find(id), offsets.get(id as usize).copied().unwrap_or(0));
    }
    encode_xref_row(&mut rows, Some(XRefEntry::InUse { offset: self_offset, gen: 0 }), self_offset);
    write_xref_stream_object(out, document, rows, size + 1, vec![0, (size + 1) as i64], prev)
}

fn write_xref_stream_sparse(
    out: &mut Vec<u8>,
    document: &PdfDocument<Vec<u8>>,
    offsets: &std::collections::HashMap<u32, usize>,
    size: u32,
    prev: Option<usize>,
    self_offset: usize,
) -> Result<()> {
    let xref = document.storage().xref();
    let mut ids: Vec<u32> = offsets.keys().copied().collect();
    ids.sort_unstable();
    let mut index = Vec::new();
    let mut rows = Vec::with_capacity((ids.len() + 1) * 7);
    let mut i = 0;
    while i < ids.len() {
        let start = ids[i];
        let mut j = i;
        while j + 1 < ids.len() && ids[j + 1] == ids[j] + 1 {
            j += 1;
        }
        index.push(start as i64);
        index.push((j - i + 1) as i64);
        for id in &ids[i..=j] {
            encode_xref_row(&mut rows, xref.find(*id), offsets[id]);
        }
        i = j + 1;
    }
    index.push(size as i64);
    index.push(1);
    encode_xref_row(&mut rows, Some(XRefEntry::InUse { offset: self_offset, gen: 0 }), self_offset);
    write_xref_stream_object(out, document, rows, size + 1, index, prev)
}

fn encode_xref_row(rows: &mut Vec<u8>, entry: Option<XRefEntry>, offset: usize) {
    match entry {
        Some(XRefEntry::Free { next, gen }) => {
            rows.push(0);
            rows.extend_from_slice(&(next as u32).to_be_bytes());
            rows.extend_from_slice(&gen.to_be_bytes());
        }
        Some(XRefEntry::InUse { gen, .. }) => {
            rows.push(1);
            rows.extend_from_slice(&(offset as u32).to_be_bytes());
            rows.extend_from_slice(&gen.to_be_bytes());
        }
        Some(XRefEntry::Compressed { .. }) => {
            rows.push(1);
            rows.extend_from_slice(&(offset as u32).to_be_bytes());
            rows.extend_from_slice(&0u16.to_be_bytes());
        }
        None => {
            rows.push(0);
            rows.extend_from_slice(&0u32.to_be_bytes());
            rows.extend_from_slice(&65535u16.to_be_bytes());
        }
    }
}

fn write_xref_stream_object(
    out: &mut Vec<u8>,
    document: &PdfDocument<Vec<u8>>,
    rows: Vec<u8>,
    size: u32,
    index: Vec<i64>,
    prev: Option<usize>,
) -> Result<()> {
    let compressed = crate::enc::encode(&rows, &crate::enc::StreamFilter::FlateDecode(Default::default()))?;
    let mut dict = build_trailer_dict(document, size, prev);
    dict.insert("Type", Primitive::name("XRef"));
    dict.insert("W", Primitive::Array(vec![Primitive::Integer(1), Primitive::Integer(4), Primitive::Integer(2)]));
    dict.insert("Index", Primitive::Array(index.into_iter().map(Primitive::Integer).collect()));
    dict.insert("Filter", Primitive::name("FlateDecode"));
    dict.insert("Length", Primitive::Integer(compressed.len() as i64));
    let stream = crate::primitive::PdfStream { info: dict, data: compressed };
    // `size` already counts this object itself, so its own id is size - 1.
    let xref_obj_id = size - 1;
    write!(out, "{} 0 obj\n", xref_obj_id)?;
    stream.serialize(out)?;
    out.extend_from_slice(b"\nendobj\n");
    Ok(())
}
