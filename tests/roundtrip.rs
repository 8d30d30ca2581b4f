//! Whole-document round-trip tests against small PDF fixtures built
//! in-process (no external corpus is vendored).

use pdf_core::file::{PdfDocument, WriteOptions};
use pdf_core::primitive::Primitive;

/// A one-page document: Catalog -> Pages -> Page -> Contents, plus a Font
/// resource. Built by appending objects and recording their offsets as we
/// go, so the xref table is always consistent with what was actually
/// written.
fn build_minimal_pdf(version: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut offsets = Vec::new();

    buf.extend_from_slice(format!("%PDF-{}\n", version).as_bytes());

    let mut push_obj = |buf: &mut Vec<u8>, offsets: &mut Vec<usize>, body: &str| {
        offsets.push(buf.len());
        buf.extend_from_slice(body.as_bytes());
    };

    push_obj(&mut buf, &mut offsets, "1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n");
    push_obj(&mut buf, &mut offsets, "2 0 obj\n<< /Type /Pages /Kids [3 0 R] /Count 1 >>\nendobj\n");
    push_obj(
        &mut buf,
        &mut offsets,
        "3 0 obj\n<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Resources << /Font << /F1 5 0 R >> >> /Contents 4 0 R >>\nendobj\n",
    );
    let content = "BT /F1 12 Tf 72 712 Td (Hello) Tj ET";
    push_obj(&mut buf, &mut offsets, &format!("4 0 obj\n<< /Length {} >>\nstream\n{}\nendstream\nendobj\n", content.len(), content));
    push_obj(&mut buf, &mut offsets, "5 0 obj\n<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>\nendobj\n");

    let xref_offset = buf.len();
    buf.extend_from_slice(format!("xref\n0 {}\n", offsets.len() + 1).as_bytes());
    buf.extend_from_slice(b"0000000000 65535 f \n");
    for off in &offsets {
        buf.extend_from_slice(format!("{:010} 00000 n \n", off).as_bytes());
    }
    buf.extend_from_slice(format!("trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF", offsets.len() + 1, xref_offset).as_bytes());
    buf
}

/// A two-page variant (distinct Page objects sharing one Pages node), used
/// to exercise `extract_pages` meaningfully.
fn build_two_page_pdf() -> Vec<u8> {
    let mut buf = Vec::new();
    let mut offsets = Vec::new();
    buf.extend_from_slice(b"%PDF-1.4\n");

    let mut push_obj = |buf: &mut Vec<u8>, offsets: &mut Vec<usize>, body: &str| {
        offsets.push(buf.len());
        buf.extend_from_slice(body.as_bytes());
    };

    push_obj(&mut buf, &mut offsets, "1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n");
    push_obj(&mut buf, &mut offsets, "2 0 obj\n<< /Type /Pages /Kids [3 0 R 4 0 R] /Count 2 >>\nendobj\n");
    push_obj(&mut buf, &mut offsets, "3 0 obj\n<< /Type /Page /Parent 2 0 R /MediaBox [0 0 300 300] /Annots [6 0 R] >>\nendobj\n");
    push_obj(&mut buf, &mut offsets, "4 0 obj\n<< /Type /Page /Parent 2 0 R /MediaBox [0 0 400 400] >>\nendobj\n");
    push_obj(&mut buf, &mut offsets, "5 0 obj\n<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>\nendobj\n");
    push_obj(&mut buf, &mut offsets, "6 0 obj\n<< /Type /Annot /Subtype /Link >>\nendobj\n");

    let xref_offset = buf.len();
    buf.extend_from_slice(format!("xref\n0 {}\n", offsets.len() + 1).as_bytes());
    buf.extend_from_slice(b"0000000000 65535 f \n");
    for off in &offsets {
        buf.extend_from_slice(format!("{:010} 00000 n \n", off).as_bytes());
    }
    buf.extend_from_slice(format!("trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF", offsets.len() + 1, xref_offset).as_bytes());
    buf
}

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn parses_minimal_document() {
    init_log();
    let doc = PdfDocument::parse(build_minimal_pdf("1.4")).unwrap();
    assert_eq!(doc.num_pages().unwrap(), 1);
    let page = doc.page(0, false).unwrap();
    assert_eq!(page.media_box, [0.0, 0.0, 612.0, 792.0]);
    assert_eq!(page.rotate, 0);
}

#[test]
fn resource_consolidation_keeps_only_referenced_names() {
    let doc = PdfDocument::parse(build_minimal_pdf("1.4")).unwrap();
    let page = doc.page(0, true).unwrap();
    assert!(page.resources.get("Font").is_some());
    let names = page.referenced_resource_names(doc.storage()).unwrap();
    assert!(names.font.contains("F1"));
}

#[test]
fn full_rewrite_roundtrips_page_count_and_media_box() {
    let mut doc = PdfDocument::parse(build_minimal_pdf("1.4")).unwrap();
    let written = doc.write(WriteOptions::default()).unwrap();

    let reparsed = PdfDocument::parse(written).unwrap();
    assert_eq!(reparsed.num_pages().unwrap(), 1);
    let page = reparsed.page(0, false).unwrap();
    assert_eq!(page.media_box, [0.0, 0.0, 612.0, 792.0]);
}

#[test]
fn xref_stream_rewrite_is_readable() {
    // xref streams require an effective version >= 1.5.
    let mut doc = PdfDocument::parse(build_minimal_pdf("1.7")).unwrap();
    let written = doc.write(WriteOptions { incremental: false, xref_stream: true }).unwrap();

    let reparsed = PdfDocument::parse(written).unwrap();
    assert_eq!(reparsed.num_pages().unwrap(), 1);
}

#[test]
fn xref_stream_rejected_below_declared_version() {
    let mut doc = PdfDocument::parse(build_minimal_pdf("1.3")).unwrap();
    let err = doc.write(WriteOptions { incremental: false, xref_stream: true });
    assert!(err.is_err());
}

#[test]
fn incremental_write_appends_and_roundtrips() {
    let mut doc = PdfDocument::parse(build_minimal_pdf("1.4")).unwrap();
    let original_len = doc.storage().raw_bytes().len();

    let page = doc.page(0, false).unwrap();
    let mut dict = page.dict.clone();
    dict.insert("Rotate", Primitive::Integer(90));
    doc.storage_mut().update(page.indirect_ref.id, Primitive::Dictionary(dict));

    let written = doc.write(WriteOptions { incremental: true, xref_stream: false }).unwrap();
    assert!(written.len() > original_len);

    let reparsed = PdfDocument::parse(written).unwrap();
    let page = reparsed.page(0, false).unwrap();
    assert_eq!(page.rotate, 90);
}

#[test]
fn extract_pages_reduces_to_selected_page() {
    let mut doc = PdfDocument::parse(build_two_page_pdf()).unwrap();
    assert_eq!(doc.num_pages().unwrap(), 2);

    // page 0 (object 3) carries /Annots; selecting only it exercises both
    // the Kids/Count rewrite and the Annots drop.
    doc.extract_pages(&[0]).unwrap();
    let written = doc.write(WriteOptions::default()).unwrap();

    let reparsed = PdfDocument::parse(written).unwrap();
    assert_eq!(reparsed.num_pages().unwrap(), 1);
    let page = reparsed.page(0, false).unwrap();
    assert_eq!(page.media_box, [0.0, 0.0, 300.0, 300.0]);
    assert!(page.dict.get("Annots").is_none());
}
