//! End-to-end coverage for object-stream dereference (testable scenario:
//! "a compressed object referenced by multiple indirect references must
//! dereference to byte-identical values on each access"), built on a
//! hand-assembled xref stream since classical xref sections have no type-2
//! row to describe a compressed entry.

use pdf_core::file::PdfDocument;

fn push_obj(buf: &mut Vec<u8>, offsets: &mut Vec<usize>, id: u32, body: &[u8]) {
    offsets.resize((id as usize) + 1, 0);
    offsets[id as usize] = buf.len();
    buf.extend_from_slice(format!("{} 0 obj\n", id).as_bytes());
    buf.extend_from_slice(body);
    buf.extend_from_slice(b"\nendobj\n");
}

fn xref_row(kind: u8, f2: u32, f3: u16) -> [u8; 7] {
    let mut row = [0u8; 7];
    row[0] = kind;
    row[1..5].copy_from_slice(&f2.to_be_bytes());
    row[5..7].copy_from_slice(&f3.to_be_bytes());
    row
}

/// Object 4 (a Font dict) lives compressed inside object 5's ObjStm and is
/// referenced twice from object 3's `/Resources/Font` (as `/F1` and `/F2`).
/// The whole xref is a single xref stream (object 7), since classical xref
/// sections cannot describe a compressed (type-2) entry.
fn build_compressed_font_pdf() -> Vec<u8> {
    let mut buf = Vec::new();
    let mut offsets: Vec<usize> = Vec::new();
    buf.extend_from_slice(b"%PDF-1.5\n");

    push_obj(&mut buf, &mut offsets, 1, b"<< /Type /Catalog /Pages 2 0 R >>");
    push_obj(&mut buf, &mut offsets, 2, b"<< /Type /Pages /Kids [3 0 R] /Count 1 >>");
    push_obj(
        &mut buf,
        &mut offsets,
        3,
        b"<< /Type /Page /Parent 2 0 R /MediaBox [0 0 200 200] \
          /Resources << /Font << /F1 4 0 R /F2 4 0 R >> >> /Contents 6 0 R >>",
    );

    let font_dict = b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>";
    let header = b"4 0 "; // one (objNr, relOffset) pair
    let mut payload = Vec::new();
    payload.extend_from_slice(header);
    payload.extend_from_slice(font_dict);
    let objstm_dict = format!("<< /Type /ObjStm /N 1 /First {} /Length {} >>", header.len(), payload.len());
    let mut objstm_body = objstm_dict.into_bytes();
    objstm_body.extend_from_slice(b"\nstream\n");
    objstm_body.extend_from_slice(&payload);
    objstm_body.extend_from_slice(b"\nendstream");
    push_obj(&mut buf, &mut offsets, 5, &objstm_body);

    let content = b"BT /F1 12 Tf 72 100 Td (hi) Tj ET";
    let content_body = format!("<< /Length {} >>\nstream\n{}\nendstream", content.len(), std::str::from_utf8(content).unwrap());
    push_obj(&mut buf, &mut offsets, 6, content_body.as_bytes());

    // Object 7 is the xref stream itself; reserve its offset before encoding
    // the rows, since it must describe its own position.
    let xref_obj_offset = buf.len();

    let mut rows = Vec::new();
    rows.extend_from_slice(&xref_row(0, 0, 65535)); // id 0: free, head
    rows.extend_from_slice(&xref_row(1, offsets[1] as u32, 0));
    rows.extend_from_slice(&xref_row(1, offsets[2] as u32, 0));
    rows.extend_from_slice(&xref_row(1, offsets[3] as u32, 0));
    rows.extend_from_slice(&xref_row(2, 5, 0)); // id 4: compressed in obj 5, index 0
    rows.extend_from_slice(&xref_row(1, offsets[5] as u32, 0));
    rows.extend_from_slice(&xref_row(1, offsets[6] as u32, 0));
    rows.extend_from_slice(&xref_row(1, xref_obj_offset as u32, 0));

    let xref_dict = format!(
        "<< /Type /XRef /Size 8 /W [1 4 2] /Root 1 0 R /Index [0 8] /Length {} >>",
        rows.len()
    );
    buf.extend_from_slice(b"7 0 obj\n");
    buf.extend_from_slice(xref_dict.as_bytes());
    buf.extend_from_slice(b"\nstream\n");
    buf.extend_from_slice(&rows);
    buf.extend_from_slice(b"\nendstream\nendobj\n");

    buf.extend_from_slice(format!("startxref\n{}\n%%EOF", xref_obj_offset).as_bytes());
    buf
}

#[test]
fn compressed_object_dereferences_consistently_across_references() {
    let doc = PdfDocument::parse(build_compressed_font_pdf()).unwrap();
    let page = doc.page(0, false).unwrap();
    let fonts = page.resources.get("Font").unwrap().as_dict().unwrap();

    let f1 = fonts.get("F1").unwrap().as_reference().unwrap();
    let f2 = fonts.get("F2").unwrap().as_reference().unwrap();
    assert_eq!(f1.id, f2.id);

    let v1 = doc.storage().resolve(f1).unwrap();
    let v2 = doc.storage().resolve(f2).unwrap();
    assert_eq!(v1, v2);
    let dict = v1.into_dictionary().unwrap();
    assert_eq!(dict.get("BaseFont").unwrap().as_name().unwrap(), "Helvetica");
}

#[test]
fn compressed_object_survives_full_rewrite() {
    let mut doc = PdfDocument::parse(build_compressed_font_pdf()).unwrap();
    let written = doc.write(pdf_core::file::WriteOptions::default()).unwrap();
    let reparsed = PdfDocument::parse(written).unwrap();
    let page = reparsed.page(0, false).unwrap();
    let fonts = page.resources.get("Font").unwrap().as_dict().unwrap();
    let f1 = fonts.get("F1").unwrap().as_reference().unwrap();
    let dict = reparsed.storage().resolve(f1).unwrap().into_dictionary().unwrap();
    assert_eq!(dict.get("BaseFont").unwrap().as_name().unwrap(), "Helvetica");
}
