use pdf_core::file::PdfDocument;

#[test]
fn rejects_missing_header() {
    assert!(PdfDocument::parse(b"startxref\n0\n%%EOF".as_ref()).is_err());
}

#[test]
fn rejects_missing_startxref() {
    assert!(PdfDocument::parse(b"%PDF-1.4\n1 0 obj\n<< >>\nendobj\n".as_ref()).is_err());
}

#[test]
fn reconstructs_from_linear_scan_when_startxref_is_unreadable() {
    // No xref section and no startxref keyword at all; the catalog and
    // pages are still findable by scanning for `N G obj` headers.
    let data = b"%PDF-1.4\n\
                 1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n\
                 2 0 obj\n<< /Type /Pages /Kids [3 0 R] /Count 1 >>\nendobj\n\
                 3 0 obj\n<< /Type /Page /Parent 2 0 R /MediaBox [0 0 200 200] >>\nendobj\n";
    let doc = PdfDocument::parse(data.as_ref()).unwrap();
    assert_eq!(doc.num_pages().unwrap(), 1);
    let page = doc.page(0, false).unwrap();
    assert_eq!(page.media_box, [0.0, 0.0, 200.0, 200.0]);
}

#[test]
fn dangling_root_reference_fails_lazily_on_catalog_access() {
    // Parsing only locates the xref table and tentatively peeks at the
    // catalog to pick up a possible /Version override; a dangling /Root
    // doesn't fail parse itself, only the first real access to it.
    let data = b"%PDF-1.4\nxref\n0 1\n0000000000 65535 f \ntrailer\n<< /Size 1 /Root 5 0 R >>\nstartxref\n9\n%%EOF";
    let doc = PdfDocument::parse(data.as_ref()).unwrap();
    assert!(doc.catalog().is_err());
}
