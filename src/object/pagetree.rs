//! Page tree descent: locate a page dict by number, accumulating inherited
//! attributes, and (optionally) consolidate its resource dictionary down to
//! the names its content stream actually references.
//!
//! The descent accumulates an `InheritedAttrs` struct while walking down
//! from the root, since the object model here doesn't carry a typed,
//! already-resolved parent chain to walk back up from a given page.

use crate::content::{scan_resource_names, PageResourceNames, ResourceCategory};
use crate::enc::decode_stream;
use crate::error::{PdfError, Result};
use crate::object::{dereference, resolve_key, Resolve};
use crate::primitive::{Dictionary, PlainRef, Primitive};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation handle threaded through long traversals (page
/// tree walks, name tree scans, xref revalidation, writes), per the
/// concurrency model's cancellation requirement.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);
impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PdfError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The four inheritable page attributes, accumulated while descending.
#[derive(Debug, Clone, Default)]
pub struct InheritedAttrs {
    pub resources: Option<Primitive>,
    pub media_box: Option<[f64; 4]>,
    pub crop_box: Option<[f64; 4]>,
    pub rotate: Option<i64>,
}
impl InheritedAttrs {
    /// Fold in any locally-defined attributes from `dict`, per the
    /// descent algorithm's rule that a local `MediaBox` clears the
    /// inherited `CropBox` (a crop box is only meaningful relative to its
    /// own media box).
    fn update_from(&mut self, dict: &Dictionary, resolve: &impl Resolve) -> Result<()> {
        if let Some(v) = resolve_key(resolve, dict, "Resources")? {
            self.resources = Some(v);
        }
        if let Some(v) = resolve_key(resolve, dict, "MediaBox")? {
            self.media_box = Some(parse_rect(&v)?);
            self.crop_box = None;
        }
        if let Some(v) = resolve_key(resolve, dict, "CropBox")? {
            self.crop_box = Some(parse_rect(&v)?);
        }
        if let Some(v) = resolve_key(resolve, dict, "Rotate")? {
            self.rotate = Some(v.as_integer()?);
        }
        Ok(())
    }
}

fn parse_rect(v: &Primitive) -> Result<[f64; 4]> {
    let arr = v.as_array()?;
    if arr.len() != 4 {
        return Err(PdfError::CorruptPageTree { detail: "MediaBox/CropBox array must have 4 entries".into() });
    }
    let mut out = [0.0; 4];
    for (i, p) in arr.iter().enumerate() {
        out[i] = p.as_real()?;
    }
    Ok(out)
}

/// The result of locating a page: its dict, the indirect reference that
/// names it, and the attributes inherited from its ancestors (with any
/// local overrides already folded in).
pub struct PageLookup {
    pub dict: Dictionary,
    pub indirect_ref: PlainRef,
    pub inherited: InheritedAttrs,
}
impl PageLookup {
    /// Effective `MediaBox`, failing per the inheritance invariant if no
    /// ancestor (nor the leaf) ever defined one.
    pub fn effective_media_box(&self) -> Result<[f64; 4]> {
        self.inherited
            .media_box
            .ok_or_else(|| PdfError::CorruptPageTree { detail: "no effective MediaBox for leaf".into() })
    }
    /// Effective `CropBox`, falling back to the media box (a page with no
    /// crop box is cropped to its full media box).
    pub fn effective_crop_box(&self) -> Result<[f64; 4]> {
        match self.inherited.crop_box {
            Some(b) => Ok(b),
            None => self.effective_media_box(),
        }
    }
    /// Effective rotation, normalized to a multiple of 90 in `[0, 360)`.
    pub fn effective_rotate(&self) -> i64 {
        let r = self.inherited.rotate.unwrap_or(0);
        ((r % 360) + 360) % 360
    }
}

/// Locate page number `page_nr` (0-based) under `pages_root`, accumulating
/// inherited attributes along the descent.
pub fn page_dict(
    resolve: &impl Resolve,
    pages_root: PlainRef,
    page_nr: u32,
    cancel: &CancellationToken,
) -> Result<PageLookup> {
    let mut counter = 0u32;
    let attrs = InheritedAttrs::default();
    descend(resolve, pages_root, page_nr, &mut counter, attrs, 0, cancel)?
        .ok_or_else(|| PdfError::CorruptPageTree { detail: format!("page number {} out of range", page_nr) })
}

const MAX_PAGE_TREE_DEPTH: usize = 64;

fn descend(
    resolve: &impl Resolve,
    node_ref: PlainRef,
    page_nr: u32,
    counter: &mut u32,
    mut attrs: InheritedAttrs,
    depth: usize,
    cancel: &CancellationToken,
) -> Result<Option<PageLookup>> {
    cancel.check()?;
    if depth > MAX_PAGE_TREE_DEPTH {
        return Err(PdfError::CorruptPageTree { detail: "page tree nested too deeply (possible cycle)".into() });
    }
    let value = dereference(resolve, &Primitive::Reference(node_ref))?;
    let dict = value.into_dictionary()?;
    attrs.update_from(&dict, resolve)?;

    let kids = dict.get("Kids").cloned();
    match kids {
        None => {
            // leaf: must be a Page, or untyped (some producers omit /Type)
            if let Some(t) = dict.type_name() {
                if t != "Page" {
                    return Err(PdfError::CorruptPageTree { detail: format!("expected /Page leaf, found /{}", t) });
                }
            }
            if *counter == page_nr {
                Ok(Some(PageLookup { dict, indirect_ref: node_ref, inherited: attrs }))
            } else {
                *counter += 1;
                Ok(None)
            }
        }
        Some(kids_val) => {
            let kids_val = dereference(resolve, &kids_val)?;
            let kids = kids_val.as_array()?.to_vec();
            if let Some(count_val) = dict.get("Count") {
                let count = dereference(resolve, count_val)?.as_u32()?;
                if *counter + count <= page_nr {
                    *counter += count;
                    return Ok(None);
                }
            } else {
                return Err(PdfError::CorruptPageTree { detail: "/Pages node missing /Count".into() });
            }
            for kid in kids {
                cancel.check()?;
                let kid_ref = kid.as_reference().map_err(|_| PdfError::CorruptPageTree {
                    detail: "page tree kid is not an indirect reference".into(),
                })?;
                if let Some(found) = descend(resolve, kid_ref, page_nr, counter, attrs.clone(), depth + 1, cancel)? {
                    return Ok(Some(found));
                }
            }
            Ok(None)
        }
    }
}

/// Count the `Page`-typed leaves reachable from `pages_root` by summing the
/// `Count` fields on its direct children, used by the page-count-stability
/// property and by callers that need the total before indexing pages.
pub fn count_pages(resolve: &impl Resolve, pages_root: PlainRef) -> Result<u32> {
    let value = dereference(resolve, &Primitive::Reference(pages_root))?;
    let dict = value.into_dictionary()?;
    dict.get("Count")
        .ok_or_else(|| PdfError::CorruptPageTree { detail: "pages root missing /Count".into() })?
        .as_u32()
}

/// Resolve the leaf's content stream(s) into one concatenated decoded byte
/// buffer, per the resource-consolidation rule: an array of streams
/// concatenates with a single space separator.
pub fn concatenated_content(resolve: &impl Resolve, page: &Dictionary) -> Result<Vec<u8>> {
    let Some(contents) = resolve_key(resolve, page, "Contents")? else {
        return Ok(Vec::new());
    };
    match contents {
        Primitive::Stream(s) => decode_stream(&s.info, &s.data),
        Primitive::Array(parts) => {
            let mut out = Vec::new();
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    out.push(b' ');
                }
                let part = dereference(resolve, part)?;
                let s = part.into_stream()?;
                out.extend(decode_stream(&s.info, &s.data)?);
            }
            Ok(out)
        }
        other => Err(PdfError::CorruptPageTree { detail: format!("/Contents must be a stream or array, found {}", other.get_debug_name()) }),
    }
}

const CATEGORIES: [ResourceCategory; 7] = [
    ResourceCategory::Font,
    ResourceCategory::XObject,
    ResourceCategory::ColorSpace,
    ResourceCategory::Pattern,
    ResourceCategory::Shading,
    ResourceCategory::ExtGState,
    ResourceCategory::Properties,
];

/// Clone the inherited resource dict and drop entries in each category not
/// referenced by `used`, failing if the content stream references a name
/// with no defining entry.
pub fn consolidate_resources(resolve: &impl Resolve, resources: &Primitive, used: &PageResourceNames) -> Result<Dictionary> {
    let resources = resources.as_dict()?.clone();
    let mut out = Dictionary::new();
    for (key, value) in resources.iter() {
        out.insert(key.clone(), value.clone());
    }
    for cat in CATEGORIES {
        let key = cat.dict_key();
        let referenced = used.set(cat);
        if referenced.is_empty() {
            // category unused by the content stream; drop it entirely if present
            if out.get(key).is_some() {
                out.delete(key);
            }
            continue;
        }
        let Some(cat_dict_val) = out.get(key).cloned() else {
            return Err(PdfError::CorruptPageTree {
                detail: format!("content stream references /{} names but page has no /{} resources", key, key),
            });
        };
        let cat_dict_val = dereference(resolve, &cat_dict_val)?;
        let cat_dict = cat_dict_val.as_dict()?;
        let mut pruned = Dictionary::new();
        for name in referenced {
            match cat_dict.get(name) {
                Some(v) => {
                    pruned.insert(name.clone(), v.clone());
                }
                None => {
                    return Err(PdfError::CorruptPageTree {
                        detail: format!("content stream references /{}/{} with no defining entry", key, name),
                    })
                }
            }
        }
        out.insert(key, Primitive::Dictionary(pruned));
    }
    Ok(out)
}

/// Full consolidation pipeline: scan the page's content stream, then prune
/// its inherited resource dict down to only the referenced names.
pub fn consolidated_resources_for_page(resolve: &impl Resolve, page: &Dictionary, inherited_resources: &Primitive) -> Result<Dictionary> {
    let content = concatenated_content(resolve, page)?;
    let used = scan_resource_names(&content)?;
    consolidate_resources(resolve, inherited_resources, &used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::{Dictionary, PlainRef, Primitive};
    use std::collections::HashMap;

    struct FakeResolve(HashMap<u32, Primitive>);
    impl Resolve for FakeResolve {
        fn resolve(&self, r: PlainRef) -> Result<Primitive> {
            self.0.get(&r.id).cloned().ok_or_else(|| PdfError::CorruptRef { obj_nr: r.id, gen: r.gen, detail: "missing".into() })
        }
    }

    fn rect(v: [f64; 4]) -> Primitive {
        Primitive::Array(v.iter().map(|&n| Primitive::Real(n)).collect())
    }

    #[test]
    fn finds_leaf_and_inherits_mediabox() {
        let mut objs = HashMap::new();
        let mut root = Dictionary::new();
        root.insert("Type", Primitive::name("Pages"));
        root.insert("Count", Primitive::Integer(2));
        root.insert("MediaBox", rect([0.0, 0.0, 612.0, 792.0]));
        root.insert("Kids", Primitive::Array(vec![Primitive::Reference(PlainRef { id: 2, gen: 0 }), Primitive::Reference(PlainRef { id: 3, gen: 0 })]));
        objs.insert(1, Primitive::Dictionary(root));

        let mut p0 = Dictionary::new();
        p0.insert("Type", Primitive::name("Page"));
        objs.insert(2, Primitive::Dictionary(p0));

        let mut p1 = Dictionary::new();
        p1.insert("Type", Primitive::name("Page"));
        p1.insert("Rotate", Primitive::Integer(90));
        objs.insert(3, Primitive::Dictionary(p1));

        let resolve = FakeResolve(objs);
        let cancel = CancellationToken::new();
        let found = page_dict(&resolve, PlainRef { id: 1, gen: 0 }, 1, &cancel).unwrap();
        assert_eq!(found.effective_media_box().unwrap(), [0.0, 0.0, 612.0, 792.0]);
        assert_eq!(found.effective_rotate(), 90);
    }

    #[test]
    fn local_mediabox_clears_inherited_cropbox() {
        let mut attrs = InheritedAttrs::default();
        attrs.crop_box = Some([0.0, 0.0, 100.0, 100.0]);
        let resolve = FakeResolve(HashMap::new());
        let mut dict = Dictionary::new();
        dict.insert("MediaBox", rect([0.0, 0.0, 50.0, 50.0]));
        attrs.update_from(&dict, &resolve).unwrap();
        assert!(attrs.crop_box.is_none());
        assert_eq!(attrs.media_box, Some([0.0, 0.0, 50.0, 50.0]));
    }

    #[test]
    fn consolidate_drops_unused_names_and_fails_on_missing() {
        let resolve = FakeResolve(HashMap::new());
        let mut font_dict = Dictionary::new();
        font_dict.insert("F1", Primitive::Integer(1));
        font_dict.insert("F2", Primitive::Integer(2));
        let mut resources = Dictionary::new();
        resources.insert("Font", Primitive::Dictionary(font_dict));
        let mut used = PageResourceNames::default();
        used.font.insert("F1".to_string());
        let consolidated = consolidate_resources(&resolve, &Primitive::Dictionary(resources.clone()), &used).unwrap();
        let font = consolidated.get("Font").unwrap().as_dict().unwrap();
        assert!(font.get("F1").is_some());
        assert!(font.get("F2").is_none());

        let mut missing = PageResourceNames::default();
        missing.font.insert("F3".to_string());
        assert!(consolidate_resources(&resolve, &Primitive::Dictionary(resources), &missing).is_err());
    }
}
