//! The entry point of the CORE: ties the parser, xref table, filter
//! pipeline, and backend byte source together into one document context.
//!
//! Objects are plain `Primitive` values resolved through the `Resolve`
//! contract in `object/mod.rs`, rather than a typed, derive-macro-backed
//! object schema.

use crate::backend::Backend;
use crate::content::scan_resource_names;
use crate::error::{PdfError, Result};
use crate::object::nametree::Node as NameTreeNode;
use crate::object::objstm::ObjectStream;
use crate::object::pagetree::{self, CancellationToken};
use crate::object::{dereference, resolve_key, Resolve};
use crate::parser::{parse_indirect_object, ParseOptions};
use crate::primitive::{Dictionary, PlainRef, Primitive};
use crate::xref::{ObjNr, XRefEntry, XRefTable};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// A document context's object store: the xref table, the backing bytes,
/// a decode cache for object streams (decoding one is wasted work to redo
/// on every contained-object access), and an overlay of in-memory changes
/// (newly inserted or updated objects not yet written back).
pub struct Storage<B: Backend> {
    xref: XRefTable,
    backend: B,
    start_offset: usize,
    opts: ParseOptions,
    objstm_cache: RefCell<HashMap<ObjNr, Rc<ObjectStream>>>,
    changes: HashMap<ObjNr, Primitive>,
    resolving: RefCell<HashSet<ObjNr>>,
}

impl<B: Backend> Storage<B> {
    pub fn new(backend: B, xref: XRefTable, start_offset: usize, opts: ParseOptions) -> Self {
        Storage {
            xref,
            backend,
            start_offset,
            opts,
            objstm_cache: RefCell::new(HashMap::new()),
            changes: HashMap::new(),
            resolving: RefCell::new(HashSet::new()),
        }
    }

    pub fn xref(&self) -> &XRefTable {
        &self.xref
    }
    pub fn xref_mut(&mut self) -> &mut XRefTable {
        &mut self.xref
    }

    /// Object numbers staged as in-memory changes (new or updated) since
    /// parse, for the writer's incremental-write path.
    pub fn changed_object_ids(&self) -> Vec<ObjNr> {
        let mut ids: Vec<ObjNr> = self.changes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Assign a fresh object number to `value`, per `XRefTable::insertNew`,
    /// and stage it as an in-memory change.
    pub fn insert_new(&mut self, value: Primitive) -> PlainRef {
        let r = self.xref.insert_new(0);
        self.changes.insert(r.id, value);
        r
    }

    /// Reuse a free slot for `value` if one is available (falling back to a
    /// fresh object number otherwise), per `XRefTable::insertAndRecycle`.
    pub fn insert_and_recycle(&mut self, value: Primitive) -> PlainRef {
        let r = self.xref.insert_and_recycle(0);
        self.changes.insert(r.id, value);
        r
    }

    /// Replace the value stored at an already-live object number without
    /// changing its generation (an in-place mutation, per the lifecycle
    /// model's "mutation is in-place" rule).
    pub fn update(&mut self, id: ObjNr, value: Primitive) {
        self.changes.insert(id, value);
    }

    /// Free `root` and everything reachable only through it, per
    /// `XRefTable::deleteObjectGraph`. Children are resolved against a
    /// snapshot of the xref table taken before any freeing begins: object
    /// offsets don't move as entries are freed, so the snapshot stays valid
    /// for the whole walk without aliasing the table `delete_object_graph`
    /// is mutating.
    pub fn delete_object_graph(&mut self, root: PlainRef) -> Result<()> {
        let value = self.resolve(root)?;
        let snapshot = self.xref.clone();
        let changes = &self.changes;
        let backend = &self.backend;
        let start_offset = self.start_offset;
        let opts = self.opts;
        let objstm_cache = &self.objstm_cache;
        let resolving = &self.resolving;
        let mut resolve_fn = |r: PlainRef| -> Result<Primitive> {
            resolve_raw(r, &snapshot, changes, backend, start_offset, &opts, objstm_cache, resolving)
        };
        self.xref.delete_object_graph(root, &value, &mut resolve_fn)
    }

    pub fn raw_bytes(&self) -> &[u8] {
        self.backend.as_ref()
    }
}

impl<B: Backend> Resolve for Storage<B> {
    fn resolve(&self, r: PlainRef) -> Result<Primitive> {
        resolve_raw(
            r,
            &self.xref,
            &self.changes,
            &self.backend,
            self.start_offset,
            &self.opts,
            &self.objstm_cache,
            &self.resolving,
        )
    }
}

/// Free-standing resolve implementation shared between `Storage::resolve`
/// and the borrow-split closure `delete_object_graph` needs (the xref
/// table is borrowed mutably there, so it can't go through `&self`).
#[allow(clippy::too_many_arguments)]
fn resolve_raw<B: Backend>(
    r: PlainRef,
    xref: &XRefTable,
    changes: &HashMap<ObjNr, Primitive>,
    backend: &B,
    start_offset: usize,
    opts: &ParseOptions,
    objstm_cache: &RefCell<HashMap<ObjNr, Rc<ObjectStream>>>,
    resolving: &RefCell<HashSet<ObjNr>>,
) -> Result<Primitive> {
    if let Some(v) = changes.get(&r.id) {
        return Ok(v.clone());
    }
    if !resolving.borrow_mut().insert(r.id) {
        return Err(PdfError::CorruptRef { obj_nr: r.id, gen: r.gen, detail: "reference cycle while resolving object".into() });
    }
    let result = (|| match xref.find(r.id) {
        None | Some(XRefEntry::Free { .. }) => Err(PdfError::CorruptRef { obj_nr: r.id, gen: r.gen, detail: "object is free or unknown".into() }),
        Some(XRefEntry::InUse { offset, .. }) => {
            let buf = backend.as_ref();
            let (_, _, value) = parse_indirect_object(buf, start_offset + offset, opts)?;
            Ok(value)
        }
        Some(XRefEntry::Compressed { container, index }) => {
            let objstm = {
                if let Some(cached) = objstm_cache.borrow().get(&container) {
                    cached.clone()
                } else {
                    let container_val =
                        resolve_raw(PlainRef { id: container, gen: 0 }, xref, changes, backend, start_offset, opts, objstm_cache, resolving)?;
                    let stream = container_val.into_stream()?;
                    let parsed = Rc::new(ObjectStream::parse(&stream)?);
                    objstm_cache.borrow_mut().insert(container, parsed.clone());
                    parsed
                }
            };
            if objstm.object_number_at(index as usize) == Some(container) {
                return Err(PdfError::corrupt("object stream contains a compressed reference to itself"));
            }
            objstm.get(index as usize, opts)
        }
    })();
    resolving.borrow_mut().remove(&r.id);
    result
}

/// Options controlling a document write: full rewrite vs. incremental,
/// and classical xref table vs. xref stream.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Emit only changed objects, appended after the original bytes with
    /// `/Prev` pointing at the previous xref offset, instead of a full
    /// rewrite.
    pub incremental: bool,
    /// Emit an xref stream (`/Type /XRef`) instead of the classical
    /// plain-text table. Requires effective version >= 1.5.
    pub xref_stream: bool,
}

/// A document context: the object store plus the parsed trailer and a
/// handle on the catalog's indirect reference.
pub struct PdfDocument<B: Backend> {
    storage: Storage<B>,
    trailer: Dictionary,
    catalog_ref: PlainRef,
}

impl<B: Backend> PdfDocument<B> {
    /// Parse `backend`'s bytes into a document context: locate the header
    /// and tail-anchored `startxref`, build the xref table by following
    /// `/Prev` links, and resolve the catalog.
    pub fn parse_with_options(backend: B, opts: ParseOptions) -> Result<Self> {
        let buf = backend.as_ref();
        let start_offset = crate::backend::locate_start_offset(buf)?;
        let tail_anchored = crate::backend::locate_xref_offset(buf).and_then(|xref_offset| XRefTable::parse(buf, xref_offset, &opts));
        let (mut xref, trailer) = match tail_anchored {
            Ok(parsed) => parsed,
            Err(_) => XRefTable::reconstruct(buf, start_offset, &opts)?,
        };

        if trailer.get("Encrypt").is_some() {
            return Err(PdfError::EncryptionNotSupported);
        }

        let catalog_ref = trailer
            .get("Root")
            .ok_or_else(|| PdfError::corrupt("trailer missing /Root"))?
            .as_reference()
            .map_err(|_| PdfError::corrupt("/Root must be an indirect reference"))?;

        let storage = Storage::new(backend, xref.clone(), start_offset, opts);
        if let Ok(catalog) = storage.resolve(catalog_ref) {
            if let Ok(dict) = catalog.into_dictionary() {
                if let Some(v) = dict.get("Version") {
                    if let Ok(name) = v.as_name() {
                        if let Ok(parsed) = name.parse::<f32>() {
                            xref.root_version = Some(parsed);
                        }
                    }
                }
            }
        }
        let storage = Storage::new(storage.backend, xref, start_offset, opts);

        Ok(PdfDocument { storage, trailer, catalog_ref })
    }

    pub fn trailer(&self) -> &Dictionary {
        &self.trailer
    }
    pub fn storage(&self) -> &Storage<B> {
        &self.storage
    }
    pub fn storage_mut(&mut self) -> &mut Storage<B> {
        &mut self.storage
    }
    pub fn catalog_ref(&self) -> PlainRef {
        self.catalog_ref
    }

    pub fn catalog(&self) -> Result<Dictionary> {
        dereference(&self.storage, &Primitive::Reference(self.catalog_ref))?.into_dictionary()
    }

    fn pages_root(&self) -> Result<PlainRef> {
        self.catalog()?
            .get("Pages")
            .ok_or_else(|| PdfError::CorruptPageTree { detail: "catalog missing /Pages".into() })?
            .as_reference()
            .map_err(|_| PdfError::CorruptPageTree { detail: "/Pages must be an indirect reference".into() })
    }

    pub fn num_pages(&self) -> Result<u32> {
        pagetree::count_pages(&self.storage, self.pages_root()?)
    }

    /// Locate page `page_nr` (0-based) and, if `consolidate_resources` is
    /// set, prune its inherited resource dict down to the names its
    /// content stream references.
    pub fn page(&self, page_nr: u32, consolidate_resources: bool) -> Result<ResolvedPage> {
        self.page_cancellable(page_nr, consolidate_resources, &CancellationToken::new())
    }

    pub fn page_cancellable(&self, page_nr: u32, consolidate_resources: bool, cancel: &CancellationToken) -> Result<ResolvedPage> {
        let lookup = pagetree::page_dict(&self.storage, self.pages_root()?, page_nr, cancel)?;
        let media_box = lookup.effective_media_box()?;
        let crop_box = lookup.effective_crop_box()?;
        let rotate = lookup.effective_rotate();
        let resources = match &lookup.inherited.resources {
            Some(r) if consolidate_resources => pagetree::consolidated_resources_for_page(&self.storage, &lookup.dict, r)?,
            Some(r) => dereference(&self.storage, r)?.into_dictionary()?,
            None => Dictionary::new(),
        };
        Ok(ResolvedPage { dict: lookup.dict, indirect_ref: lookup.indirect_ref, media_box, crop_box, rotate, resources })
    }

    /// Load a named name tree from the catalog's `/Names` dict by key
    /// (e.g. `"Dests"`, `"EmbeddedFiles"`, `"JavaScript"`).
    pub fn name_tree(&self, key: &str) -> Result<NameTreeNode> {
        self.name_tree_cancellable(key, &CancellationToken::new())
    }

    pub fn name_tree_cancellable(&self, key: &str, cancel: &CancellationToken) -> Result<NameTreeNode> {
        let catalog = self.catalog()?;
        let names = resolve_key(&self.storage, &catalog, "Names")?
            .ok_or_else(|| PdfError::CorruptNameTree { detail: "catalog has no /Names dict".into() })?
            .into_dictionary()?;
        let root_ref = names
            .get(key)
            .ok_or_else(|| PdfError::CorruptNameTree { detail: format!("/Names has no /{} entry", key) })?
            .as_reference()
            .map_err(|_| PdfError::CorruptNameTree { detail: format!("/Names/{} must be an indirect reference", key) })?;
        NameTreeNode::parse_cancellable(&self.storage, root_ref, cancel)
    }
}

impl PdfDocument<Vec<u8>> {
    pub fn parse(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        Self::parse_with_options(bytes.into(), ParseOptions::default())
    }

    /// Emit this document's bytes per the writer algorithm (§4.7).
    pub fn write(&mut self, opts: WriteOptions) -> Result<Vec<u8>> {
        crate::writer::write(self, &opts, &CancellationToken::new())
    }

    /// Reduce the document in-place to just the given 0-based page
    /// numbers: drop `Annots` from the selected page dicts and rewrite the
    /// pages-root `/Kids`/`/Count` to reference only the selected pages,
    /// per the writer's reduced-feature write support.
    pub fn extract_pages(&mut self, page_numbers: &[u32]) -> Result<()> {
        let pages_root = self.pages_root()?;
        let mut new_kids = Vec::with_capacity(page_numbers.len());
        for &nr in page_numbers {
            let page = self.page(nr, false)?;
            let mut dict = page.dict.clone();
            dict.delete("Annots");
            self.storage.update(page.indirect_ref.id, Primitive::Dictionary(dict));
            new_kids.push(Primitive::Reference(page.indirect_ref));
        }
        let mut root_dict = dereference(&self.storage, &Primitive::Reference(pages_root))?.into_dictionary()?;
        root_dict.insert("Kids", Primitive::Array(new_kids));
        root_dict.insert("Count", Primitive::Integer(page_numbers.len() as i64));
        self.storage.update(pages_root.id, Primitive::Dictionary(root_dict));
        Ok(())
    }
}

/// A page located by the walker, with inheritance already resolved.
pub struct ResolvedPage {
    pub dict: Dictionary,
    pub indirect_ref: PlainRef,
    pub media_box: [f64; 4],
    pub crop_box: [f64; 4],
    pub rotate: i64,
    pub resources: Dictionary,
}
impl ResolvedPage {
    /// The set of resource names this page's content stream references,
    /// independent of whether the caller asked for consolidation.
    pub fn referenced_resource_names(&self, resolve: &impl Resolve) -> Result<crate::content::PageResourceNames> {
        let data = pagetree::concatenated_content(resolve, &self.dict)?;
        scan_resource_names(&data)
    }
    pub fn decoded_content(&self, resolve: &impl Resolve) -> Result<Vec<u8>> {
        pagetree::concatenated_content(resolve, &self.dict)
    }
}
