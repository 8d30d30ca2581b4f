//! Resolving references and walking compound structures built on top of
//! `Primitive` (page tree, name tree, object streams).
//!
//! Callers here work with `Dictionary`/`Primitive` directly and
//! dereference explicitly, since there is no fixed set of typed PDF
//! object kinds to generate from a derive macro.

pub mod nametree;
pub mod objstm;
pub mod pagetree;

use crate::error::{PdfError, Result};
use crate::primitive::{PlainRef, Primitive};

/// Anything that can turn an indirect reference into the `Primitive` it
/// points at. Implemented by `file::Storage`, which combines an `XRefTable`
/// with a byte source and an object-stream decode cache.
pub trait Resolve {
    fn resolve(&self, r: PlainRef) -> Result<Primitive>;
}

/// Resolve `value` fully: if it is a `Reference`, look it up and repeat,
/// following indirection chains up to a small fixed depth (a well-formed
/// PDF never chains references; this guards against a corrupt one looping).
pub fn dereference(resolve: &impl Resolve, value: &Primitive) -> Result<Primitive> {
    let r = match value {
        Primitive::Reference(r) => *r,
        other => return Ok(other.clone()),
    };
    let mut current = resolve.resolve(r)?;
    for _ in 0..31 {
        match current {
            Primitive::Reference(next) => current = resolve.resolve(next)?,
            other => return Ok(other),
        }
    }
    Err(PdfError::CorruptRef { obj_nr: r.id, gen: r.gen, detail: "reference chain too deep (possible cycle)".into() })
}

/// Resolve `key` in `dict` and fully dereference the result. Returns `Ok(None)`
/// if the key is absent, distinguishing "missing" from "present but null".
pub fn resolve_key(resolve: &impl Resolve, dict: &crate::primitive::Dictionary, key: &str) -> Result<Option<Primitive>> {
    match dict.get(key) {
        None => Ok(None),
        Some(v) => match dereference(resolve, v)? {
            Primitive::Null => Ok(None),
            other => Ok(Some(other)),
        },
    }
}
