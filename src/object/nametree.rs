//! The name tree engine: an ordered key -> indirect-ref map laid out as a
//! balanced-ish B+-tree-like structure of branch and leaf dict nodes.
//!
//! Besides lookup, the CORE needs insert/update/delete, so the in-memory
//! `Node` representation here is a plain owned tree the caller mutates
//! and then syncs back into the xref via `bind_into`.

use crate::error::{PdfError, Result};
use crate::object::pagetree::CancellationToken;
use crate::object::{dereference, Resolve};
use crate::primitive::{Dictionary, PdfString, PlainRef, Primitive};

/// One node of an in-memory name tree. Root nodes never carry `limits`;
/// every other node's `limits` are `Some` and kept in sync with its
/// subtree's key range.
#[derive(Debug, Clone)]
pub struct Node {
    pub limits: Option<(Vec<u8>, Vec<u8>)>,
    pub kind: NodeKind,
}
#[derive(Debug, Clone)]
pub enum NodeKind {
    Branch(Vec<Node>),
    Leaf(Vec<(Vec<u8>, Primitive)>),
}

impl Node {
    pub fn empty_leaf() -> Node {
        Node { limits: None, kind: NodeKind::Leaf(Vec::new()) }
    }

    /// Read a name-tree node (and, recursively, its descendants) out of the
    /// xref, resolving `Kids`/`Names` arrays.
    pub fn parse(resolve: &impl Resolve, node_ref: PlainRef) -> Result<Node> {
        Self::parse_cancellable(resolve, node_ref, &CancellationToken::new())
    }

    pub fn parse_cancellable(resolve: &impl Resolve, node_ref: PlainRef, cancel: &CancellationToken) -> Result<Node> {
        Self::parse_depth(resolve, node_ref, 0, cancel)
    }

    fn parse_depth(resolve: &impl Resolve, node_ref: PlainRef, depth: usize, cancel: &CancellationToken) -> Result<Node> {
        if depth > 64 {
            return Err(PdfError::CorruptNameTree { detail: "name tree nested too deeply (possible cycle)".into() });
        }
        cancel.check()?;
        let value = dereference(resolve, &Primitive::Reference(node_ref))?;
        let dict = value.into_dictionary()?;
        let limits = match dict.get("Limits") {
            Some(v) => {
                let arr = dereference(resolve, v)?.into_array()?;
                if arr.len() != 2 {
                    return Err(PdfError::CorruptNameTree { detail: "/Limits must have 2 entries".into() });
                }
                Some((arr[0].as_string()?.as_bytes().to_vec(), arr[1].as_string()?.as_bytes().to_vec()))
            }
            None => None,
        };
        if let Some(kids) = dict.get("Kids") {
            let kids = dereference(resolve, kids)?.into_array()?;
            let mut nodes = Vec::with_capacity(kids.len());
            for kid in kids {
                let kid_ref = kid.as_reference().map_err(|_| PdfError::CorruptNameTree {
                    detail: "name tree kid is not an indirect reference".into(),
                })?;
                nodes.push(Node::parse_depth(resolve, kid_ref, depth + 1, cancel)?);
            }
            Ok(Node { limits, kind: NodeKind::Branch(nodes) })
        } else if let Some(names) = dict.get("Names") {
            let names = dereference(resolve, names)?.into_array()?;
            if names.len() % 2 != 0 {
                return Err(PdfError::CorruptNameTree { detail: "/Names array must have even length".into() });
            }
            let mut pairs = Vec::with_capacity(names.len() / 2);
            for pair in names.chunks_exact(2) {
                let key = dereference(resolve, &pair[0])?.into_string()?.into_bytes();
                pairs.push((key, pair[1].clone()));
            }
            Ok(Node { limits, kind: NodeKind::Leaf(pairs) })
        } else {
            Err(PdfError::CorruptNameTree { detail: "name tree node has neither /Kids nor /Names".into() })
        }
    }

    /// Lookup, per the descent algorithm: at a branch, pick the first kid
    /// whose range could contain `key`; at a leaf, linear-scan for an
    /// exact match.
    pub fn lookup(&self, key: &[u8]) -> Option<&Primitive> {
        match &self.kind {
            NodeKind::Leaf(pairs) => pairs.iter().find(|(k, _)| k.as_slice() == key).map(|(_, v)| v),
            NodeKind::Branch(kids) => {
                for kid in kids {
                    if let Some((lo, hi)) = &kid.limits {
                        if key.as_ref() >= lo.as_slice() && key.as_ref() <= hi.as_slice() {
                            return kid.lookup(key);
                        }
                    }
                }
                None
            }
        }
    }

    /// Insert or update `key` -> `value`. When the key falls to the right
    /// of every kid's limits, the rightmost kid is followed regardless
    /// (that's where a strictly-greater key must land), per the insert
    /// algorithm.
    pub fn insert(&mut self, key: Vec<u8>, value: Primitive) {
        match &mut self.kind {
            NodeKind::Leaf(pairs) => {
                match pairs.binary_search_by(|(k, _)| k.as_slice().cmp(key.as_slice())) {
                    Ok(idx) => pairs[idx].1 = value,
                    Err(idx) => pairs.insert(idx, (key, value)),
                }
                self.recompute_limits_leaf();
            }
            NodeKind::Branch(kids) => {
                let idx = pick_branch_for_insert(kids, &key);
                kids[idx].insert(key, value);
                self.recompute_limits_branch();
            }
        }
    }

    /// Remove `key`, returning the removed value if present. Empty leaves
    /// and branches left behind by the removal are pruned by the caller
    /// via `prune_empty`; this method only removes the pair/child and
    /// recomputes limits.
    pub fn delete(&mut self, key: &[u8]) -> Option<Primitive> {
        match &mut self.kind {
            NodeKind::Leaf(pairs) => {
                let idx = pairs.iter().position(|(k, _)| k.as_slice() == key)?;
                let (_, v) = pairs.remove(idx);
                self.recompute_limits_leaf();
                Some(v)
            }
            NodeKind::Branch(kids) => {
                let mut removed = None;
                for kid in kids.iter_mut() {
                    if matches!(&kid.limits, Some((lo, hi)) if key >= lo.as_slice() && key <= hi.as_slice()) {
                        removed = kid.delete(key);
                        break;
                    }
                }
                kids.retain(|k| !k.is_empty());
                self.recompute_limits_branch();
                removed
            }
        }
    }

    fn is_empty(&self) -> bool {
        match &self.kind {
            NodeKind::Leaf(pairs) => pairs.is_empty(),
            NodeKind::Branch(kids) => kids.is_empty(),
        }
    }

    fn recompute_limits_leaf(&mut self) {
        if let NodeKind::Leaf(pairs) = &self.kind {
            self.limits = match (pairs.first(), pairs.last()) {
                (Some((lo, _)), Some((hi, _))) => Some((lo.clone(), hi.clone())),
                _ => None,
            };
        }
    }

    fn recompute_limits_branch(&mut self) {
        if let NodeKind::Branch(kids) = &self.kind {
            // kids must stay sorted by Limits[0] (insert already lands a
            // new key in the right child, so a full sort is only needed
            // defensively after deletions prune children out from under us)
            let lo = kids.iter().filter_map(|k| k.limits.as_ref()).map(|(l, _)| l.clone()).min();
            let hi = kids.iter().filter_map(|k| k.limits.as_ref()).map(|(_, h)| h.clone()).max();
            self.limits = match (lo, hi) {
                (Some(l), Some(h)) => Some((l, h)),
                _ => None,
            };
        }
    }

    /// Sort direct children by `Limits[0]`, restoring the branch-ordering
    /// invariant after a structural mutation. Rebalancing proper (merging
    /// underfull nodes) is not implemented; this only restores sort order,
    /// which insert/delete can disturb when a key lands in a child whose
    /// range shifts past a sibling's.
    pub fn resort_children(&mut self) {
        if let NodeKind::Branch(kids) = &mut self.kind {
            for kid in kids.iter_mut() {
                kid.resort_children();
            }
            kids.sort_by(|a, b| a.limits.as_ref().map(|(l, _)| l.clone()).cmp(&b.limits.as_ref().map(|(l, _)| l.clone())));
        }
    }

    /// All (key, value) pairs in ascending key order, used for testing
    /// invariants and for `bind_into`'s leaf emission.
    pub fn in_order(&self) -> Vec<(Vec<u8>, Primitive)> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }
    fn collect(&self, out: &mut Vec<(Vec<u8>, Primitive)>) {
        match &self.kind {
            NodeKind::Leaf(pairs) => out.extend(pairs.iter().cloned()),
            NodeKind::Branch(kids) => kids.iter().for_each(|k| k.collect(out)),
        }
    }

    /// Validate the structural invariants that must hold after any
    /// sequence of inserts/deletes: every non-root node's `Limits` equal
    /// the min/max of its subtree's keys, and a branch's kids are sorted
    /// by `Limits[0]` with disjoint ranges.
    pub fn check_invariants(&self, is_root: bool) -> Result<()> {
        if !is_root {
            let keys = self.in_order();
            let (min, max) = match (keys.first(), keys.last()) {
                (Some((a, _)), Some((b, _))) => (a.clone(), b.clone()),
                _ => return Ok(()), // empty subtree, nothing to check
            };
            match &self.limits {
                Some((lo, hi)) if *lo == min && *hi == max => {}
                _ => return Err(PdfError::CorruptNameTree { detail: "Limits do not match subtree key range".into() }),
            }
        }
        if let NodeKind::Branch(kids) = &self.kind {
            let mut prev_hi: Option<Vec<u8>> = None;
            for kid in kids {
                kid.check_invariants(false)?;
                if let Some((lo, hi)) = &kid.limits {
                    if let Some(prev) = &prev_hi {
                        if lo <= prev {
                            return Err(PdfError::CorruptNameTree { detail: "kid Limits not sorted/disjoint".into() });
                        }
                    }
                    prev_hi = Some(hi.clone());
                }
            }
        }
        Ok(())
    }

    /// Write this in-memory tree back into the xref as plain dicts,
    /// allocating a fresh indirect object for every branch/leaf node via
    /// `alloc`. Returns the reference to the (newly written) root node.
    pub fn bind_into(&self, alloc: &mut impl FnMut(Primitive) -> Result<PlainRef>) -> Result<PlainRef> {
        self.bind_depth(alloc, true)
    }

    fn bind_depth(&self, alloc: &mut impl FnMut(Primitive) -> Result<PlainRef>, is_root: bool) -> Result<PlainRef> {
        let mut dict = Dictionary::new();
        if !is_root {
            if let Some((lo, hi)) = &self.limits {
                dict.insert(
                    "Limits",
                    Primitive::Array(vec![
                        Primitive::String(PdfString::new(lo.clone())),
                        Primitive::String(PdfString::new(hi.clone())),
                    ]),
                );
            }
        }
        match &self.kind {
            NodeKind::Leaf(pairs) => {
                let mut arr = Vec::with_capacity(pairs.len() * 2);
                for (k, v) in pairs {
                    arr.push(Primitive::String(PdfString::new(k.clone())));
                    arr.push(v.clone());
                }
                dict.insert("Names", Primitive::Array(arr));
            }
            NodeKind::Branch(kids) => {
                let mut refs = Vec::with_capacity(kids.len());
                for kid in kids {
                    refs.push(Primitive::Reference(kid.bind_depth(alloc, false)?));
                }
                dict.insert("Kids", Primitive::Array(refs));
            }
        }
        alloc(Primitive::Dictionary(dict))
    }
}

/// Pick which kid an insert descends into: the first whose range could
/// contain `key`, or (when `key` falls past every kid's upper limit) the
/// rightmost kid, since that's where a strictly-greater key must land.
fn pick_branch_for_insert(kids: &[Node], key: &[u8]) -> usize {
    for (i, kid) in kids.iter().enumerate() {
        if let Some((_, hi)) = &kid.limits {
            if key <= hi.as_slice() {
                return i;
            }
        } else {
            return i;
        }
    }
    kids.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn key(n: u64) -> Vec<u8> {
        n.to_be_bytes().to_vec()
    }

    #[test]
    fn lookup_after_inserts_in_sorted_leaf() {
        let mut root = Node::empty_leaf();
        for n in [5u64, 1, 3, 2, 4] {
            root.insert(key(n), Primitive::Integer(n as i64));
        }
        for n in 1..=5u64 {
            assert_eq!(root.lookup(&key(n)), Some(&Primitive::Integer(n as i64)));
        }
        assert_eq!(root.lookup(&key(6)), None);
        root.check_invariants(true).unwrap();
    }

    #[test]
    fn delete_removes_and_keeps_remaining_lookupable() {
        let mut root = Node::empty_leaf();
        for n in 0..10u64 {
            root.insert(key(n), Primitive::Integer(n as i64));
        }
        for n in (0..10u64).step_by(2) {
            assert!(root.delete(&key(n)).is_some());
        }
        for n in 0..10u64 {
            if n % 2 == 0 {
                assert_eq!(root.lookup(&key(n)), None);
            } else {
                assert_eq!(root.lookup(&key(n)), Some(&Primitive::Integer(n as i64)));
            }
        }
    }

    #[test]
    fn branch_insert_update_and_limits_invariant() {
        // Hand-build a two-leaf branch tree and confirm inserting into each
        // child keeps Limits correct and kids sorted.
        let mut left = Node { limits: Some((key(0), key(10))), kind: NodeKind::Leaf(vec![(key(0), Primitive::Integer(0)), (key(10), Primitive::Integer(10))]) };
        let mut right = Node { limits: Some((key(20), key(30))), kind: NodeKind::Leaf(vec![(key(20), Primitive::Integer(20)), (key(30), Primitive::Integer(30))]) };
        left.recompute_limits_leaf();
        right.recompute_limits_leaf();
        let mut root = Node { limits: None, kind: NodeKind::Branch(vec![left, right]) };
        root.recompute_limits_branch();

        root.insert(key(5), Primitive::Integer(5));
        root.insert(key(25), Primitive::Integer(25));
        assert_eq!(root.lookup(&key(5)), Some(&Primitive::Integer(5)));
        assert_eq!(root.lookup(&key(25)), Some(&Primitive::Integer(25)));
        root.check_invariants(true).unwrap();

        // update existing key
        root.insert(key(5), Primitive::Integer(999));
        assert_eq!(root.lookup(&key(5)), Some(&Primitive::Integer(999)));
    }

    #[test]
    fn stress_1000_inserts_500_deletes() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut keys: Vec<u64> = (0..1000).collect();
        keys.shuffle(&mut rng);
        let mut root = Node::empty_leaf();
        for &k in &keys {
            root.insert(key(k), Primitive::Integer(k as i64));
        }
        let mut to_delete = keys.clone();
        to_delete.shuffle(&mut rng);
        to_delete.truncate(500);
        for &k in &to_delete {
            assert!(root.delete(&key(k)).is_some());
        }
        root.check_invariants(true).unwrap();
        let remaining = root.in_order();
        assert_eq!(remaining.len(), 500);
        let mut sorted_keys: Vec<_> = remaining.iter().map(|(k, _)| k.clone()).collect();
        let mut check = sorted_keys.clone();
        check.sort();
        assert_eq!(sorted_keys, check);
        sorted_keys.dedup();
        assert_eq!(sorted_keys.len(), 500);
    }
}
