//! Per-collection in-memory index: a sequence counter, the primary key map
//! and one ordered map per configured secondary key.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde_json::Value;

use crate::document::{canonical_string, doc_id, is_operator};
use crate::Document;

#[derive(Debug, Default)]
pub struct Index {
    sequence: i64,
    primary: BTreeMap<i64, u64>,
    secondary: BTreeMap<String, BTreeMap<String, u64>>,
}

impl Index {
    /// Register secondary key names. Idempotent; existing maps are kept.
    pub fn add_keys<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for key in keys {
            self.secondary.entry(key.into()).or_default();
        }
    }

    /// Drop secondary maps whose name is not in `keys`.
    pub fn retain_keys(&mut self, keys: &[String]) {
        self.secondary.retain(|name, _| keys.contains(name));
    }

    pub fn keys(&self) -> Vec<String> {
        self.secondary.keys().cloned().collect()
    }

    /// Empty every position map, keeping key names and the sequence counter.
    pub fn clear_positions(&mut self) {
        self.primary.clear();
        for keys in self.secondary.values_mut() {
            keys.clear();
        }
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    /// True once any record of this collection has been stored. Key names
    /// configured ahead of the first document do not count.
    pub fn has_records(&self) -> bool {
        !self.primary.is_empty() || self.sequence > 0
    }

    /// Bump the sequence counter past an already-assigned id. Used during
    /// replay, where ids are never (re)assigned.
    pub fn observe(&mut self, document: &Document) {
        if let Some(id) = doc_id(document) {
            self.sequence = self.sequence.max(id);
        }
    }

    /// Assign `_id` from the sequence if the document has none, otherwise
    /// advance the sequence past the supplied id.
    pub fn assign_id(&mut self, document: &mut Document) -> i64 {
        match doc_id(document) {
            Some(id) => {
                self.sequence = self.sequence.max(id);
                id
            }
            None => {
                self.sequence += 1;
                document.insert("_id".to_string(), Value::from(self.sequence));
                self.sequence
            }
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.primary.contains_key(&id)
    }

    pub fn insert(&mut self, document: &Document, position: u64) {
        let Some(id) = doc_id(document) else {
            return;
        };
        self.primary.insert(id, position);
        for (name, keys) in &mut self.secondary {
            if let Some(value) = document.get(name) {
                keys.insert(canonical_string(value), position);
            }
        }
    }

    pub fn erase(&mut self, document: &Document) {
        let Some(id) = doc_id(document) else {
            return;
        };
        self.primary.remove(&id);
        for (name, keys) in &mut self.secondary {
            if let Some(value) = document.get(name) {
                keys.remove(&canonical_string(value));
            }
        }
    }

    /// Range analysis: turn a selector into the candidate file offsets, in
    /// visit order. The map to walk is the primary when the selector names
    /// `_id` at its root, else the first configured secondary key present in
    /// the selector, else a full primary scan.
    pub fn view(&self, selector: &Document) -> Vec<u64> {
        let desc = selector.contains_key("$desc");

        if let Some(sub) = selector.get("_id") {
            return analyze(sub, &self.primary, desc, |v| v.as_i64());
        }

        for (name, keys) in &self.secondary {
            if let Some(sub) = selector.get(name) {
                return analyze(sub, keys, desc, |v| Some(canonical_string(v)));
            }
        }

        let mut positions: Vec<u64> = self.primary.values().copied().collect();
        if desc {
            positions.reverse();
        }
        positions
    }
}

/// Apply the operator rules of a sub-selector to one sorted key map.
fn analyze<K, F>(sub: &Value, keys: &BTreeMap<K, u64>, desc_root: bool, make_key: F) -> Vec<u64>
where
    K: Ord + Clone,
    F: Fn(&Value) -> Option<K>,
{
    // An empty object is a presence-only hint (an ordering steer from
    // $orderby), so it scans the whole map like an unbounded operator object.
    let ops = match sub {
        Value::Object(map) if map.is_empty() || map.keys().any(|k| is_operator(k)) => Some(map),
        _ => None,
    };

    let Some(ops) = ops else {
        // Bare value: equal range when the key type matches, else leave the
        // whole map for the match predicate to filter.
        let mut positions = match make_key(sub) {
            Some(key) => keys
                .range((Bound::Included(key.clone()), Bound::Included(key)))
                .map(|(_, position)| *position)
                .collect(),
            None => keys.values().copied().collect::<Vec<u64>>(),
        };
        if desc_root {
            positions.reverse();
        }
        return positions;
    };

    let mut positions = if let Some(key) = ops.get("$eq").and_then(&make_key) {
        keys.range((Bound::Included(key.clone()), Bound::Included(key)))
            .map(|(_, position)| *position)
            .collect()
    } else {
        let mut lower = Bound::Unbounded;
        let mut upper = Bound::Unbounded;
        if let Some(key) = ops.get("$gt").and_then(&make_key) {
            lower = Bound::Excluded(key);
        } else if let Some(key) = ops.get("$gte").and_then(&make_key) {
            lower = Bound::Included(key);
        }
        if let Some(key) = ops.get("$lt").and_then(&make_key) {
            upper = Bound::Excluded(key);
        } else if let Some(key) = ops.get("$lte").and_then(&make_key) {
            upper = Bound::Included(key);
        }

        let mut positions: Vec<u64> = if bounds_ordered(&lower, &upper) {
            keys.range((lower, upper)).map(|(_, position)| *position).collect()
        } else {
            Vec::new()
        };

        if let Some(n) = ops.get("$head").and_then(Value::as_i64) {
            positions.truncate(n.max(0) as usize);
        } else if let Some(n) = ops.get("$tail").and_then(Value::as_i64) {
            let n = (n.max(0) as usize).min(positions.len());
            positions.drain(..positions.len() - n);
        }
        positions
    };

    if desc_root || ops.contains_key("$desc") {
        positions.reverse();
    }
    positions
}

// BTreeMap::range panics on inverted bounds, which a selector like
// {$gt: 5, $lt: 3} would produce.
fn bounds_ordered<K: Ord>(lower: &Bound<K>, upper: &Bound<K>) -> bool {
    match (lower, upper) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
        (Bound::Excluded(a), Bound::Excluded(b)) => a < b,
        (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) => {
            a <= b
        }
    }
}
