//! Hash table keyed by interned strings.
//!
//! Open addressing with linear probing and tombstones. Keys are [`ObjRef`]
//! handles to interned strings, so key comparison is identity comparison;
//! each entry also stores the key's precomputed hash so the table can grow
//! and the heap can probe it for interning without chasing handles.
//!
//! The VM uses this table for globals, class method tables, instance fields
//! and, weakly (see [`Table::retain_keys`]), the string intern set. The
//! compiler uses it for per-function string-constant deduplication.

use crate::object::ObjRef;
use crate::value::Value;

/// Grow when live entries plus tombstones would exceed 3/4 of capacity.
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

#[derive(Clone, Copy)]
enum Entry {
    Empty,
    /// A deleted slot. Probe sequences walk through it; insertion reuses it.
    Tombstone,
    Full { key: ObjRef, hash: u32, value: Value },
}

#[derive(Clone, Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Full entries plus tombstones, the figure the load factor watches.
    count: usize,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    /// Slot capacity, for the GC's size accounting.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        match self.entries[self.find_slot(key, hash)] {
            Entry::Full { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Inserts or overwrites. Returns `true` when the key was not present.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.entries.len() * MAX_LOAD_NUM {
            self.grow();
        }
        let slot = self.find_slot(key, hash);
        let is_new = match self.entries[slot] {
            Entry::Full { .. } => false,
            // A reused tombstone was already counted.
            Entry::Tombstone => {
                self.entries[slot] = Entry::Full { key, hash, value };
                return true;
            }
            Entry::Empty => {
                self.count += 1;
                true
            }
        };
        self.entries[slot] = Entry::Full { key, hash, value };
        is_new
    }

    /// Removes `key`, leaving a tombstone. Returns whether it was present.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let slot = self.find_slot(key, hash);
        match self.entries[slot] {
            Entry::Full { .. } => {
                self.entries[slot] = Entry::Tombstone;
                true
            }
            _ => false,
        }
    }

    /// Copies every entry of `other` into `self`. Existing keys are
    /// overwritten; INHERIT relies on later METHOD definitions replacing
    /// the copied-down entries.
    pub fn extend_from(&mut self, other: &Table) {
        for (key, hash, value) in other.iter_with_hash() {
            self.set(key, hash, value);
        }
    }

    /// Probes by hash, asking `eq` to confirm a candidate key. This is the
    /// interning lookup: the caller compares contents, the table walks the
    /// probe sequence.
    pub fn find_with(&self, hash: u32, mut eq: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            match self.entries[index] {
                Entry::Empty => return None,
                Entry::Tombstone => {}
                Entry::Full { key, hash: h, .. } => {
                    if h == hash && eq(key) {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Deletes every entry whose key fails `keep`. The intern table is weak:
    /// after marking, the collector drops unmarked string keys here so sweep
    /// cannot leave dangling handles behind.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(ObjRef) -> bool) {
        for entry in &mut self.entries {
            if let Entry::Full { key, .. } = *entry {
                if !keep(key) {
                    *entry = Entry::Tombstone;
                }
            }
        }
    }

    /// Iterates live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match *entry {
            Entry::Full { key, value, .. } => Some((key, value)),
            _ => None,
        })
    }

    fn iter_with_hash(&self) -> impl Iterator<Item = (ObjRef, u32, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match *entry {
            Entry::Full { key, hash, value } => Some((key, hash, value)),
            _ => None,
        })
    }

    /// Index of the entry for `key`: its slot if present, otherwise the
    /// first tombstone on the probe path, otherwise the terminating empty
    /// slot. Capacity must be non-zero.
    fn find_slot(&self, key: ObjRef, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            match self.entries[index] {
                Entry::Empty => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry::Full { key: k, .. } => {
                    if k == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Doubles capacity and reinserts live entries, discarding tombstones.
    fn grow(&mut self) {
        let new_cap = (self.entries.len() * 2).max(8);
        let old = std::mem::replace(&mut self.entries, vec![Entry::Empty; new_cap]);
        self.count = 0;
        for entry in old {
            if let Entry::Full { key, hash, value } = entry {
                let slot = self.find_slot(key, hash);
                self.entries[slot] = Entry::Full { key, hash, value };
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u32) -> (ObjRef, u32) {
        // Synthetic handles with colliding hashes to force probing.
        (ObjRef::new(i), i % 4)
    }

    #[test]
    fn set_get_overwrite() {
        let mut table = Table::new();
        let (k, h) = key(1);
        assert!(table.set(k, h, Value::Number(1.0)));
        assert!(!table.set(k, h, Value::Number(2.0)));
        assert_eq!(table.get(k, h), Some(Value::Number(2.0)));
    }

    #[test]
    fn missing_key_is_none() {
        let table = Table::new();
        let (k, h) = key(9);
        assert_eq!(table.get(k, h), None);
    }

    #[test]
    fn delete_leaves_probe_path_intact() {
        let mut table = Table::new();
        // Three keys with identical hashes probe into consecutive slots.
        let a = ObjRef::new(10);
        let b = ObjRef::new(11);
        let c = ObjRef::new(12);
        table.set(a, 7, Value::Number(1.0));
        table.set(b, 7, Value::Number(2.0));
        table.set(c, 7, Value::Number(3.0));
        assert!(table.delete(b, 7));
        // c sits past b's tombstone and must remain reachable.
        assert_eq!(table.get(c, 7), Some(Value::Number(3.0)));
        assert_eq!(table.get(b, 7), None);
        // Reinsertion reuses the tombstone.
        assert!(table.set(b, 7, Value::Number(4.0)));
        assert_eq!(table.get(b, 7), Some(Value::Number(4.0)));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut table = Table::new();
        for i in 0..64 {
            let (k, h) = key(i);
            table.set(k, h, Value::Number(i as f64));
        }
        for i in 0..64 {
            let (k, h) = key(i);
            assert_eq!(table.get(k, h), Some(Value::Number(i as f64)), "key {i}");
        }
    }

    #[test]
    fn extend_from_overwrites() {
        let mut base = Table::new();
        let (k, h) = key(1);
        base.set(k, h, Value::Number(1.0));
        let mut sub = Table::new();
        sub.extend_from(&base);
        assert_eq!(sub.get(k, h), Some(Value::Number(1.0)));
        // A later definition wins, mirroring method overriding.
        sub.set(k, h, Value::Number(9.0));
        assert_eq!(sub.get(k, h), Some(Value::Number(9.0)));
        assert_eq!(base.get(k, h), Some(Value::Number(1.0)));
    }

    #[test]
    fn find_with_matches_on_hash_then_eq() {
        let mut table = Table::new();
        table.set(ObjRef::new(1), 42, Value::Nil);
        table.set(ObjRef::new(2), 42, Value::Nil);
        let found = table.find_with(42, |k| k == ObjRef::new(2));
        assert_eq!(found, Some(ObjRef::new(2)));
        assert_eq!(table.find_with(42, |_| false), None);
        assert_eq!(table.find_with(43, |_| true), None);
    }

    #[test]
    fn retain_keys_drops_rejected_entries() {
        let mut table = Table::new();
        for i in 0..8 {
            let (k, h) = key(i);
            table.set(k, h, Value::Nil);
        }
        table.retain_keys(|k| k.index() % 2 == 0);
        for i in 0..8 {
            let (k, h) = key(i);
            assert_eq!(table.get(k, h).is_some(), i % 2 == 0);
        }
    }
}
