// File: src/table.rs
//
// Open-addressed hash table keyed by interned string objects, used for the
// VM's globals, the string intern set, and method tables. Linear probing,
// power-of-two capacities, and tombstoned deletion; interning makes pointer
// comparison the only key equality the probe loop needs.

use crate::object::ObjRef;
use crate::value::Value;

/// Grow once three quarters of the slots hold a key or tombstone.
const MAX_LOAD_NUMERATOR: usize = 3;
const MAX_LOAD_DENOMINATOR: usize = 4;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry { key: None, value: Value::Nil };

    /// Tombstones are keyless entries holding `true`.
    const TOMBSTONE: Entry = Entry { key: None, value: Value::Bool(true) };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

#[derive(Default)]
pub struct Table {
    /// Keys plus tombstones; live entries alone can be fewer.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = self.find_entry(key);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    /// Inserts or updates. Returns true when the key was not present before.
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DENOMINATOR > self.entries.len() * MAX_LOAD_NUMERATOR {
            self.grow();
        }

        let index = self.find_entry(key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        // A reused tombstone was already counted toward the load factor.
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new
    }

    /// Removes a key, leaving a tombstone so later probe sequences stay
    /// intact. Returns false when the key was absent.
    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = self.find_entry(key);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry::TOMBSTONE;
        true
    }

    /// Intern-set probe by content: hash, then length and bytes. Regular
    /// lookups never compare bytes; this is the one place that must, because
    /// the caller is trying to discover the canonical object.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(key) => {
                    let s = key.as_str();
                    if s.hash == hash && &*s.chars == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Drops every entry whose key is unmarked. Run on the intern set before
    /// the sweep so the table never resurrects a dead string.
    pub fn remove_unmarked(&mut self) {
        for entry in &mut self.entries {
            if matches!(entry.key, Some(key) if !key.marked) {
                *entry = Entry::TOMBSTONE;
            }
        }
    }

    /// Live entries, for root marking and diagnostics.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    fn find_entry(&self, key: ObjRef) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = key.as_str().hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.is_tombstone() {
                        tombstone.get_or_insert(index);
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(existing) if existing == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    /// Rehashes live entries into the next power-of-two capacity; tombstones
    /// are dropped and the count rebuilt.
    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() { 8 } else { self.entries.len() * 2 };
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; new_capacity]);
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = self.find_entry(key);
                self.entries[index] = Entry { key: Some(key), value: entry.value };
                self.count += 1;
            }
        }
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{hash_string, Obj, ObjKind, ObjStr};
    use std::ptr::NonNull;

    // Tests construct string objects directly and leak them; only the heap
    // allocates objects in the real system.
    fn make_str(s: &str) -> ObjRef {
        let obj = Box::new(Obj {
            marked: false,
            next: None,
            kind: ObjKind::Str(ObjStr { chars: s.into(), hash: hash_string(s) }),
        });
        ObjRef::new(NonNull::new(Box::into_raw(obj)).unwrap())
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut table = Table::new();
        let key = make_str("answer");
        assert!(table.set(key, Value::Number(42.0)));
        assert!(!table.set(key, Value::Number(43.0)));
        assert!(table.get(key).unwrap().equals(&Value::Number(43.0)));
    }

    #[test]
    fn missing_keys_return_none() {
        let table = Table::new();
        assert!(table.get(make_str("nope")).is_none());
    }

    #[test]
    fn delete_leaves_probe_chains_intact() {
        let mut table = Table::new();
        let keys: Vec<ObjRef> = (0..16).map(|i| make_str(&format!("k{}", i))).collect();
        for (i, key) in keys.iter().enumerate() {
            table.set(*key, Value::Number(i as f64));
        }
        assert!(table.delete(keys[3]));
        assert!(!table.delete(keys[3]));
        for (i, key) in keys.iter().enumerate() {
            if i == 3 {
                assert!(table.get(*key).is_none());
            } else {
                assert!(table.get(*key).unwrap().equals(&Value::Number(i as f64)));
            }
        }
    }

    #[test]
    fn tombstones_are_reused_without_recount() {
        let mut table = Table::new();
        let a = make_str("a");
        let b = make_str("b");
        table.set(a, Value::Nil);
        table.delete(a);
        let capacity_before = table.capacity();
        table.set(b, Value::Nil);
        // Reusing the tombstone must not inflate the load count.
        assert_eq!(table.capacity(), capacity_before);
        assert!(table.get(b).is_some());
    }

    #[test]
    fn growth_drops_tombstones_and_keeps_entries() {
        let mut table = Table::new();
        let keys: Vec<ObjRef> = (0..64).map(|i| make_str(&format!("key{}", i))).collect();
        for (i, key) in keys.iter().enumerate() {
            table.set(*key, Value::Number(i as f64));
            if i % 2 == 0 {
                table.delete(*key);
            }
        }
        assert!(table.capacity().is_power_of_two());
        for (i, key) in keys.iter().enumerate() {
            if i % 2 == 0 {
                assert!(table.get(*key).is_none());
            } else {
                assert!(table.get(*key).unwrap().equals(&Value::Number(i as f64)));
            }
        }
    }

    #[test]
    fn find_string_compares_hash_length_and_bytes() {
        let mut table = Table::new();
        let key = make_str("needle");
        table.set(key, Value::Nil);
        let found = table.find_string("needle", hash_string("needle")).unwrap();
        assert_eq!(found, key);
        assert!(table.find_string("needls", hash_string("needls")).is_none());
    }

    #[test]
    fn remove_unmarked_drops_only_white_keys() {
        let mut table = Table::new();
        let mut live = make_str("live");
        let dead = make_str("dead");
        table.set(live, Value::Nil);
        table.set(dead, Value::Nil);
        live.marked = true;
        table.remove_unmarked();
        assert!(table.get(live).is_some());
        assert!(table.get(dead).is_none());
    }
}
