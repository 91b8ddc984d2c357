use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::{IdentityError, IdentityResult};
use crate::key::{Identity, Key, KeyCounter};

/// Either an object or an explicit [`Key`] used to address a store.
#[derive(Clone, Copy)]
pub enum ObjectRef<'a> {
    Object(&'a dyn Identity),
    Key(&'a Key),
}

impl<'a> ObjectRef<'a> {
    /// Address an entry by object identity.
    pub fn object(obj: &'a dyn Identity) -> Self {
        Self::Object(obj)
    }

    fn slot(&self) -> Option<usize> {
        match self {
            Self::Object(obj) => Some(obj.identity()),
            Self::Key(key) => key.live_address(),
        }
    }

    fn selects(&self, key: &Key) -> bool {
        match self {
            Self::Object(obj) => key.matches(*obj),
            Self::Key(wanted) => *wanted == key,
        }
    }
}

impl<'a, T: ?Sized + Send + Sync + 'static> From<&'a Arc<T>> for ObjectRef<'a> {
    fn from(obj: &'a Arc<T>) -> Self {
        Self::Object(obj)
    }
}

impl<'a> From<&'a Key> for ObjectRef<'a> {
    fn from(key: &'a Key) -> Self {
        Self::Key(key)
    }
}

/// Association map from object identity to values.
///
/// Two lookup layers: the object's address (O(1)), then a short list of
/// keys bound at that address. Several keys may point at the same object,
/// which is how one object owns several blocks. Entries whose referent has
/// been dropped are never returned and are purged when their slot is next
/// assigned.
#[derive(Clone)]
pub struct Store<V> {
    by_id: HashMap<usize, Vec<(Key, V)>>,
    counter: KeyCounter,
}

impl<V> Store<V> {
    /// An empty store allocating implicit keys from `counter`.
    pub fn new(counter: KeyCounter) -> Self {
        Self {
            by_id: HashMap::new(),
            counter,
        }
    }

    /// The counter implicit keys are drawn from.
    pub fn counter(&self) -> &KeyCounter {
        &self.counter
    }

    /// Look up the value for an object or key.
    ///
    /// An object matches the first live key bound to it; a key matches only
    /// an entry stored under an equal key.
    pub fn lookup<'a>(&self, target: impl Into<ObjectRef<'a>>) -> Option<&V> {
        let target = target.into();
        let entries = self.by_id.get(&target.slot()?)?;
        entries
            .iter()
            .find(|(key, _)| target.selects(key))
            .map(|(_, value)| value)
    }

    /// Look up the value for whatever object `key` currently refers to,
    /// ignoring the key's own counter.
    pub fn lookup_referent_of(&self, key: &Key) -> Option<&V> {
        let slot = key.live_address()?;
        self.by_id
            .get(&slot)?
            .iter()
            .find(|(entry, _)| entry.live_address() == Some(slot))
            .map(|(_, value)| value)
    }

    /// Number of live entries for whatever object `key` currently refers to.
    pub fn count_referent_of(&self, key: &Key) -> usize {
        let Some(slot) = key.live_address() else {
            return 0;
        };
        self.by_id.get(&slot).map_or(0, |entries| {
            entries
                .iter()
                .filter(|(entry, _)| entry.live_address() == Some(slot))
                .count()
        })
    }

    /// Mutable variant of [`lookup`](Self::lookup).
    pub fn lookup_mut<'a>(&mut self, target: impl Into<ObjectRef<'a>>) -> Option<&mut V> {
        let target = target.into();
        let entries = self.by_id.get_mut(&target.slot()?)?;
        entries
            .iter_mut()
            .find(|(key, _)| target.selects(key))
            .map(|(_, value)| value)
    }

    /// Set the value for an object or key, replacing any existing mapping.
    ///
    /// Assigning by object reuses the first key already bound to it, or
    /// allocates a new bound key. Assigning by key fails if the key is not
    /// bound to a live object.
    pub fn assign<'a>(&mut self, target: impl Into<ObjectRef<'a>>, value: V) -> IdentityResult<()> {
        let target = target.into();
        let slot = match (target, target.slot()) {
            (_, Some(slot)) => slot,
            (ObjectRef::Key(key), None) => return Err(IdentityError::UnboundKey(key.counter())),
            (ObjectRef::Object(_), None) => unreachable!("objects always have a slot"),
        };

        let entries = self.by_id.entry(slot).or_default();
        entries.retain(|(key, _)| key.is_valid());

        if let Some(entry) = entries.iter_mut().find(|(key, _)| target.selects(key)) {
            entry.1 = value;
            return Ok(());
        }

        let key = match target {
            ObjectRef::Object(obj) => Key::bound(&self.counter, obj),
            ObjectRef::Key(key) => key.clone(),
        };
        entries.push((key, value));
        Ok(())
    }

    /// Remove and return the value for an object or key.
    pub fn remove<'a>(&mut self, target: impl Into<ObjectRef<'a>>) -> Option<V> {
        let target = target.into();
        let slot = target.slot()?;
        let entries = self.by_id.get_mut(&slot)?;
        let pos = entries.iter().position(|(key, _)| target.selects(key))?;
        let (_, value) = entries.remove(pos);
        if entries.is_empty() {
            self.by_id.remove(&slot);
        }
        Some(value)
    }

    /// All live `(key, value)` pairs. Dead entries are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &V)> {
        self.by_id
            .values()
            .flatten()
            .filter(|(key, _)| key.is_valid())
            .map(|(key, value)| (key, value))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Returns `true` if there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Drop every entry whose referent is gone.
    pub fn cleanup(&mut self) {
        let mut purged = 0usize;
        self.by_id.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(key, _)| key.is_valid());
            purged += before - entries.len();
            !entries.is_empty()
        });
        if purged > 0 {
            trace!(purged, "purged dead store entries");
        }
    }
}

/// An ordered sequence that can also be addressed by object identity.
///
/// Position `i` of the sequence is what callers call "index `i`"; the
/// identity layer maps objects (or keys) to positions.
#[derive(Clone)]
pub struct LinearStore<V> {
    items: Vec<V>,
    index: Store<usize>,
}

impl<V> LinearStore<V> {
    /// An empty sequence.
    pub fn new(counter: KeyCounter) -> Self {
        Self::from_items(counter, Vec::new())
    }

    /// A sequence with initial items and no identity mappings.
    pub fn from_items(counter: KeyCounter, items: Vec<V>) -> Self {
        Self {
            items,
            index: Store::new(counter),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&V> {
        self.items.get(index)
    }

    pub fn items(&self) -> &[V] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, V> {
        self.items.iter()
    }

    /// Append an item, returning its index.
    pub fn push(&mut self, value: V) -> usize {
        self.items.push(value);
        self.items.len() - 1
    }

    /// Swap in a whole new ordered view, returning the previous one.
    /// Identity mappings are kept.
    pub fn replace_sequence(&mut self, items: Vec<V>) -> Vec<V> {
        std::mem::replace(&mut self.items, items)
    }

    /// The item an object or key is mapped to.
    pub fn lookup<'a>(&self, target: impl Into<ObjectRef<'a>>) -> Option<&V> {
        self.lookup_index(target).and_then(|i| self.items.get(i))
    }

    /// The index an object or key is mapped to.
    pub fn lookup_index<'a>(&self, target: impl Into<ObjectRef<'a>>) -> Option<usize> {
        self.index.lookup(target).copied()
    }

    /// Map an object or key to the item at `index`.
    pub fn assign_index<'a>(
        &mut self,
        target: impl Into<ObjectRef<'a>>,
        index: usize,
    ) -> IdentityResult<()> {
        if index >= self.items.len() {
            return Err(IdentityError::IndexOutOfRange {
                index,
                len: self.items.len(),
            });
        }
        self.index.assign(target, index)
    }

    /// Live keys mapped to `index`.
    pub fn owners_of(&self, index: usize) -> Vec<Key> {
        self.index
            .iter()
            .filter(|(_, &i)| i == index)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// The identity layer.
    pub fn identities(&self) -> &Store<usize> {
        &self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Foo;

    fn foo() -> Arc<Foo> {
        Arc::new(Foo)
    }

    fn store<V>() -> Store<V> {
        Store::new(KeyCounter::new())
    }

    #[test]
    fn store_by_object() {
        let f = foo();
        let mut s = store();
        s.assign(&f, 42).unwrap();
        assert_eq!(s.lookup(&f), Some(&42));
    }

    #[test]
    fn missing_object() {
        let s: Store<i32> = store();
        assert_eq!(s.lookup(&foo()), None);
    }

    #[test]
    fn store_by_key() {
        let f = foo();
        let mut s = store();
        let k = Key::bound(s.counter(), &f);
        s.assign(&k, 42).unwrap();
        assert_eq!(s.lookup(&k), Some(&42));
    }

    #[test]
    fn key_entry_found_by_object() {
        let f = foo();
        let mut s = store();
        let k = Key::bound(s.counter(), &f);
        s.assign(&k, 42).unwrap();
        assert_eq!(s.lookup(&f), Some(&42));
    }

    #[test]
    fn missing_key() {
        let f = foo();
        let s: Store<i32> = store();
        let k = Key::bound(s.counter(), &f);
        assert_eq!(s.lookup(&k), None);
    }

    #[test]
    fn other_key_for_same_object_misses() {
        let f = foo();
        let mut s = store();
        let k = Key::bound(s.counter(), &f);
        s.assign(&k, 42).unwrap();
        let k2 = Key::bound(s.counter(), &f);
        assert_eq!(s.lookup(&k2), None);
    }

    #[test]
    fn reassign_same_object_overwrites() {
        let f = foo();
        let mut s = store();
        s.assign(&f, 26).unwrap();
        s.assign(&f, 42).unwrap();
        assert_eq!(s.lookup(&f), Some(&42));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn reassign_same_key_overwrites() {
        let f = foo();
        let mut s = store();
        let k = Key::bound(s.counter(), &f);
        s.assign(&k, 26).unwrap();
        s.assign(&k, 42).unwrap();
        assert_eq!(s.lookup(&k), Some(&42));
    }

    #[test]
    fn several_keys_per_object() {
        let f = foo();
        let mut s = store();
        let k1 = Key::bound(s.counter(), &f);
        let k2 = Key::bound(s.counter(), &f);
        s.assign(&k1, "a").unwrap();
        s.assign(&k2, "b").unwrap();
        assert_eq!(s.lookup(&k1), Some(&"a"));
        assert_eq!(s.lookup(&k2), Some(&"b"));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn lookup_through_key_referent() {
        let f = foo();
        let mut s = store();
        s.assign(&f, 9).unwrap();
        let unrelated = Key::bound(s.counter(), &f);
        assert_eq!(s.lookup(&unrelated), None);
        assert_eq!(s.lookup_referent_of(&unrelated), Some(&9));
    }

    #[test]
    fn count_entries_of_key_referent() {
        let f = foo();
        let mut s = store();
        let other = Key::bound(s.counter(), &f);
        let first = Key::bound(s.counter(), &f);
        let second = Key::bound(s.counter(), &f);
        assert_eq!(s.count_referent_of(&other), 0);
        s.assign(&first, 1).unwrap();
        assert_eq!(s.count_referent_of(&other), 1);
        s.assign(&second, 2).unwrap();
        assert_eq!(s.count_referent_of(&other), 2);
        let unbound = Key::new(s.counter());
        assert_eq!(s.count_referent_of(&unbound), 0);
    }

    #[test]
    fn unbound_key_cannot_assign() {
        let mut s = store();
        let k = Key::new(s.counter());
        let err = s.assign(&k, 1).unwrap_err();
        assert_eq!(err, IdentityError::UnboundKey(k.counter()));
    }

    #[test]
    fn dropped_object_is_not_found_by_successor() {
        let mut s = store();
        let f = foo();
        s.assign(&f, 42).unwrap();
        drop(f);
        let f2 = foo();
        assert_eq!(s.lookup(&f2), None);
        s.assign(&f2, 26).unwrap();
        assert_eq!(s.lookup(&f2), Some(&26));
    }

    #[test]
    fn iteration_skips_dead_entries() {
        let mut s = store();
        let live = foo();
        let dead = foo();
        s.assign(&live, 1).unwrap();
        s.assign(&dead, 2).unwrap();
        drop(dead);
        let values: Vec<_> = s.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![1]);
    }

    #[test]
    fn cleanup_removes_dead_keys() {
        let f = foo();
        let mut s = store();
        let k = Key::bound(s.counter(), &f);
        s.assign(&k, 26).unwrap();
        drop(f);
        s.cleanup();
        assert!(s.by_id.is_empty());
        assert_eq!(s.lookup(&k), None);
    }

    #[test]
    fn remove_entry() {
        let f = foo();
        let mut s = store();
        s.assign(&f, 7).unwrap();
        assert_eq!(s.remove(&f), Some(7));
        assert!(s.is_empty());
    }

    #[test]
    fn linear_store_lookup() {
        let foos = [foo(), foo(), foo()];
        let mut s = LinearStore::from_items(KeyCounter::new(), vec!["a", "b", "c"]);
        assert_eq!(s.len(), 3);
        for (i, f) in foos.iter().enumerate() {
            s.assign_index(f, i).unwrap();
        }
        for (f, v) in foos.iter().zip(["a", "b", "c"]) {
            assert_eq!(s.lookup(f), Some(&v));
        }
    }

    #[test]
    fn linear_store_index_out_of_range() {
        let mut s: LinearStore<&str> = LinearStore::new(KeyCounter::new());
        let err = s.assign_index(&foo(), 0).unwrap_err();
        assert_eq!(err, IdentityError::IndexOutOfRange { index: 0, len: 0 });
    }

    #[test]
    fn linear_store_unknown_object() {
        let s: LinearStore<&str> = LinearStore::new(KeyCounter::new());
        assert_eq!(s.lookup(&foo()), None);
    }

    #[test]
    fn linear_store_owners() {
        let (a, b, c) = (foo(), foo(), foo());
        let mut s = LinearStore::new(KeyCounter::new());
        let first = s.push("x");
        let second = s.push("y");
        s.assign_index(&a, first).unwrap();
        s.assign_index(&b, first).unwrap();
        s.assign_index(&c, second).unwrap();
        drop(b);
        let owners = s.owners_of(first);
        assert_eq!(owners.len(), 1);
        assert!(owners[0].matches(&a));
    }

    #[test]
    fn replace_sequence_keeps_mappings() {
        let f = foo();
        let mut s = LinearStore::from_items(KeyCounter::new(), vec![1, 2]);
        s.assign_index(&f, 1).unwrap();
        let old = s.replace_sequence(vec![10, 20]);
        assert_eq!(old, vec![1, 2]);
        assert_eq!(s.lookup(&f), Some(&20));
    }
}
