use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Type-erased shared object, the unit tree converters produce and consume.
pub type AnyObject = Arc<dyn Any + Send + Sync>;

trait Liveness: Send + Sync {
    fn is_alive(&self) -> bool;
}

impl<T: ?Sized + Send + Sync> Liveness for Weak<T> {
    fn is_alive(&self) -> bool {
        self.strong_count() > 0
    }
}

/// Weak handle onto an object, recording the address it lived at.
///
/// The address stays unique while the referent is alive: the weak count held
/// here keeps the allocation from being reused by another object.
#[derive(Clone)]
pub struct Referent {
    addr: usize,
    liveness: Arc<dyn Liveness>,
}

impl Referent {
    /// Downgrade a shared object into a referent.
    pub fn of<T: ?Sized + Send + Sync + 'static>(obj: &Arc<T>) -> Self {
        Self {
            addr: Arc::as_ptr(obj) as *const () as usize,
            liveness: Arc::new(Arc::downgrade(obj)),
        }
    }

    /// Address of the referent, regardless of liveness.
    pub fn address(&self) -> usize {
        self.addr
    }

    /// Whether at least one strong reference to the referent remains.
    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    /// Address of the referent if it is still alive.
    pub fn live_address(&self) -> Option<usize> {
        self.is_alive().then_some(self.addr)
    }
}

impl fmt::Debug for Referent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Referent({:#x}, alive={})", self.addr, self.is_alive())
    }
}

/// An object whose identity can be tracked without owning it.
pub trait Identity {
    /// Address identifying the object while it is alive.
    fn identity(&self) -> usize;

    /// A weak handle onto the object.
    fn referent(&self) -> Referent;
}

impl<T: ?Sized + Send + Sync + 'static> Identity for Arc<T> {
    fn identity(&self) -> usize {
        Arc::as_ptr(self) as *const () as usize
    }

    fn referent(&self) -> Referent {
        Referent::of(self)
    }
}

/// Monotonic key counter owned by one document session.
///
/// Clones share the same underlying counter.
#[derive(Clone, Debug, Default)]
pub struct KeyCounter {
    next: Arc<AtomicU64>,
}

impl KeyCounter {
    /// A counter starting at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next counter value.
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The value the next call to [`allocate`](Self::allocate) will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

struct KeyInner {
    counter: u64,
    referent: RwLock<Option<Referent>>,
}

/// Hashable handle correlating a counter with a weakly held object.
///
/// `Key` is a shared handle: clones observe the same binding, so a key handed
/// to a converter before its object exists becomes valid once the object is
/// assigned. Use [`Key::copy`] for an independent key with the same counter.
///
/// Equality requires equal counters and the same live referent on both
/// sides. An unbound or expired key is never equal to anything, which is why
/// `Key` implements `PartialEq` but not `Eq`.
#[derive(Clone)]
pub struct Key {
    inner: Arc<KeyInner>,
}

impl Key {
    /// An unbound key with the next counter value.
    pub fn new(counter: &KeyCounter) -> Self {
        Self::with_value(counter.allocate(), None)
    }

    /// A key with the next counter value, bound to `obj`.
    pub fn bound(counter: &KeyCounter, obj: &dyn Identity) -> Self {
        Self::with_value(counter.allocate(), Some(obj))
    }

    /// A key with an explicit counter value.
    pub fn with_value(counter: u64, obj: Option<&dyn Identity>) -> Self {
        Self {
            inner: Arc::new(KeyInner {
                counter,
                referent: RwLock::new(obj.map(|o| o.referent())),
            }),
        }
    }

    /// The counter value labelling this key. Never changes.
    pub fn counter(&self) -> u64 {
        self.inner.counter
    }

    /// True iff the key is bound and its referent is alive.
    pub fn is_valid(&self) -> bool {
        self.live_address().is_some()
    }

    /// True iff the key's live referent is `obj`.
    pub fn matches(&self, obj: &dyn Identity) -> bool {
        self.live_address() == Some(obj.identity())
    }

    /// Bind (or rebind) the key to `obj`.
    pub fn assign(&self, obj: &dyn Identity) {
        *self.inner.referent.write().expect("key lock poisoned") = Some(obj.referent());
    }

    /// Address of the referent, if bound and alive.
    pub fn live_address(&self) -> Option<usize> {
        self.inner
            .referent
            .read()
            .expect("key lock poisoned")
            .as_ref()
            .and_then(Referent::live_address)
    }

    /// An independent key with the same counter, bound to the current
    /// referent if it is still alive.
    pub fn copy(&self) -> Self {
        let referent = self
            .inner
            .referent
            .read()
            .expect("key lock poisoned")
            .as_ref()
            .filter(|r| r.is_alive())
            .cloned();
        Self {
            inner: Arc::new(KeyInner {
                counter: self.inner.counter,
                referent: RwLock::new(referent),
            }),
        }
    }

    /// Whether both handles refer to the same key instance.
    pub fn same_handle(&self, other: &Key) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        if self.counter() != other.counter() {
            return false;
        }
        match self.live_address() {
            Some(addr) => other.live_address() == Some(addr),
            None => false,
        }
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.counter.hash(state);
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.referent.read().expect("key lock poisoned").as_ref() {
            None => "unassigned",
            Some(r) if r.is_alive() => "live",
            Some(_) => "expired",
        };
        write!(f, "Key(#{}, {state})", self.inner.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct Foo;

    fn foo() -> Arc<Foo> {
        Arc::new(Foo)
    }

    #[test]
    fn unique_per_object() {
        let counter = KeyCounter::new();
        let mut seen = HashSet::new();
        let objects: Vec<_> = (0..10).map(|_| foo()).collect();
        for f in &objects {
            let key = Key::bound(&counter, f);
            assert!(seen.insert(key.counter()));
        }
    }

    #[test]
    fn keys_for_same_object_differ() {
        let counter = KeyCounter::new();
        let f = foo();
        let k1 = Key::bound(&counter, &f);
        let k2 = Key::bound(&counter, &f);
        assert_ne!(k1, k2);
    }

    #[test]
    fn counter_starts_at_zero_and_is_shared() {
        let counter = KeyCounter::new();
        let clone = counter.clone();
        assert_eq!(Key::new(&counter).counter(), 0);
        assert_eq!(Key::new(&clone).counter(), 1);
        assert_eq!(counter.peek(), 2);
    }

    #[test]
    fn matches_bound_object() {
        let f = foo();
        let key = Key::bound(&KeyCounter::new(), &f);
        assert!(key.matches(&f));
        assert!(!key.matches(&foo()));
    }

    #[test]
    fn unassigned_matches_nothing() {
        let key = Key::new(&KeyCounter::new());
        assert!(!key.is_valid());
        assert!(!key.matches(&foo()));
    }

    #[test]
    fn invalid_after_drop() {
        let f = foo();
        let key = Key::bound(&KeyCounter::new(), &f);
        assert!(key.is_valid());
        drop(f);
        assert!(!key.is_valid());
        assert!(!key.matches(&foo()));
    }

    #[test]
    fn equal_with_same_counter_and_referent() {
        let f = foo();
        let k1 = Key::with_value(42, Some(&f));
        let k2 = Key::with_value(42, Some(&f));
        assert_eq!(k1, k2);
    }

    #[test]
    fn same_counter_different_referents_not_equal() {
        let (a, b) = (foo(), foo());
        let k1 = Key::with_value(42, Some(&a));
        let k2 = Key::with_value(42, Some(&b));
        assert_ne!(k1, k2);
    }

    #[test]
    fn unassigned_not_equal_even_to_itself() {
        let k1 = Key::with_value(42, None);
        let k2 = Key::with_value(42, None);
        assert_ne!(k1, k2);
        assert_ne!(k1, k1.clone());
    }

    #[test]
    fn expired_keys_not_equal() {
        let f = foo();
        let k1 = Key::with_value(42, Some(&f));
        let k2 = Key::with_value(42, Some(&f));
        drop(f);
        assert_ne!(k1, k2);
    }

    #[test]
    fn copy_preserves_counter_and_referent() {
        let f = foo();
        let k1 = Key::bound(&KeyCounter::new(), &f);
        let k2 = k1.copy();
        assert_eq!(k1, k2);
        assert!(!k1.same_handle(&k2));
    }

    #[test]
    fn copy_of_unassigned_not_equal() {
        let k1 = Key::new(&KeyCounter::new());
        assert_ne!(k1, k1.copy());
    }

    #[test]
    fn copy_of_expired_not_equal() {
        let f = foo();
        let k1 = Key::bound(&KeyCounter::new(), &f);
        let k2 = k1.copy();
        drop(f);
        assert_ne!(k1, k2);
    }

    #[test]
    fn clones_share_late_binding() {
        let key = Key::new(&KeyCounter::new());
        let handle = key.clone();
        let f = foo();
        key.assign(&f);
        assert!(handle.matches(&f));
        assert!(handle.same_handle(&key));
    }

    #[test]
    fn copy_after_binding_is_detached() {
        let key = Key::new(&KeyCounter::new());
        let detached = key.copy();
        let f = foo();
        key.assign(&f);
        assert!(!detached.is_valid());
    }

    #[test]
    fn identity_of_unsized_arc() {
        let bytes: Arc<[u8]> = Arc::from(vec![1u8, 2, 3]);
        let key = Key::bound(&KeyCounter::new(), &bytes);
        assert!(key.matches(&bytes));
        let erased: AnyObject = Arc::new(5u32);
        assert!(Key::bound(&KeyCounter::new(), &erased).matches(&erased));
    }
}
