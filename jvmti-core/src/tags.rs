// Object tag store
//
// Maps live objects to agent tags by identity. Keys are held weakly, hashed by
// address and never by the object's own Hash/Eq, and the lookup path neither
// allocates nor calls into the object. Entries whose object has been reclaimed
// are logically absent and are swept when the table resizes.
//
// A weak key keeps the object's allocation (not the object) alive, so a
// reclaimed object's address cannot be reused while its entry remains.

use crate::error::{JvmtiError, JvmtiResult};
use crate::types::Opaque;
use parking_lot::RwLock;
use rustc_hash::{FxHashSet, FxHasher};
use std::fmt;
use std::hash::Hasher;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use tracing::debug;

/// An agent-supplied tag
#[derive(Clone)]
pub enum Tag {
    Long(i64),
    Opaque(Opaque),
}

impl Tag {
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Tag::Long(value) => Some(*value),
            Tag::Opaque(_) => None,
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Tag::Long(0))
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Tag::Long(a), Tag::Long(b)) => a == b,
            (Tag::Opaque(a), Tag::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Long(value) => write!(f, "Long({})", value),
            Tag::Opaque(value) => write!(f, "Opaque({:p})", Arc::as_ptr(value)),
        }
    }
}

/// Object selection for heap iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapFilter {
    All,
    Tagged,
    Untagged,
}

fn address_of<T>(object: &Arc<T>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

struct Entry<T> {
    address: usize,
    key: Weak<T>,
    tag: Tag,
}

impl<T> Entry<T> {
    fn is_live(&self) -> bool {
        self.key.strong_count() > 0
    }
}

/// Open-addressed, linearly probed table. Capacity is a power of two.
struct Table<T> {
    slots: Box<[Option<Entry<T>>]>,
    occupied: usize,
    shift: u32,
    load_factor: f64,
}

impl<T> Table<T> {
    fn with_capacity(capacity: usize, load_factor: f64) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            occupied: 0,
            shift: 64 - capacity.trailing_zeros(),
            load_factor,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn home(&self, address: usize) -> usize {
        let mut hasher = FxHasher::default();
        hasher.write_usize(address);
        (hasher.finish() >> self.shift) as usize
    }

    fn find(&self, address: usize) -> Option<usize> {
        let mut i = self.home(address);
        loop {
            match &self.slots[i] {
                None => return None,
                Some(entry) if entry.address == address => return Some(i),
                Some(_) => i = (i + 1) & self.mask(),
            }
        }
    }

    fn tag_of(&self, address: usize) -> Option<&Tag> {
        self.find(address)
            .and_then(|i| self.slots[i].as_ref())
            .map(|entry| &entry.tag)
    }

    /// Insert, replace, or remove (`None` or an empty tag)
    fn store(&mut self, object: &Arc<T>, tag: Option<Tag>) {
        let address = address_of(object);
        match tag.filter(|tag| !tag.is_empty()) {
            None => {
                self.remove(address);
            }
            Some(tag) => {
                if let Some(i) = self.find(address) {
                    if let Some(entry) = self.slots[i].as_mut() {
                        entry.tag = tag;
                    }
                    return;
                }
                if (self.occupied + 1) as f64 > self.capacity() as f64 * self.load_factor {
                    self.resize();
                }
                self.place(Entry {
                    address,
                    key: Arc::downgrade(object),
                    tag,
                });
            }
        }
    }

    fn place(&mut self, entry: Entry<T>) {
        let mut i = self.home(entry.address);
        while self.slots[i].is_some() {
            i = (i + 1) & self.mask();
        }
        self.slots[i] = Some(entry);
        self.occupied += 1;
    }

    fn remove(&mut self, address: usize) -> bool {
        let Some(mut hole) = self.find(address) else {
            return false;
        };
        self.slots[hole] = None;
        self.occupied -= 1;

        // Backward-shift the rest of the cluster so probes stay unbroken
        let mask = self.mask();
        let mut j = hole;
        loop {
            j = (j + 1) & mask;
            let home = match &self.slots[j] {
                None => break,
                Some(entry) => self.home(entry.address),
            };
            let stays = if hole <= j {
                hole < home && home <= j
            } else {
                hole < home || home <= j
            };
            if !stays {
                self.slots[hole] = self.slots[j].take();
                hole = j;
            }
        }
        true
    }

    /// Rehash live entries, dropping reclaimed ones. Doubles unless the
    /// sweep alone freed at least half the table's entries.
    fn resize(&mut self) {
        let live = self.slots.iter().flatten().filter(|e| e.is_live()).count();
        let capacity = if live * 2 < self.occupied {
            self.capacity()
        } else {
            self.capacity() * 2
        };
        self.rehash(capacity);
    }

    fn rehash(&mut self, capacity: usize) {
        let fresh = Table::with_capacity(capacity, self.load_factor);
        let old = std::mem::replace(self, fresh);
        let before = old.occupied;
        for entry in Vec::from(old.slots).into_iter().flatten() {
            if entry.is_live() {
                self.place(entry);
            }
        }
        debug!(
            "Tag table rehashed to {} slots, swept {} reclaimed entries",
            self.capacity(),
            before - self.occupied
        );
    }
}

pub struct TagStore<T> {
    table: RwLock<Table<T>>,
}

impl<T> TagStore<T> {
    pub fn new(capacity: usize, load_factor: f64) -> Self {
        Self {
            table: RwLock::new(Table::with_capacity(capacity, load_factor)),
        }
    }

    pub fn get(&self, object: &Arc<T>) -> Option<Tag> {
        self.table.read().tag_of(address_of(object)).cloned()
    }

    /// Integer tag, 0 if untagged or tagged with an opaque value
    pub fn get_tag(&self, object: &Arc<T>) -> i64 {
        self.table
            .read()
            .tag_of(address_of(object))
            .and_then(Tag::as_long)
            .unwrap_or(0)
    }

    /// Tag `object`; `None` or `Tag::Long(0)` removes its tag
    pub fn set(&self, object: &Arc<T>, tag: Option<Tag>) {
        self.table.write().store(object, tag);
    }

    pub fn set_tag(&self, object: &Arc<T>, tag: i64) {
        self.set(object, Some(Tag::Long(tag)));
    }

    pub fn set_opaque(&self, object: &Arc<T>, value: Option<Opaque>) {
        self.set(object, value.map(Tag::Opaque));
    }

    /// Visit every tagged live object until `visit` breaks. Entries whose
    /// object is reclaimed during the scan are skipped.
    pub fn for_each(&self, mut visit: impl FnMut(&Arc<T>, &Tag) -> ControlFlow<()>) {
        let table = self.table.read();
        for entry in table.slots.iter().flatten() {
            let Some(object) = entry.key.upgrade() else {
                continue;
            };
            if visit(&object, &entry.tag).is_break() {
                break;
            }
        }
    }

    /// Live objects carrying any of `tags`, each paired with its tag
    pub fn objects_with_tags(&self, tags: &[i64]) -> JvmtiResult<Vec<(Arc<T>, i64)>> {
        if tags.contains(&0) {
            return Err(JvmtiError::IllegalArgument(
                "tag 0 is reserved for untagged objects".to_string(),
            ));
        }

        let mut wanted = FxHashSet::default();
        wanted
            .try_reserve(tags.len())
            .map_err(|_| JvmtiError::OutOfMemory)?;
        wanted.extend(tags.iter().copied());

        let mut found = Vec::new();
        let mut exhausted = false;
        self.for_each(|object, tag| {
            if let Some(value) = tag.as_long().filter(|v| wanted.contains(v)) {
                if found.try_reserve(1).is_err() {
                    exhausted = true;
                    return ControlFlow::Break(());
                }
                found.push((Arc::clone(object), value));
            }
            ControlFlow::Continue(())
        });

        if exhausted {
            return Err(JvmtiError::OutOfMemory);
        }
        Ok(found)
    }

    /// Heap-iteration entry point.
    ///
    /// Walks `objects` (supplied by the heap walker), passing each object
    /// selected by `filter` to `callback` along with its tag, which the
    /// callback may rewrite. The walk holds only the read lock, so concurrent
    /// lookups proceed; rewrites are applied under the write lock once the
    /// walk ends. `callback` must not set tags on this store directly.
    ///
    /// Returns the number of objects passed to `callback`.
    pub fn iterate_through_heap<'a, I, F>(&self, objects: I, filter: HeapFilter, mut callback: F) -> usize
    where
        T: 'a,
        I: IntoIterator<Item = &'a Arc<T>>,
        F: FnMut(&Arc<T>, &mut Option<Tag>) -> ControlFlow<()>,
    {
        let mut visited = 0;
        let mut rewrites = Vec::new();

        {
            let table = self.table.read();
            for object in objects {
                let current = table.tag_of(address_of(object));
                match (filter, current) {
                    (HeapFilter::Tagged, None) | (HeapFilter::Untagged, Some(_)) => continue,
                    _ => {}
                }

                visited += 1;
                let mut tag = current.cloned();
                let flow = callback(object, &mut tag);
                if tag.as_ref() != current {
                    rewrites.push((object, tag));
                }
                if flow.is_break() {
                    break;
                }
            }
        }

        if !rewrites.is_empty() {
            let mut table = self.table.write();
            for (object, tag) in rewrites {
                table.store(object, tag);
            }
        }
        visited
    }

    /// Number of tagged objects still alive
    pub fn len(&self) -> usize {
        self.table
            .read()
            .slots
            .iter()
            .flatten()
            .filter(|entry| entry.is_live())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep reclaimed entries now instead of at the next resize
    pub fn purge(&self) {
        let mut table = self.table.write();
        let capacity = table.capacity();
        table.rehash(capacity);
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.table.read().capacity()
    }

    #[cfg(test)]
    fn occupied(&self) -> usize {
        self.table.read().occupied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::Hash;

    // Equality and hashing that would collapse every instance if used
    #[derive(Debug)]
    struct Collapsing(u32);

    impl PartialEq for Collapsing {
        fn eq(&self, _other: &Self) -> bool {
            true
        }
    }

    impl Hash for Collapsing {
        fn hash<H: Hasher>(&self, state: &mut H) {
            0u8.hash(state);
        }
    }

    fn store() -> TagStore<Collapsing> {
        TagStore::new(8, 0.75)
    }

    #[test]
    fn test_set_get() {
        let store = store();
        let a = Arc::new(Collapsing(1));
        let b = Arc::new(Collapsing(2));

        assert_eq!(store.get(&a), None);
        assert_eq!(store.get_tag(&a), 0);

        store.set_tag(&a, 11);
        store.set_tag(&b, 22);
        assert_eq!(store.get(&a), Some(Tag::Long(11)));
        assert_eq!(store.get_tag(&b), 22);

        store.set_tag(&a, 33);
        assert_eq!(store.get_tag(&a), 33);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_zero_removes() {
        let store = store();
        let a = Arc::new(Collapsing(1));
        store.set_tag(&a, 5);
        store.set_tag(&a, 0);

        assert_eq!(store.get(&a), None);
        assert!(store.is_empty());
        assert_eq!(store.occupied(), 0);
    }

    #[test]
    fn test_opaque_tags() {
        let store = store();
        let a = Arc::new(Collapsing(1));
        let value: Opaque = Arc::new(String::from("agent data"));

        store.set_opaque(&a, Some(Arc::clone(&value)));
        match store.get(&a) {
            Some(Tag::Opaque(found)) => {
                assert!(Arc::ptr_eq(&found, &value));
                assert_eq!(found.downcast_ref::<String>().unwrap(), "agent data");
            }
            other => panic!("unexpected tag {:?}", other),
        }
        assert_eq!(store.get_tag(&a), 0);

        store.set_opaque(&a, None);
        assert_eq!(store.get(&a), None);
    }

    #[test]
    fn test_does_not_retain_objects() {
        let store = store();
        let a = Arc::new(Collapsing(1));
        let b = Arc::new(Collapsing(2));
        store.set_tag(&a, 1);
        store.set_tag(&b, 2);
        assert_eq!(Arc::strong_count(&a), 1);

        drop(a);
        assert_eq!(store.len(), 1);
        let found = store.objects_with_tags(&[1, 2]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1, 2);
        assert_eq!(found[0].0 .0, 2);
    }

    #[test]
    fn test_bulk_query_exact() {
        let store = TagStore::new(16, 0.75);
        let objects: Vec<_> = (0..1000).map(|i| Arc::new(Collapsing(i))).collect();
        let untagged: Vec<_> = (0..50).map(|i| Arc::new(Collapsing(5000 + i))).collect();

        for (i, object) in objects.iter().enumerate() {
            store.set_tag(object, i as i64 + 1);
        }

        let tags: Vec<i64> = (1..=1000).collect();
        let found = store.objects_with_tags(&tags).unwrap();
        assert_eq!(found.len(), 1000);

        let mut seen = FxHashSet::default();
        for (object, tag) in &found {
            assert!(seen.insert(address_of(object)), "duplicate object");
            assert_eq!(object.0 as i64 + 1, *tag);
            assert!(untagged.iter().all(|u| !Arc::ptr_eq(u, object)));
        }

        let some = store.objects_with_tags(&[3, 500, 2000]).unwrap();
        let mut values: Vec<_> = some.iter().map(|(_, tag)| *tag).collect();
        values.sort_unstable();
        assert_eq!(values, vec![3, 500]);
        assert!(store.objects_with_tags(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_zero_in_query_is_illegal() {
        let store = store();
        assert!(matches!(
            store.objects_with_tags(&[1, 0]),
            Err(JvmtiError::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_removal_keeps_cluster_reachable() {
        let store = TagStore::new(64, 0.75);
        let objects: Vec<_> = (0..40).map(|i| Arc::new(Collapsing(i))).collect();
        for (i, object) in objects.iter().enumerate() {
            store.set_tag(object, i as i64 + 1);
        }
        for object in objects.iter().step_by(2) {
            store.set_tag(object, 0);
        }
        for (i, object) in objects.iter().enumerate() {
            let expected = if i % 2 == 0 { 0 } else { i as i64 + 1 };
            assert_eq!(store.get_tag(object), expected);
        }
        assert_eq!(store.occupied(), 20);
    }

    #[test]
    fn test_resize_sweeps_reclaimed_entries() {
        let store = TagStore::new(16, 0.75);
        let dead: Vec<_> = (0..10).map(|i| Arc::new(Collapsing(i))).collect();
        for object in &dead {
            store.set_tag(object, 1);
        }
        drop(dead);
        // Reclaimed entries still occupy slots until a resize
        assert_eq!(store.occupied(), 10);
        assert!(store.is_empty());

        let live: Vec<_> = (0..3).map(|i| Arc::new(Collapsing(100 + i))).collect();
        for object in &live {
            store.set_tag(object, 2);
        }
        // 13 > 16 * 0.75 triggered a sweep without doubling
        assert_eq!(store.capacity(), 16);
        assert_eq!(store.occupied(), 3);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_grows_when_live() {
        let store = TagStore::new(4, 0.75);
        let live: Vec<_> = (0..20).map(|i| Arc::new(Collapsing(i))).collect();
        for object in &live {
            store.set_tag(object, 7);
        }
        assert!(store.capacity() >= 32);
        assert_eq!(store.len(), 20);
    }

    #[test]
    fn test_purge() {
        let store = store();
        let a = Arc::new(Collapsing(1));
        store.set_tag(&a, 1);
        drop(a);
        store.purge();
        assert_eq!(store.occupied(), 0);
    }

    #[test]
    fn test_for_each_early_exit() {
        let store = store();
        let objects: Vec<_> = (0..5).map(|i| Arc::new(Collapsing(i))).collect();
        for object in &objects {
            store.set_tag(object, 9);
        }

        let mut visits = 0;
        store.for_each(|_, _| {
            visits += 1;
            if visits == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(visits, 2);
    }

    #[test]
    fn test_heap_iteration_filters_and_retags() {
        let store = store();
        let objects: Vec<_> = (0..6).map(|i| Arc::new(Collapsing(i))).collect();
        store.set_tag(&objects[1], 10);
        store.set_tag(&objects[3], 30);

        let tagged = store.iterate_through_heap(&objects, HeapFilter::Tagged, |_, tag| {
            // Clear every tagged object's tag
            *tag = None;
            ControlFlow::Continue(())
        });
        assert_eq!(tagged, 2);
        assert!(store.is_empty());

        let untagged = store.iterate_through_heap(&objects, HeapFilter::Untagged, |object, tag| {
            *tag = Some(Tag::Long(object.0 as i64 + 100));
            ControlFlow::Continue(())
        });
        assert_eq!(untagged, 6);
        assert_eq!(store.get_tag(&objects[4]), 104);

        let mut seen = 0;
        let all = store.iterate_through_heap(&objects, HeapFilter::All, |_, _| {
            seen += 1;
            if seen == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(all, 3);
    }

    #[test]
    fn test_heap_iteration_leaves_store_readable() {
        let store = store();
        let objects: Vec<_> = (0..3).map(|i| Arc::new(Collapsing(i))).collect();
        store.set_tag(&objects[0], 7);

        let visited = store.iterate_through_heap(&objects, HeapFilter::All, |object, tag| {
            // Another thread reads while the walk is in progress
            let seen = std::thread::scope(|scope| scope.spawn(|| store.get_tag(&objects[0])).join().unwrap());
            assert_eq!(seen, 7);
            if tag.is_none() {
                *tag = Some(Tag::Long(object.0 as i64 + 1));
            }
            ControlFlow::Continue(())
        });

        assert_eq!(visited, 3);
        assert_eq!(store.get_tag(&objects[0]), 7);
        assert_eq!(store.get_tag(&objects[1]), 2);
        assert_eq!(store.get_tag(&objects[2]), 3);
    }
}
