//! Graph-scoped memory management for the anyflow dataflow engine.
//!
//! Serving pipelines execute thousands of short-lived graph runs per second.
//! Allocating scratch objects through the global allocator and destroying
//! them one by one after every run is measurable overhead, so the engine
//! routes per-run allocations through a [`MemoryRegion`]: objects accumulate
//! on a deferred-destruction list during a run and are all torn down in one
//! pass by [`MemoryRegion::release`] when the graph is reset.
//!
//! [`ReusableManager`] covers the complementary pattern: objects that should
//! *survive* reset with their storage intact (buffers, string scratch,
//! accumulators). Registered objects are logically cleared on every
//! [`ReusableManager::clear`] and fully recreated every few cycles so that
//! capacity amassed by pathological requests does not live forever.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A region of objects whose lifetimes all end at the same time.
///
/// `create` hands out a shared reference to a freshly stored object. The
/// object stays alive until [`release`](Self::release), at which point every
/// object created through the region is destroyed in one pass. The borrow
/// checker enforces the contract for the safe API: `release` takes `&mut
/// self`, so no reference obtained from `create` can still be alive.
///
/// Addresses are stable: objects are boxed individually, so growing the
/// internal list never moves them.
#[derive(Default)]
pub struct MemoryRegion {
    objects: Mutex<Vec<Box<dyn Any + Send + Sync>>>,
}

impl MemoryRegion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` in the region and return a reference to it.
    ///
    /// The reference is valid until the region is released.
    pub fn create<T: Send + Sync + 'static>(&self, value: T) -> &T {
        let boxed = Box::new(value);
        let ptr: *const T = &*boxed;
        self.objects.lock().push(boxed);
        // SAFETY: the box is owned by `objects` and individually heap
        // allocated, so `ptr` stays valid until the vector is cleared.
        // Clearing requires either `&mut self` (`release`) or the caller
        // upholding the contract of `release_shared`, both of which end
        // every outstanding `&T`.
        unsafe { &*ptr }
    }

    /// Number of objects currently held by the region.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Destroy every object created through this region.
    pub fn release(&mut self) {
        self.objects.get_mut().clear();
    }

    /// Destroy every object through a shared reference.
    ///
    /// Exists for embedders that keep the region behind an `Arc` and
    /// serialize resets externally (the anyflow graph does: `Graph::reset`
    /// takes the graph exclusively and must not overlap a run).
    ///
    /// # Safety
    ///
    /// No reference returned by [`create`](Self::create) may be alive, and no
    /// concurrent `create` call may be in flight.
    pub unsafe fn release_shared(&self) {
        self.objects.lock().clear();
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("objects", &self.len())
            .finish()
    }
}

/// Types that can be logically emptied while keeping their storage.
pub trait Reuse: Send + 'static {
    fn reuse(&mut self);
}

impl Reuse for String {
    fn reuse(&mut self) {
        self.clear();
    }
}

impl<T: Send + 'static> Reuse for Vec<T> {
    fn reuse(&mut self) {
        self.clear();
    }
}

impl<K: Send + 'static, V: Send + 'static, S: Send + 'static> Reuse
    for std::collections::HashMap<K, V, S>
{
    fn reuse(&mut self) {
        self.clear();
    }
}

/// How many clear cycles a reusable object lives before it is rebuilt from
/// scratch. Reuse keeps capacity; periodic recreation bounds how long an
/// oversized allocation from one unusual request can linger.
const RECREATE_INTERVAL: usize = 1024;

struct ReusableSlot<T: Reuse + Default> {
    value: Mutex<T>,
}

trait AnySlot: Send + Sync {
    fn clear(&self, recreate: bool);
}

impl<T: Reuse + Default + Send + Sync> AnySlot for ReusableSlot<T> {
    fn clear(&self, recreate: bool) {
        let mut value = self.value.lock();
        if recreate {
            *value = T::default();
        } else {
            value.reuse();
        }
    }
}

/// Handle to an object managed by a [`ReusableManager`].
///
/// The object is shared with the manager; access goes through [`with`]
/// (shared) and [`with_mut`] (exclusive).
///
/// [`with`]: Self::with
/// [`with_mut`]: Self::with_mut
pub struct ReusableObject<T: Reuse + Default> {
    slot: Arc<ReusableSlot<T>>,
}

impl<T: Reuse + Default> ReusableObject<T> {
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.slot.value.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.slot.value.lock())
    }
}

impl<T: Reuse + Default> Clone for ReusableObject<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

/// Registry of objects that are logically cleared on every graph reset and
/// recreated from scratch every [`RECREATE_INTERVAL`] cycles.
#[derive(Default)]
pub struct ReusableManager {
    slots: Mutex<Vec<Arc<dyn AnySlot>>>,
    cycles: AtomicUsize,
}

impl ReusableManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a managed object initialized with `T::default()`.
    pub fn create<T: Reuse + Default + Send + Sync>(&self) -> ReusableObject<T> {
        let slot = Arc::new(ReusableSlot {
            value: Mutex::new(T::default()),
        });
        self.slots.lock().push(slot.clone());
        ReusableObject { slot }
    }

    /// Logically clear every managed object.
    pub fn clear(&self) {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let recreate = cycle % RECREATE_INTERVAL == 0;
        if recreate {
            tracing::debug!(cycle, "recreating reusable objects");
        }
        for slot in self.slots.lock().iter() {
            slot.clear(recreate);
        }
    }

    /// Number of managed objects.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl std::fmt::Debug for ReusableManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReusableManager")
            .field("slots", &self.len())
            .field("cycles", &self.cycles.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_create_and_release() {
        let mut region = MemoryRegion::new();
        {
            let a = region.create(41_i32);
            let b = region.create(String::from("payload"));
            assert_eq!(*a, 41);
            assert_eq!(b, "payload");
            assert_eq!(region.len(), 2);
        }
        region.release();
        assert!(region.is_empty());
    }

    #[test]
    fn test_region_addresses_stable_across_growth() {
        let region = MemoryRegion::new();
        let first = region.create(String::from("first"));
        let first_ptr = first as *const String;
        for i in 0..256 {
            region.create(i);
        }
        assert_eq!(first as *const String, first_ptr);
        assert_eq!(first, "first");
    }

    #[test]
    fn test_region_drops_objects_on_release() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let mut region = MemoryRegion::new();
        region.create(Tracked(drops.clone()));
        region.create(Tracked(drops.clone()));
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        region.release();
        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_reusable_clear_keeps_capacity() {
        let manager = ReusableManager::new();
        let buffer = manager.create::<String>();
        buffer.with_mut(|s| s.push_str("some long scratch content"));
        let capacity = buffer.with(|s| s.capacity());
        assert!(capacity >= 25);

        manager.clear();
        buffer.with(|s| assert!(s.is_empty()));
        assert_eq!(buffer.with(|s| s.capacity()), capacity);
    }

    #[test]
    fn test_reusable_recreates_after_interval() {
        let manager = ReusableManager::new();
        let buffer = manager.create::<Vec<u8>>();
        buffer.with_mut(|v| v.extend_from_slice(&[0; 4096]));

        for _ in 0..RECREATE_INTERVAL {
            manager.clear();
        }
        buffer.with(|v| {
            assert!(v.is_empty());
            assert_eq!(v.capacity(), 0, "recreation should drop capacity");
        });
    }

    #[test]
    fn test_reusable_objects_shared() {
        let manager = ReusableManager::new();
        let a = manager.create::<Vec<i32>>();
        let b = a.clone();
        a.with_mut(|v| v.push(7));
        b.with(|v| assert_eq!(v.as_slice(), &[7]));
    }
}
