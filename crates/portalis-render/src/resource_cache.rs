//! Generic age-based resource cache.
//!
//! Entries live in one of two lists. *Active* entries are in use by someone;
//! once the reuse policy reports an active entry as reusable it moves to the
//! *available* list, where [`GenericResourceCache::query`] can hand it out
//! again. Available entries that go unused for longer than `purge_age` are
//! dropped, but the sweep only runs every `aged_purge_interval` ticks.
//!
//! Matching and ordering of entries is pluggable through [`CacheConstraint`],
//! the reuse policy through [`ReuseCondition`].

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use portalis_test_utils::{GpuBuffer, GpuTexture};

use crate::Ticks;

/// Default interval between two aged-entry sweeps.
pub const DEFAULT_AGED_PURGE_INTERVAL: Ticks = 60;
/// Default age after which an unused available entry is dropped.
pub const DEFAULT_PURGE_AGE: Ticks = 60;

/// Matching and ordering of cached payloads against a lookup key.
pub trait CacheConstraint<T> {
    type Key;

    fn is_equal(data: &T, key: &Self::Key) -> bool;
    fn is_larger_equal(data: &T, key: &Self::Key) -> bool;
    /// Order of the available list; lookups take the first match in it.
    fn order(a: &T, b: &T) -> Ordering;
}

/// Every entry matches every key.
///
/// Used for pools of interchangeable payloads such as clipper slots.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConstraint;

impl<T> CacheConstraint<T> for NoConstraint {
    type Key = ();

    fn is_equal(_: &T, _: &()) -> bool {
        true
    }

    fn is_larger_equal(_: &T, _: &()) -> bool {
        true
    }

    fn order(_: &T, _: &T) -> Ordering {
        Ordering::Equal
    }
}

/// A payload with a capacity it can be matched on.
pub trait CacheSized {
    fn cache_size(&self) -> usize;
}

/// Matches by [`CacheSized::cache_size`], smallest first.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortingBySize;

impl<T: CacheSized> CacheConstraint<T> for SortingBySize {
    type Key = usize;

    fn is_equal(data: &T, key: &usize) -> bool {
        data.cache_size() == *key
    }

    fn is_larger_equal(data: &T, key: &usize) -> bool {
        data.cache_size() >= *key
    }

    fn order(a: &T, b: &T) -> Ordering {
        a.cache_size().cmp(&b.cache_size())
    }
}

/// Decides when an active entry may go back to the available list.
pub trait ReuseCondition<T> {
    /// Extra information supplied when an entry is added.
    type AddParameter;
    /// Per-entry bookkeeping kept next to the payload.
    type Aux;

    fn make_aux(param: Self::AddParameter, now: Ticks) -> Self::Aux;
    fn is_reusable(aux: &Self::Aux, data: &T, now: Ticks) -> bool;
    /// Called when an available entry is handed out again.
    fn on_reuse(_aux: &mut Self::Aux, _now: Ticks) {}
}

/// Active entries become available on the next time advance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReuseAlways;

impl<T> ReuseCondition<T> for ReuseAlways {
    type AddParameter = ();
    type Aux = ();

    fn make_aux(_: (), _: Ticks) {}

    fn is_reusable(_: &(), _: &T, _: Ticks) -> bool {
        true
    }
}

/// Shared handles whose outstanding references can be counted.
pub trait SharedHandle {
    fn ref_count(&self) -> usize;
}

impl<T: ?Sized> SharedHandle for Arc<T> {
    fn ref_count(&self) -> usize {
        Arc::strong_count(self)
    }
}

impl SharedHandle for GpuBuffer {
    fn ref_count(&self) -> usize {
        GpuBuffer::ref_count(self)
    }
}

impl SharedHandle for GpuTexture {
    fn ref_count(&self) -> usize {
        GpuTexture::ref_count(self)
    }
}

/// Reusable only while the cache holds the sole reference to the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReuseIfOnlyOneRef;

impl<T: SharedHandle> ReuseCondition<T> for ReuseIfOnlyOneRef {
    type AddParameter = ();
    type Aux = ();

    fn make_aux(_: (), _: Ticks) {}

    fn is_reusable(_: &(), data: &T, _: Ticks) -> bool {
        data.ref_count() == 1
    }
}

/// Side-channel flag the owner of a flagged entry sets once it is done.
#[derive(Debug, Clone, Default)]
pub struct ReuseFlag(Arc<AtomicBool>);

impl ReuseFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_reusable(&self) {
        self.0.store(true, AtomicOrdering::Release);
    }

    pub fn is_reusable(&self) -> bool {
        self.0.load(AtomicOrdering::Acquire)
    }

    fn reset(&self) {
        self.0.store(false, AtomicOrdering::Release);
    }
}

/// Reusable once the entry's [`ReuseFlag`] was set.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReuseConditionFlagged;

impl<T> ReuseCondition<T> for ReuseConditionFlagged {
    type AddParameter = ();
    type Aux = ReuseFlag;

    fn make_aux(_: (), _: Ticks) -> ReuseFlag {
        ReuseFlag::new()
    }

    fn is_reusable(aux: &ReuseFlag, _: &T, _: Ticks) -> bool {
        aux.is_reusable()
    }

    fn on_reuse(aux: &mut ReuseFlag, _: Ticks) {
        aux.reset();
    }
}

/// Reusable once `lifetime` ticks have passed since it was added.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReuseConditionAfterTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeToDie(pub Ticks);

impl<T> ReuseCondition<T> for ReuseConditionAfterTime {
    type AddParameter = Ticks;
    type Aux = TimeToDie;

    fn make_aux(lifetime: Ticks, now: Ticks) -> TimeToDie {
        TimeToDie(now + lifetime)
    }

    fn is_reusable(aux: &TimeToDie, _: &T, now: Ticks) -> bool {
        now > aux.0
    }
}

/// A cached payload and its policy bookkeeping.
#[derive(Debug)]
pub struct CacheEntry<T, A> {
    pub data: T,
    pub aux: A,
    last_used: Ticks,
}

impl<T, A> CacheEntry<T, A> {
    pub fn last_used(&self) -> Ticks {
        self.last_used
    }
}

pub struct GenericResourceCache<T, C, R>
where
    C: CacheConstraint<T>,
    R: ReuseCondition<T>,
{
    available: Vec<CacheEntry<T, R::Aux>>,
    active: Vec<CacheEntry<T, R::Aux>>,
    current_time: Ticks,
    next_purge: Ticks,
    clear_requested: bool,
    /// Ticks between two sweeps of aged available entries.
    pub aged_purge_interval: Ticks,
    /// Age after which an unused available entry is dropped.
    pub purge_age: Ticks,
    _policy: PhantomData<fn() -> (C, R)>,
}

impl<T, C, R> Default for GenericResourceCache<T, C, R>
where
    C: CacheConstraint<T>,
    R: ReuseCondition<T>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C, R> GenericResourceCache<T, C, R>
where
    C: CacheConstraint<T>,
    R: ReuseCondition<T>,
{
    pub fn new() -> Self {
        Self {
            available: Vec::new(),
            active: Vec::new(),
            current_time: 0,
            next_purge: 0,
            clear_requested: false,
            aged_purge_interval: DEFAULT_AGED_PURGE_INTERVAL,
            purge_age: DEFAULT_PURGE_AGE,
            _policy: PhantomData,
        }
    }

    pub fn current_time(&self) -> Ticks {
        self.current_time
    }

    /// Takes an available entry matching `key` and makes it active.
    ///
    /// With `exact` the entry must compare equal to the key, otherwise the
    /// first entry at least as large is taken.
    pub fn query(&mut self, key: &C::Key, exact: bool) -> Option<&mut CacheEntry<T, R::Aux>> {
        let index = self.available.iter().position(|entry| {
            if exact {
                C::is_equal(&entry.data, key)
            } else {
                C::is_larger_equal(&entry.data, key)
            }
        })?;

        let mut entry = self.available.remove(index);
        entry.last_used = self.current_time;
        R::on_reuse(&mut entry.aux, self.current_time);
        self.active.push(entry);
        self.active.last_mut()
    }

    /// Adds a new payload directly to the active list.
    pub fn add_active(&mut self, data: T, param: R::AddParameter) -> &mut CacheEntry<T, R::Aux> {
        let entry = CacheEntry {
            data,
            aux: R::make_aux(param, self.current_time),
            last_used: self.current_time,
        };
        let index = self.active.len();
        self.active.push(entry);
        &mut self.active[index]
    }

    /// Advances the cache clock.
    ///
    /// Runs a deferred clear first, then sweeps aged available entries if the
    /// purge interval has elapsed, then moves reusable active entries to the
    /// available list.
    pub fn advance_time(&mut self, now: Ticks) {
        if self.clear_requested {
            self.clear_now();
        }

        self.current_time = now;

        if now >= self.next_purge {
            let purge_age = self.purge_age;
            let before = self.available.len();
            self.available.retain(|entry| now <= entry.last_used + purge_age);
            let purged = before - self.available.len();
            if purged > 0 {
                tracing::debug!("Resource cache purged {} aged entries at tick {}", purged, now);
            }
            self.next_purge = now + self.aged_purge_interval;
        }

        let mut index = 0;
        while index < self.active.len() {
            let entry = &self.active[index];
            if R::is_reusable(&entry.aux, &entry.data, now) {
                let entry = self.active.swap_remove(index);
                let at = self
                    .available
                    .partition_point(|other| C::order(&other.data, &entry.data) != Ordering::Greater);
                self.available.insert(at, entry);
            } else {
                index += 1;
            }
        }
    }

    /// Drops every entry, either immediately or at the next time advance.
    pub fn clear(&mut self, immediately: bool) {
        if immediately {
            self.clear_now();
        } else {
            self.clear_requested = true;
        }
    }

    fn clear_now(&mut self) {
        self.available.clear();
        self.active.clear();
        self.clear_requested = false;
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter_active(&self) -> impl Iterator<Item = &CacheEntry<T, R::Aux>> {
        self.active.iter()
    }

    pub fn iter_available(&self) -> impl Iterator<Item = &CacheEntry<T, R::Aux>> {
        self.available.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Block(usize);

    impl CacheSized for Block {
        fn cache_size(&self) -> usize {
            self.0
        }
    }

    impl CacheSized for Arc<Block> {
        fn cache_size(&self) -> usize {
            self.0
        }
    }

    type TimedCache = GenericResourceCache<Block, SortingBySize, ReuseConditionAfterTime>;

    #[test]
    fn test_aged_entry_survives_purge_age() {
        let mut cache = TimedCache::new();
        cache.purge_age = 10;
        cache.aged_purge_interval = 5;

        cache.advance_time(100);
        cache.add_active(Block(4), 0);

        for now in 101..110 {
            cache.advance_time(now);
            assert_eq!(cache.available_count(), 1, "missing at tick {}", now);
        }
        assert!(cache.query(&4, true).is_some());
    }

    #[test]
    fn test_aged_entry_evicted_within_interval() {
        let mut cache = TimedCache::new();
        cache.purge_age = 10;
        cache.aged_purge_interval = 5;

        cache.advance_time(0);
        cache.add_active(Block(4), 0);
        cache.advance_time(1);
        assert_eq!(cache.available_count(), 1);

        for now in 2..=(10 + 5) {
            cache.advance_time(now);
        }
        assert_eq!(cache.available_count(), 0);
        assert!(cache.query(&4, false).is_none());
    }

    #[test]
    fn test_non_exact_query_returns_smallest_fit() {
        let mut cache = TimedCache::new();
        cache.add_active(Block(64), 0);
        cache.add_active(Block(8), 0);
        cache.add_active(Block(16), 0);
        cache.advance_time(1);

        let entry = cache.query(&10, false).unwrap();
        assert_eq!(entry.data, Block(16));
        assert!(cache.query(&100, false).is_none());
        assert!(cache.query(&10, true).is_none());
        assert_eq!(cache.query(&8, true).unwrap().data, Block(8));
    }

    #[test]
    fn test_shared_entry_not_reused_while_referenced() {
        let mut cache: GenericResourceCache<Arc<Block>, SortingBySize, ReuseIfOnlyOneRef> =
            GenericResourceCache::new();
        cache.purge_age = 1;
        cache.aged_purge_interval = 1;

        let outside = cache.add_active(Arc::new(Block(3)), ()).data.clone();
        for now in 1..50 {
            cache.advance_time(now);
            assert!(cache.query(&3, false).is_none());
        }
        assert_eq!(cache.active_count(), 1);

        drop(outside);
        cache.advance_time(50);
        assert!(cache.query(&3, false).is_some());
    }

    #[test]
    fn test_flagged_entry_needs_flag() {
        let mut cache: GenericResourceCache<u32, NoConstraint, ReuseConditionFlagged> =
            GenericResourceCache::new();
        let flag = cache.add_active(7, ()).aux.clone();

        cache.advance_time(1);
        assert!(cache.query(&(), false).is_none());

        flag.mark_reusable();
        cache.advance_time(2);
        let entry = cache.query(&(), false).unwrap();
        assert_eq!(entry.data, 7);
        assert!(!entry.aux.is_reusable());
    }

    #[test]
    fn test_reuse_always() {
        let mut cache: GenericResourceCache<u32, NoConstraint, ReuseAlways> = GenericResourceCache::new();
        cache.add_active(1, ());
        cache.advance_time(1);
        assert_eq!(cache.available_count(), 1);
        assert_eq!(cache.active_count(), 0);
    }

    #[test]
    fn test_deferred_clear() {
        let mut cache = TimedCache::new();
        cache.add_active(Block(1), 0);
        cache.clear(false);
        assert_eq!(cache.len(), 1);

        cache.advance_time(1);
        assert!(cache.is_empty());

        cache.add_active(Block(1), 0);
        cache.clear(true);
        assert!(cache.is_empty());
    }
}
