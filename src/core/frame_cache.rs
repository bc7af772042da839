//! Reference-counted, size-bounded frame cache.
//!
//! Entries live in an arena of slots addressed by `(index, generation)`
//! handles. LRU order is kept in an `IndexSet` of slot indices: head is the
//! least recently used entry, tail the most recently inserted or touched.
//!
//! Every successful `insert`/`lookup` hands out a [`FrameGuard`] that
//! releases its reference on drop. Entries with live references are never
//! evicted, so the cache may sit above budget while every oversized entry is
//! still on screen.
//!
//! # Eviction
//!
//! - `Lru`: sweep head → tail removing idle entries while over budget.
//! - `LruPlayback`: first remove idle entries whose frame number is below
//!   the playback hint (see [`FrameCache::playback_hint`]), oldest first,
//!   then run the plain LRU sweep.

use indexmap::IndexSet;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::event_bus::EventEmitter;
use crate::core::events::{CacheChange, CacheChanged};
use crate::entities::{Frame, FramePayload, OwnerId};

/// Eviction policy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CachePolicy {
    /// Plain least-recently-used eviction
    Lru,
    /// Prefer evicting frames behind the playback hint, then plain LRU
    #[default]
    LruPlayback,
}

/// Cache statistics for monitoring performance
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Generational reference to a cache slot.
///
/// A handle outlives its entry safely: once the slot is reused the
/// generation no longer matches and the handle resolves to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    index: u32,
    generation: u32,
}

/// Who an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOwner {
    Owned(OwnerId),
    /// Owner was forgotten while the entry was still referenced.
    /// Unreachable by lookup, reclaimed once idle.
    Orphaned,
}

struct CacheEntry<P> {
    payload: Arc<P>,
    size: usize,
    owner: EntryOwner,
    frame: i64,
    refs: u32,
}

struct Slot<P> {
    generation: u32,
    entry: Option<CacheEntry<P>>,
}

struct CacheInner<P> {
    slots: Vec<Slot<P>>,
    free: Vec<u32>,
    /// Slot indices, LRU at front, MRU at back
    order: IndexSet<u32>,
    /// (owner, frame) -> slot index, owned entries only
    index: HashMap<(OwnerId, i64), u32>,
    budget: usize,
    used: usize,
    policy: CachePolicy,
}

impl<P: FramePayload> CacheInner<P> {
    fn new(budget: usize, policy: CachePolicy) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: IndexSet::new(),
            index: HashMap::new(),
            budget,
            used: 0,
            policy,
        }
    }

    fn entry(&self, idx: u32) -> Option<&CacheEntry<P>> {
        self.slots.get(idx as usize).and_then(|s| s.entry.as_ref())
    }

    fn resolve_mut(&mut self, handle: FrameHandle) -> Option<&mut CacheEntry<P>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.entry.as_mut())
    }

    fn handle_of(&self, idx: u32) -> FrameHandle {
        FrameHandle { index: idx, generation: self.slots[idx as usize].generation }
    }

    fn alloc(&mut self, entry: CacheEntry<P>) -> u32 {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize].entry = Some(entry);
                idx
            }
            None => {
                self.slots.push(Slot { generation: 0, entry: Some(entry) });
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Drop an entry and recycle its slot.
    fn remove(&mut self, idx: u32) -> Option<CacheEntry<P>> {
        let slot = self.slots.get_mut(idx as usize)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(idx);
        self.order.shift_remove(&idx);
        if let EntryOwner::Owned(owner) = entry.owner {
            let key = (owner, entry.frame);
            if self.index.get(&key) == Some(&idx) {
                self.index.remove(&key);
            }
        }
        self.used = self.used.saturating_sub(entry.size);
        Some(entry)
    }

    /// Idle entries in LRU order that satisfy `pred`.
    fn idle_where(&self, pred: impl Fn(&CacheEntry<P>) -> bool) -> Vec<u32> {
        self.order
            .iter()
            .copied()
            .filter(|&i| self.entry(i).is_some_and(|e| e.refs == 0 && pred(e)))
            .collect()
    }

    fn evict_while_over_budget(&mut self, candidates: Vec<u32>) -> usize {
        let mut evicted = 0;
        for idx in candidates {
            if self.used <= self.budget {
                break;
            }
            if let Some(entry) = self.remove(idx) {
                debug!("Evicted frame {} ({} bytes), used {}/{}", entry.frame, entry.size, self.used, self.budget);
                evicted += 1;
            }
        }
        evicted
    }

    fn playback_hint(&self) -> Option<i64> {
        self.order.last().and_then(|&i| self.entry(i)).map(|e| e.frame)
    }

    fn purge(&mut self) -> usize {
        // Orphans can never be looked up again, reclaim them as soon as they are idle
        let mut evicted = 0;
        for idx in self.idle_where(|e| e.owner == EntryOwner::Orphaned) {
            if self.remove(idx).is_some() {
                evicted += 1;
            }
        }

        if self.policy == CachePolicy::LruPlayback
            && let Some(hint) = self.playback_hint()
        {
            let behind = self.idle_where(|e| e.frame < hint);
            evicted += self.evict_while_over_budget(behind);
        }

        let idle = self.idle_where(|_| true);
        evicted += self.evict_while_over_budget(idle);

        if self.used > self.budget {
            trace!("Purge left cache over budget: {}/{} (all remaining entries busy)", self.used, self.budget);
        }
        evicted
    }
}

/// Size-bounded frame cache shared between sessions.
///
/// Cloning yields another handle onto the same cache.
pub struct FrameCache<P: FramePayload = Frame> {
    inner: Arc<Mutex<CacheInner<P>>>,
    stats: Arc<CacheStats>,
    emitter: EventEmitter,
}

impl<P: FramePayload> Clone for FrameCache<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            stats: Arc::clone(&self.stats),
            emitter: self.emitter.clone(),
        }
    }
}

impl<P: FramePayload> std::fmt::Debug for FrameCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("FrameCache")
            .field("entries", &inner.order.len())
            .field("used", &inner.used)
            .field("budget", &inner.budget)
            .field("policy", &inner.policy)
            .finish()
    }
}

impl<P: FramePayload> FrameCache<P> {
    /// Create a cache with a byte budget. Notifications go to `emitter`.
    pub fn new(budget: usize, policy: CachePolicy, emitter: EventEmitter) -> Self {
        debug!("FrameCache created: budget={} MB, policy={:?}", budget / 1024 / 1024, policy);
        Self {
            inner: Arc::new(Mutex::new(CacheInner::new(budget, policy))),
            stats: Arc::new(CacheStats::new()),
            emitter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<P>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, change: CacheChange, inner: MutexGuard<'_, CacheInner<P>>, evicted: usize) {
        let event = CacheChanged { change, used: inner.used, budget: inner.budget, evicted };
        // Subscribers may query the cache, never emit while locked
        drop(inner);
        self.emitter.emit(event);
    }

    /// Add a frame at the MRU end with one reference held by the returned guard.
    ///
    /// Purges if the insert pushed the cache over budget and always notifies.
    /// Re-inserting an (owner, frame) pair that is already resident orphans
    /// the older entry.
    pub fn insert(&self, owner: OwnerId, frame: i64, payload: P) -> FrameGuard<P> {
        let size = payload.mem();
        let payload = Arc::new(payload);
        let mut inner = self.lock();

        if let Some(old) = inner.index.remove(&(owner, frame))
            && let Some(slot) = inner.slots.get_mut(old as usize)
            && let Some(entry) = slot.entry.as_mut()
        {
            debug!("Replacing {}:{}, previous entry orphaned", owner, frame);
            entry.owner = EntryOwner::Orphaned;
        }

        let idx = inner.alloc(CacheEntry {
            payload: Arc::clone(&payload),
            size,
            owner: EntryOwner::Owned(owner),
            frame,
            refs: 1,
        });
        inner.order.insert(idx);
        inner.index.insert((owner, frame), idx);
        inner.used += size;
        let handle = inner.handle_of(idx);
        debug!("Cached frame {}:{} ({} bytes), used {}/{}", owner, frame, size, inner.used, inner.budget);

        let evicted = if inner.used > inner.budget { inner.purge() } else { 0 };
        self.notify(CacheChange::Insert, inner, evicted);

        FrameGuard { cache: self.clone(), handle, frame, payload, released: false }
    }

    /// Find a resident frame and take a reference to it.
    ///
    /// A hit moves the entry to the MRU end. A miss changes nothing.
    pub fn lookup(&self, owner: OwnerId, frame: i64) -> Option<FrameGuard<P>> {
        let mut inner = self.lock();
        let Some(&idx) = inner.index.get(&(owner, frame)) else {
            self.stats.record_miss();
            return None;
        };
        self.stats.record_hit();

        let handle = inner.handle_of(idx);
        let payload = {
            let entry = inner.resolve_mut(handle)?;
            entry.refs += 1;
            Arc::clone(&entry.payload)
        };
        inner.order.shift_remove(&idx);
        inner.order.insert(idx);
        trace!("Cache hit {}:{}", owner, frame);

        Some(FrameGuard { cache: self.clone(), handle, frame, payload, released: false })
    }

    /// Drop one reference. Never deletes; idle entries wait for purge/forget.
    pub fn release(&self, handle: FrameHandle) {
        let mut inner = self.lock();
        match inner.resolve_mut(handle) {
            Some(entry) if entry.refs > 0 => entry.refs -= 1,
            Some(entry) => warn!("Release of idle frame {} ignored", entry.frame),
            None => warn!("Release of stale handle {:?} ignored", handle),
        }
    }

    /// Drop everything `owner` is not using; orphan the entries it still is.
    pub fn forget(&self, owner: OwnerId) {
        let mut inner = self.lock();
        let matching: Vec<u32> = inner
            .order
            .iter()
            .copied()
            .filter(|&i| inner.entry(i).is_some_and(|e| e.owner == EntryOwner::Owned(owner)))
            .collect();

        let mut evicted = 0;
        let mut orphaned = 0;
        for idx in matching {
            let busy = inner.entry(idx).is_some_and(|e| e.refs > 0);
            if !busy {
                if inner.remove(idx).is_some() {
                    evicted += 1;
                }
                continue;
            }
            let frame = match inner.slots[idx as usize].entry.as_mut() {
                Some(entry) => {
                    entry.owner = EntryOwner::Orphaned;
                    entry.frame
                }
                None => continue,
            };
            inner.index.remove(&(owner, frame));
            orphaned += 1;
        }
        debug!("Forgot {}: {} removed, {} orphaned", owner, evicted, orphaned);
        self.notify(CacheChange::Forget(owner), inner, evicted);
    }

    /// Remove every idle entry regardless of owner.
    pub fn forget_all(&self) {
        let mut inner = self.lock();
        let idle = inner.idle_where(|_| true);
        let mut evicted = 0;
        for idx in idle {
            if inner.remove(idx).is_some() {
                evicted += 1;
            }
        }
        debug!("Forgot all idle frames: {} removed, {} busy remain", evicted, inner.order.len());
        self.notify(CacheChange::ForgetAll, inner, evicted);
    }

    /// Frames resident for `owner`, ascending.
    pub fn frames_for(&self, owner: OwnerId) -> Vec<i64> {
        let inner = self.lock();
        let mut frames: Vec<i64> = inner
            .index
            .keys()
            .filter(|(o, _)| *o == owner)
            .map(|&(_, frame)| frame)
            .collect();
        frames.sort_unstable();
        frames
    }

    /// Resident without touching LRU order or stats.
    pub fn contains(&self, owner: OwnerId, frame: i64) -> bool {
        self.lock().index.contains_key(&(owner, frame))
    }

    pub fn set_budget(&self, bytes: usize) {
        let mut inner = self.lock();
        debug!("Cache budget: {} -> {} MB", inner.budget / 1024 / 1024, bytes / 1024 / 1024);
        inner.budget = bytes;
        let evicted = inner.purge();
        self.notify(CacheChange::Budget, inner, evicted);
    }

    pub fn budget(&self) -> usize {
        self.lock().budget
    }

    /// Total bytes resident, including orphaned entries.
    pub fn used(&self) -> usize {
        self.lock().used
    }

    /// Bytes resident for `owner`. Orphaned entries count for nobody.
    pub fn used_by(&self, owner: OwnerId) -> usize {
        let inner = self.lock();
        inner
            .index
            .iter()
            .filter(|((o, _), _)| *o == owner)
            .filter_map(|(_, &i)| inner.entry(i))
            .map(|e| e.size)
            .sum()
    }

    pub fn set_policy(&self, policy: CachePolicy) {
        let mut inner = self.lock();
        if inner.policy != policy {
            debug!("Cache policy: {:?} -> {:?}", inner.policy, policy);
        }
        inner.policy = policy;
        self.notify(CacheChange::Policy, inner, 0);
    }

    pub fn policy(&self) -> CachePolicy {
        self.lock().policy
    }

    /// Run an eviction pass. Always notifies.
    pub fn purge(&self) {
        let mut inner = self.lock();
        let evicted = inner.purge();
        self.notify(CacheChange::Purge, inner, evicted);
    }

    /// Frame number `LruPlayback` treats as "now playing".
    ///
    /// This is the frame of the most recently inserted or touched entry,
    /// not the position of any playback clock. Read-ahead inserts move it.
    pub fn playback_hint(&self) -> Option<i64> {
        self.lock().playback_hint()
    }

    /// Current reference count of the entry behind `handle`.
    pub fn refcount(&self, handle: FrameHandle) -> Option<u32> {
        self.lock().resolve_mut(handle).map(|e| e.refs)
    }

    /// Number of resident entries, orphans included.
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }
}

/// A held reference to a cached frame. Releases on drop.
pub struct FrameGuard<P: FramePayload = Frame> {
    cache: FrameCache<P>,
    handle: FrameHandle,
    frame: i64,
    payload: Arc<P>,
    released: bool,
}

impl<P: FramePayload> FrameGuard<P> {
    pub fn handle(&self) -> FrameHandle {
        self.handle
    }

    pub fn frame(&self) -> i64 {
        self.frame
    }

    pub fn payload(&self) -> &Arc<P> {
        &self.payload
    }

    /// Detach the reference from this guard. The caller must pass the
    /// handle to [`FrameCache::release`] exactly once.
    pub fn into_handle(mut self) -> FrameHandle {
        self.released = true;
        self.handle
    }
}

impl<P: FramePayload> Drop for FrameGuard<P> {
    fn drop(&mut self) {
        if !self.released {
            self.cache.release(self.handle);
        }
    }
}

impl<P: FramePayload> std::fmt::Debug for FrameGuard<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameGuard")
            .field("frame", &self.frame)
            .field("handle", &self.handle)
            .finish()
    }
}
