//! Cache replacement strategies.
//!
//! An [`EvictionPolicy`] only tracks keys; the [`ModuleCache`](crate::ModuleCache)
//! owns the entries and calls into the policy while holding its lock:
//!
//! - `admit` when a new key is inserted
//! - `touch` on every hit or replacement
//! - `evict` when the cache is full and a victim is needed
//! - `remove` when an entry leaves the cache for any other reason

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use wasm_driver_common::EvictionKind;

/// Key identifying a cached module.
pub type ModuleKey = PathBuf;

/// A pluggable cache replacement strategy.
pub trait EvictionPolicy: Send {
    /// The configured kind of this policy.
    fn kind(&self) -> EvictionKind;

    /// Start tracking a newly inserted key.
    fn admit(&mut self, key: &ModuleKey);

    /// Record an access to a tracked key.
    fn touch(&mut self, key: &ModuleKey);

    /// Choose and stop tracking a victim, if any key is tracked.
    fn evict(&mut self) -> Option<ModuleKey>;

    /// Stop tracking a key.
    fn remove(&mut self, key: &ModuleKey);
}

/// Create the policy for `kind` sized for `capacity` entries.
pub fn new_policy(kind: EvictionKind, capacity: usize) -> Box<dyn EvictionPolicy> {
    match kind {
        EvictionKind::Lfu => Box::new(LfuPolicy::default()),
        EvictionKind::Lru => Box::new(LruPolicy::default()),
        EvictionKind::Arc => Box::new(ArcPolicy::new(capacity)),
        EvictionKind::Simple => Box::new(SimplePolicy::default()),
    }
}

/// Least frequently used.
///
/// Evicts the key with the fewest accesses; ties go to the oldest insertion.
#[derive(Debug, Default)]
pub struct LfuPolicy {
    /// key -> (access count, insertion sequence)
    entries: HashMap<ModuleKey, (u64, u64)>,
    next_seq: u64,
}

impl EvictionPolicy for LfuPolicy {
    fn kind(&self) -> EvictionKind {
        EvictionKind::Lfu
    }

    fn admit(&mut self, key: &ModuleKey) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key.clone(), (0, seq));
    }

    fn touch(&mut self, key: &ModuleKey) {
        if let Some((count, _)) = self.entries.get_mut(key) {
            *count += 1;
        }
    }

    fn evict(&mut self) -> Option<ModuleKey> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, (count, seq))| (*count, *seq))
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&victim);
        Some(victim)
    }

    fn remove(&mut self, key: &ModuleKey) {
        self.entries.remove(key);
    }
}

/// Least recently used.
#[derive(Debug, Default)]
pub struct LruPolicy {
    /// Front is least recently used.
    order: VecDeque<ModuleKey>,
}

impl EvictionPolicy for LruPolicy {
    fn kind(&self) -> EvictionKind {
        EvictionKind::Lru
    }

    fn admit(&mut self, key: &ModuleKey) {
        self.touch(key);
    }

    fn touch(&mut self, key: &ModuleKey) {
        self.order.retain(|entry| entry != key);
        self.order.push_back(key.clone());
    }

    fn evict(&mut self) -> Option<ModuleKey> {
        self.order.pop_front()
    }

    fn remove(&mut self, key: &ModuleKey) {
        self.order.retain(|entry| entry != key);
    }
}

/// Adaptive replacement.
///
/// Resident keys live in `t1` (seen once) or `t2` (seen again). Evicted keys
/// are remembered in the ghost lists `b1`/`b2`; re-admitting a ghost shifts
/// the target size `p` of `t1` toward recency or frequency.
#[derive(Debug)]
pub struct ArcPolicy {
    capacity: usize,
    p: usize,
    t1: VecDeque<ModuleKey>,
    t2: VecDeque<ModuleKey>,
    b1: VecDeque<ModuleKey>,
    b2: VecDeque<ModuleKey>,
}

impl ArcPolicy {
    /// Create an ARC policy for `capacity` resident entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
        }
    }

    /// Current target size of the recency list.
    pub fn target(&self) -> usize {
        self.p
    }

    fn take(list: &mut VecDeque<ModuleKey>, key: &ModuleKey) -> bool {
        match list.iter().position(|entry| entry == key) {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        }
    }

    fn trim_ghosts(&mut self) {
        while self.b1.len() > self.capacity {
            self.b1.pop_front();
        }
        while self.b2.len() > self.capacity {
            self.b2.pop_front();
        }
    }
}

impl EvictionPolicy for ArcPolicy {
    fn kind(&self) -> EvictionKind {
        EvictionKind::Arc
    }

    fn admit(&mut self, key: &ModuleKey) {
        if Self::take(&mut self.b1, key) {
            let delta = (self.b2.len() / self.b1.len().max(1)).max(1);
            self.p = (self.p + delta).min(self.capacity);
            self.t2.push_back(key.clone());
        } else if Self::take(&mut self.b2, key) {
            let delta = (self.b1.len() / self.b2.len().max(1)).max(1);
            self.p = self.p.saturating_sub(delta);
            self.t2.push_back(key.clone());
        } else {
            self.t1.push_back(key.clone());
        }
    }

    fn touch(&mut self, key: &ModuleKey) {
        if Self::take(&mut self.t1, key) || Self::take(&mut self.t2, key) {
            self.t2.push_back(key.clone());
        }
    }

    fn evict(&mut self) -> Option<ModuleKey> {
        let from_t1 = !self.t1.is_empty() && (self.t1.len() > self.p || self.t2.is_empty());

        let victim = if from_t1 {
            let key = self.t1.pop_front()?;
            self.b1.push_back(key.clone());
            key
        } else {
            let key = self.t2.pop_front()?;
            self.b2.push_back(key.clone());
            key
        };

        self.trim_ghosts();
        Some(victim)
    }

    fn remove(&mut self, key: &ModuleKey) {
        if !Self::take(&mut self.t1, key) {
            Self::take(&mut self.t2, key);
        }
    }
}

/// No ordering: any tracked key may be evicted.
#[derive(Debug, Default)]
pub struct SimplePolicy {
    keys: HashSet<ModuleKey>,
}

impl EvictionPolicy for SimplePolicy {
    fn kind(&self) -> EvictionKind {
        EvictionKind::Simple
    }

    fn admit(&mut self, key: &ModuleKey) {
        self.keys.insert(key.clone());
    }

    fn touch(&mut self, _key: &ModuleKey) {}

    fn evict(&mut self) -> Option<ModuleKey> {
        let victim = self.keys.iter().next().cloned()?;
        self.keys.remove(&victim);
        Some(victim)
    }

    fn remove(&mut self, key: &ModuleKey) {
        self.keys.remove(key);
    }
}
