//! Byte-bounded LRU cache of section content.
//!
//! Access order is tracked in a `BTreeMap` keyed by a monotonically
//! increasing tick, so the least recently used entry is always the first
//! key. Eviction prefers entries of courses other than the active one and
//! never touches pinned sections.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use coursetrack_core::{CourseId, SectionId, Time};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

/// Cache sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum bytes of content held
    pub budget_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 64 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Set the byte budget.
    pub fn with_budget_bytes(mut self, budget_bytes: u64) -> Self {
        self.budget_bytes = budget_bytes;
        self
    }
}

/// Content of one section as delivered by the content collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionContent {
    /// Owning course
    pub course_id: CourseId,

    /// Section
    pub section_id: SectionId,

    /// Opaque payload
    pub body: Vec<u8>,

    /// When it was fetched
    pub fetched_at: Time,
}

impl SectionContent {
    /// Wrap a freshly fetched payload.
    pub fn new(course_id: CourseId, section_id: SectionId, body: Vec<u8>) -> Self {
        Self {
            course_id,
            section_id,
            body,
            fetched_at: chrono::Utc::now(),
        }
    }

    /// Size charged against the budget.
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Cached sections
    pub entries: usize,
    /// Bytes held
    pub bytes_used: u64,
    /// Configured budget
    pub budget_bytes: u64,
    /// Pinned sections
    pub pinned: usize,
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
    /// Entries evicted for space
    pub evictions: u64,
}

struct Entry {
    content: Arc<SectionContent>,
    tick: u64,
}

/// LRU content cache with pins and an active course.
pub struct ContentCache {
    entries: HashMap<SectionId, Entry>,
    // tick -> section, oldest first
    lru: BTreeMap<u64, SectionId>,
    pins: HashSet<SectionId>,
    active_course: Option<CourseId>,
    bytes_used: u64,
    budget: u64,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl ContentCache {
    /// Create an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            pins: HashSet::new(),
            active_course: None,
            bytes_used: 0,
            budget: config.budget_bytes,
            next_tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Make `course` the active course and replace the pin set.
    ///
    /// Pinned sections are never evicted; pins may name sections that are
    /// not cached yet.
    pub fn set_active(&mut self, course: CourseId, pins: impl IntoIterator<Item = SectionId>) {
        self.pins = pins.into_iter().collect();
        debug!(course = %course, pinned = self.pins.len(), "Active course set");
        self.active_course = Some(course);
    }

    /// Currently active course.
    pub fn active_course(&self) -> Option<&CourseId> {
        self.active_course.as_ref()
    }

    /// Whether a section is pinned.
    pub fn is_pinned(&self, section: &SectionId) -> bool {
        self.pins.contains(section)
    }

    /// Look up a section, marking it most recently used.
    pub fn get(&mut self, section: &SectionId) -> Option<Arc<SectionContent>> {
        let tick = self.tick();
        match self.entries.get_mut(section) {
            Some(entry) => {
                self.lru.remove(&entry.tick);
                entry.tick = tick;
                self.lru.insert(tick, section.clone());
                self.hits += 1;
                Some(entry.content.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Whether a section is cached. Does not count as an access.
    pub fn contains(&self, section: &SectionId) -> bool {
        self.entries.contains_key(section)
    }

    /// Insert content, evicting as needed. Returns the evicted sections.
    pub fn put(&mut self, content: SectionContent) -> Result<Vec<SectionId>> {
        let size = content.size();
        if size > self.budget {
            return Err(CacheError::TooLarge {
                section: content.section_id,
                size,
                budget: self.budget,
            });
        }

        // Check before touching anything so a refused put leaves the cache
        // as it was. Replacing an entry frees its bytes.
        let replaced = self
            .entries
            .get(&content.section_id)
            .map_or(0, |e| e.content.size());
        let evictable: u64 = self
            .entries
            .iter()
            .filter(|(id, _)| **id != content.section_id && !self.pins.contains(*id))
            .map(|(_, e)| e.content.size())
            .sum();
        if self.bytes_used - replaced - evictable + size > self.budget {
            warn!(
                needed = size,
                used = self.bytes_used,
                budget = self.budget,
                "Cache full of pinned content"
            );
            return Err(CacheError::BudgetExhausted { needed: size });
        }

        self.remove(&content.section_id);
        let evicted = self.make_room(size)?;
        let tick = self.tick();
        let section = content.section_id.clone();
        self.bytes_used += size;
        self.lru.insert(tick, section.clone());
        self.entries.insert(
            section,
            Entry {
                content: Arc::new(content),
                tick,
            },
        );
        Ok(evicted)
    }

    /// Drop a section. Returns whether it was cached.
    pub fn remove(&mut self, section: &SectionId) -> bool {
        match self.entries.remove(section) {
            Some(entry) => {
                self.lru.remove(&entry.tick);
                self.bytes_used -= entry.content.size();
                true
            }
            None => false,
        }
    }

    /// Next eviction victim: least recently used unpinned entry, preferring
    /// courses other than the active one.
    fn victim(&self) -> Option<SectionId> {
        let mut fallback = None;
        for section in self.lru.values() {
            if self.pins.contains(section) {
                continue;
            }
            let active = self
                .entries
                .get(section)
                .map(|e| Some(&e.content.course_id) == self.active_course.as_ref())
                .unwrap_or(false);
            if !active {
                return Some(section.clone());
            }
            fallback.get_or_insert(section);
        }
        fallback.cloned()
    }

    fn make_room(&mut self, size: u64) -> Result<Vec<SectionId>> {
        let mut evicted = Vec::new();
        while self.bytes_used + size > self.budget {
            let Some(section) = self.victim() else {
                warn!(
                    needed = size,
                    used = self.bytes_used,
                    budget = self.budget,
                    "Cache full of pinned content"
                );
                return Err(CacheError::BudgetExhausted { needed: size });
            };
            self.remove(&section);
            self.evictions += 1;
            debug!(section = %section, "Evicted cached content");
            evicted.push(section);
        }
        Ok(evicted)
    }

    /// Drop everything, keeping statistics and pins.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.lru.clear();
        self.bytes_used = 0;
    }

    /// Bytes currently held.
    pub fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    /// Number of cached sections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            bytes_used: self.bytes_used,
            budget_bytes: self.budget,
            pinned: self.pins.len(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(course: &str, section: &str, size: usize) -> SectionContent {
        SectionContent::new(CourseId::new(course), SectionId::new(section), vec![0; size])
    }

    fn cache(budget: u64) -> ContentCache {
        ContentCache::new(CacheConfig::default().with_budget_bytes(budget))
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = cache(30);
        cache.put(content("c", "a", 10)).unwrap();
        cache.put(content("c", "b", 10)).unwrap();
        cache.put(content("c", "c", 10)).unwrap();
        cache.get(&SectionId::new("a"));

        let evicted = cache.put(content("c", "d", 10)).unwrap();
        assert_eq!(evicted, vec![SectionId::new("b")]);
        assert!(cache.contains(&SectionId::new("a")));
        assert_eq!(cache.bytes_used(), 30);
    }

    #[test]
    fn prefers_evicting_inactive_courses() {
        let mut cache = cache(30);
        cache.put(content("active", "a1", 10)).unwrap();
        cache.put(content("other", "o1", 10)).unwrap();
        cache.put(content("active", "a2", 10)).unwrap();
        cache.set_active(CourseId::new("active"), []);

        let evicted = cache.put(content("active", "a3", 10)).unwrap();
        assert_eq!(evicted, vec![SectionId::new("o1")]);
    }

    #[test]
    fn pinned_sections_survive() {
        let mut cache = cache(20);
        cache.put(content("c", "a", 10)).unwrap();
        cache.put(content("c", "b", 10)).unwrap();
        cache.set_active(CourseId::new("c"), [SectionId::new("a")]);

        let evicted = cache.put(content("c", "x", 10)).unwrap();
        assert_eq!(evicted, vec![SectionId::new("b")]);

        cache.set_active(
            CourseId::new("c"),
            [SectionId::new("a"), SectionId::new("x")],
        );
        assert_eq!(
            cache.put(content("c", "y", 10)),
            Err(CacheError::BudgetExhausted { needed: 10 })
        );
        assert!(cache.contains(&SectionId::new("a")));
        assert!(cache.contains(&SectionId::new("x")));
    }

    #[test]
    fn refused_put_leaves_entries_untouched() {
        let mut cache = cache(100);
        cache.put(content("c", "a", 60)).unwrap();
        cache.put(content("c", "b", 30)).unwrap();
        cache.set_active(CourseId::new("c"), [SectionId::new("a")]);

        assert_eq!(
            cache.put(content("c", "c", 60)),
            Err(CacheError::BudgetExhausted { needed: 60 })
        );
        assert!(cache.contains(&SectionId::new("a")));
        assert!(cache.contains(&SectionId::new("b")));
        assert_eq!(cache.bytes_used(), 90);
        assert_eq!(cache.stats().evictions, 0);

        // Growing a pinned entry past what can be freed keeps the old copy.
        cache.set_active(
            CourseId::new("c"),
            [SectionId::new("a"), SectionId::new("b")],
        );
        assert!(cache.put(content("c", "a", 80)).is_err());
        assert_eq!(cache.get(&SectionId::new("a")).unwrap().body.len(), 60);
        assert_eq!(cache.bytes_used(), 90);
    }

    #[test]
    fn oversized_content_is_refused() {
        let mut cache = cache(5);
        assert!(matches!(
            cache.put(content("c", "big", 6)),
            Err(CacheError::TooLarge { size: 6, budget: 5, .. })
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn replacing_an_entry_does_not_double_count() {
        let mut cache = cache(100);
        cache.put(content("c", "a", 10)).unwrap();
        cache.put(content("c", "a", 25)).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.bytes_used(), 25);
    }

    #[test]
    fn stats_count_hits_misses_and_evictions() {
        let mut cache = cache(10);
        cache.put(content("c", "a", 10)).unwrap();
        cache.get(&SectionId::new("a"));
        cache.get(&SectionId::new("zz"));
        cache.put(content("c", "b", 10)).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes_used, 10);
    }
}
