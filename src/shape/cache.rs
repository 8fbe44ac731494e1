//! Shape and structure-class interning
//!
//! Concurrent compilations that synthesize structurally identical shapes
//! converge on one shared [`PropertyMap`]. Insertion is atomic per key:
//! racing inserts of an equal key keep whichever map landed first.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{Layout, MapEntry, PropertyMap};

/// Structural identity of a shape
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeKey {
    pub layout: Layout,
    pub entries: Vec<MapEntry>,
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShapeCacheStats {
    /// Number of interned maps
    pub entry_count: usize,
    pub hits: usize,
    pub misses: usize,
}

/// Interning cache for property maps
#[derive(Debug, Default)]
pub struct ShapeCache {
    maps: RwLock<FxHashMap<ShapeKey, Arc<PropertyMap>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl ShapeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared field-layout map for `entries`
    pub fn field_map(&self, entries: Vec<MapEntry>) -> Arc<PropertyMap> {
        self.intern(
            ShapeKey {
                layout: Layout::Field,
                entries,
            },
            PropertyMap::field_layout,
        )
    }

    /// Shared spill-layout map for `entries`
    pub fn spill_map(&self, entries: Vec<MapEntry>) -> Arc<PropertyMap> {
        self.intern(
            ShapeKey {
                layout: Layout::Spill,
                entries,
            },
            PropertyMap::spill_layout,
        )
    }

    fn intern(&self, key: ShapeKey, build: fn(&[MapEntry]) -> PropertyMap) -> Arc<PropertyMap> {
        if let Some(map) = self.maps.read().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(properties = key.entries.len(), "shape cache hit");
            return Arc::clone(map);
        }
        let mut maps = self.maps.write();
        let map = maps.entry(key).or_insert_with_key(|key| {
            self.misses.fetch_add(1, Ordering::Relaxed);
            Arc::new(build(&key.entries))
        });
        Arc::clone(map)
    }

    pub fn len(&self) -> usize {
        self.maps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.read().is_empty()
    }

    pub fn stats(&self) -> ShapeCacheStats {
        ShapeCacheStats {
            entry_count: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Backing storage class of field-layout objects with a given number of
/// fields and parameter properties
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructureClass {
    pub name: String,
    pub field_count: u32,
    pub parameter_count: u32,
}

impl StructureClass {
    /// Canonical name shared by every map with the same counts
    pub fn canonical_name(field_count: u32, parameter_count: u32) -> String {
        format!("struct.f{}.p{}", field_count, parameter_count)
    }
}

/// Resolves a canonical structure name to its storage class, realizing it
/// on first use
pub trait StructureResolver: Send + Sync {
    fn resolve(&self, field_count: u32, parameter_count: u32) -> Arc<StructureClass>;
}

/// Resolver that realizes each class once and hands out the shared handle
#[derive(Debug, Default)]
pub struct CachedStructureResolver {
    classes: RwLock<FxHashMap<String, Arc<StructureClass>>>,
}

impl CachedStructureResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.read().is_empty()
    }
}

impl StructureResolver for CachedStructureResolver {
    fn resolve(&self, field_count: u32, parameter_count: u32) -> Arc<StructureClass> {
        let name = StructureClass::canonical_name(field_count, parameter_count);
        if let Some(class) = self.classes.read().get(&name) {
            return Arc::clone(class);
        }
        let mut classes = self.classes.write();
        let class = classes.entry(name).or_insert_with_key(|name| {
            tracing::debug!(structure = %name, "realizing structure class");
            Arc::new(StructureClass {
                name: name.clone(),
                field_count,
                parameter_count,
            })
        });
        Arc::clone(class)
    }
}
