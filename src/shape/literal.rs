//! Spill layout of object literals

use std::sync::Arc;

use super::{array_index, MapEntry, PropertyFlags, PropertyLocation, PropertyMap, ShapeCache};
use crate::ast::{LiteralValue, ObjectNode};

/// A literal property value written into the spill array at construction
#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub spill: u32,
    pub value: LiteralValue,
}

/// A literal element of the indexed store
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedValue {
    pub index: u32,
    pub value: LiteralValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostsetKey {
    Named(String),
    Index(u32),
}

/// A value computed at run time and written after construction
#[derive(Debug, Clone, PartialEq)]
pub struct Postset {
    pub key: PostsetKey,
    /// Position of the value in the literal's property list
    pub property: usize,
}

/// How one object literal is constructed
#[derive(Debug, Clone)]
pub struct LiteralLayout {
    pub map: Arc<PropertyMap>,
    pub presets: Vec<Preset>,
    pub indexed: Vec<IndexedValue>,
    /// In declaration order
    pub postsets: Vec<Postset>,
}

#[derive(Debug)]
struct KeyGroup<K> {
    key: K,
    occurrences: Vec<usize>,
}

/// Split the occurrences of one key into the literal written at
/// construction and the values written afterwards. Once a computed value
/// appears, every later occurrence must be written after it.
fn partition(node: &ObjectNode, occurrences: &[usize]) -> (Option<LiteralValue>, Vec<usize>) {
    let first_computed = occurrences
        .iter()
        .position(|&i| node.properties[i].value.as_literal().is_none())
        .unwrap_or(occurrences.len());
    let preset = occurrences[..first_computed]
        .last()
        .and_then(|&i| node.properties[i].value.as_literal().cloned());
    (preset, occurrences[first_computed..].to_vec())
}

fn group<K: PartialEq>(groups: &mut Vec<KeyGroup<K>>, key: K, position: usize) {
    match groups.iter_mut().find(|g| g.key == key) {
        Some(group) => group.occurrences.push(position),
        None => groups.push(KeyGroup {
            key,
            occurrences: vec![position],
        }),
    }
}

impl LiteralLayout {
    /// Lay out `node`. Duplicate keys keep the position of their first
    /// occurrence and the value of their last.
    pub fn synthesize(node: &ObjectNode, cache: &ShapeCache) -> LiteralLayout {
        let mut named: Vec<KeyGroup<String>> = Vec::new();
        let mut indexed: Vec<KeyGroup<u32>> = Vec::new();
        for (position, property) in node.properties.iter().enumerate() {
            match array_index(&property.key) {
                Some(index) => group(&mut indexed, index, position),
                None => group(&mut named, property.key.clone(), position),
            }
        }

        let mut entries = Vec::with_capacity(named.len());
        let mut presets = Vec::new();
        let mut postsets = Vec::new();
        for (spill, group) in named.iter().enumerate() {
            let last = group.occurrences.last().copied().unwrap_or_default();
            let flags = PropertyFlags::for_value(&node.properties[last].value);
            entries.push(MapEntry::new(group.key.clone(), flags));
            let (preset, computed) = partition(node, &group.occurrences);
            if let Some(value) = preset {
                presets.push(Preset {
                    spill: spill as u32,
                    value,
                });
            }
            postsets.extend(computed.into_iter().map(|property| Postset {
                key: PostsetKey::Named(group.key.clone()),
                property,
            }));
        }

        let mut indexed_values = Vec::new();
        for group in &indexed {
            let (preset, computed) = partition(node, &group.occurrences);
            if let Some(value) = preset {
                indexed_values.push(IndexedValue {
                    index: group.key,
                    value,
                });
            }
            postsets.extend(computed.into_iter().map(|property| Postset {
                key: PostsetKey::Index(group.key),
                property,
            }));
        }
        postsets.sort_by_key(|p| p.property);

        LiteralLayout {
            map: cache.spill_map(entries),
            presets,
            indexed: indexed_values,
            postsets,
        }
    }

    /// Literal value written at construction for `key`
    pub fn preset(&self, key: &str) -> Option<&LiteralValue> {
        let spill = match self.map.get(key)?.location {
            PropertyLocation::Spill(n) => n,
            _ => return None,
        };
        self.presets.iter().find(|p| p.spill == spill).map(|p| &p.value)
    }

    pub fn is_postset(&self, key: &str) -> bool {
        self.postsets
            .iter()
            .any(|p| matches!(&p.key, PostsetKey::Named(k) if k == key))
    }

    /// Literal element of the indexed store
    pub fn indexed_value(&self, index: u32) -> Option<&LiteralValue> {
        self.indexed.iter().find(|v| v.index == index).map(|v| &v.value)
    }

    /// Whether the object needs an indexed store at all
    pub fn has_indexed_store(&self) -> bool {
        !self.indexed.is_empty()
            || self
                .postsets
                .iter()
                .any(|p| matches!(p.key, PostsetKey::Index(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::ast::{Expression, Type};

    fn literal(properties: Vec<(&str, Expression)>) -> ObjectNode {
        match object(properties) {
            Expression::Object(node) => node,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_presets_postsets_and_indexed_keys() {
        let node = literal(vec![
            ("x", int(1)),
            ("2", string("a")),
            ("y", call(global("f"), vec![], Type::Object)),
        ]);
        let layout = LiteralLayout::synthesize(&node, &ShapeCache::new());
        assert_eq!(layout.map.len(), 2);
        assert!(!layout.map.contains("2"));
        assert_eq!(layout.preset("x"), Some(&LiteralValue::Int(1)));
        assert!(layout.is_postset("y"));
        assert_eq!(layout.preset("y"), None);
        assert_eq!(
            layout.indexed_value(2),
            Some(&LiteralValue::String("a".to_string()))
        );
        assert_eq!(layout.map.get("y").unwrap().location, PropertyLocation::Spill(1));
    }

    #[test]
    fn test_primitive_literals_are_not_always_object() {
        let node = literal(vec![
            ("s", string("a")),
            ("u", undefined()),
            ("o", call(global("f"), vec![], Type::Object)),
        ]);
        let layout = LiteralLayout::synthesize(&node, &ShapeCache::new());
        let flags = |key| layout.map.get(key).unwrap().flags;
        assert_eq!(flags("s"), PropertyFlags::CAN_BE_PRIMITIVE);
        assert!(flags("u").contains(PropertyFlags::CAN_BE_UNDEFINED));
        assert!(!flags("u").contains(PropertyFlags::ALWAYS_OBJECT));
        assert_eq!(flags("o"), PropertyFlags::ALWAYS_OBJECT);
    }

    #[test]
    fn test_duplicate_keys_keep_first_position_last_value() {
        let node = literal(vec![("a", int(1)), ("b", int(2)), ("a", int(3))]);
        let layout = LiteralLayout::synthesize(&node, &ShapeCache::new());
        assert_eq!(layout.map.get("a").unwrap().location, PropertyLocation::Spill(0));
        assert_eq!(layout.preset("a"), Some(&LiteralValue::Int(3)));
        assert!(layout.postsets.is_empty());
    }

    #[test]
    fn test_literal_after_computed_value_is_written_late() {
        let node = literal(vec![
            ("a", call(global("f"), vec![], Type::Object)),
            ("a", int(3)),
        ]);
        let layout = LiteralLayout::synthesize(&node, &ShapeCache::new());
        assert_eq!(layout.preset("a"), None);
        assert_eq!(layout.postsets.len(), 2);
        assert_eq!(layout.postsets[1].property, 1);
    }

    #[test]
    fn test_identical_literals_share_maps() {
        let cache = ShapeCache::new();
        let a = LiteralLayout::synthesize(&literal(vec![("x", int(1)), ("y", int(2))]), &cache);
        let b = LiteralLayout::synthesize(&literal(vec![("x", int(5)), ("y", int(6))]), &cache);
        assert!(Arc::ptr_eq(&a.map, &b.map));
    }
}
