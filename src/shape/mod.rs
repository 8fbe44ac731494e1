//! Object shapes
//!
//! A [`PropertyMap`] describes where each named property of an object
//! lives. Field-layout maps back activation scopes: a contiguous block of
//! fields, padded to a size class, optionally preceded by parameter
//! properties that alias an arguments object. Spill-layout maps back
//! object literals: every property in one zero-based spill array, with
//! array-index keys kept out of the map entirely.
//!
//! Maps are interned through a [`ShapeCache`] so structurally identical
//! objects share one map.

mod cache;
mod literal;

pub use cache::{
    CachedStructureResolver, ShapeCache, ShapeCacheStats, ShapeKey, StructureClass, StructureResolver,
};
pub use literal::{IndexedValue, LiteralLayout, Postset, PostsetKey, Preset};

use bitflags::bitflags;
use serde::Serialize;
use std::fmt;

use crate::ast::{Expression, LiteralValue, Symbol, SymbolFlags, Type};

/// Field counts a field-layout object is padded to
pub const PADDING_CLASSES: [u32; 8] = [0, 4, 8, 16, 32, 64, 128, 256];

/// Smallest padding class holding `fields`; counts beyond the largest
/// class are used as they are
pub fn padded_field_count(fields: u32) -> u32 {
    PADDING_CLASSES
        .iter()
        .copied()
        .find(|&class| class >= fields)
        .unwrap_or(fields)
}

/// The array index a property key denotes, if it is the canonical decimal
/// form of an integer below `2^32 - 1`
pub fn array_index(key: &str) -> Option<u32> {
    let bytes = key.as_bytes();
    if bytes.is_empty() || bytes.len() > 10 || !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    if bytes.len() > 1 && bytes[0] == b'0' {
        return None;
    }
    let value: u64 = key.parse().ok()?;
    if value < u32::MAX as u64 {
        Some(value as u32)
    } else {
        None
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct PropertyFlags: u16 {
        const NOT_WRITABLE = 1 << 0;
        /// let/const binding
        const IS_LEXICAL = 1 << 1;
        /// Declared by a function declaration; later declarations may shadow it
        const IS_FUNCTION_DECLARATION = 1 << 2;
        /// Backed by a parameter of a function with an arguments object
        const IS_PARAMETER = 1 << 3;
        /// Owner exposes an arguments view of its parameters
        const HAS_ARGUMENTS = 1 << 4;
        /// Value is never a primitive
        const ALWAYS_OBJECT = 1 << 5;
        const CAN_BE_PRIMITIVE = 1 << 6;
        const CAN_BE_UNDEFINED = 1 << 7;
    }
}

impl PropertyFlags {
    /// Flags implied by a value type
    pub fn for_type(ty: Type) -> PropertyFlags {
        match ty {
            Type::Unknown => PropertyFlags::CAN_BE_UNDEFINED,
            Type::Object => PropertyFlags::ALWAYS_OBJECT,
            _ => PropertyFlags::CAN_BE_PRIMITIVE,
        }
    }

    /// Flags of a property initialized from `value`. Strings, null and
    /// undefined are primitives even though they travel as `Type::Object`.
    pub fn for_value(value: &Expression) -> PropertyFlags {
        match value.as_literal() {
            Some(LiteralValue::Undefined) => {
                PropertyFlags::CAN_BE_UNDEFINED | PropertyFlags::CAN_BE_PRIMITIVE
            }
            Some(LiteralValue::String(_) | LiteralValue::Null) => PropertyFlags::CAN_BE_PRIMITIVE,
            _ => PropertyFlags::for_type(value.ty()),
        }
    }

    /// Flags of a scope property backed by `symbol`
    pub fn for_symbol(symbol: &Symbol, has_arguments: bool) -> PropertyFlags {
        let mut flags = PropertyFlags::for_type(symbol.ty());
        if symbol.can_be_undefined() {
            flags |= PropertyFlags::CAN_BE_UNDEFINED;
        }
        if symbol.is_function_declaration() {
            flags |= PropertyFlags::IS_FUNCTION_DECLARATION;
        }
        let symbol_flags = symbol.flags();
        if symbol_flags.contains(SymbolFlags::IS_LET) {
            flags |= PropertyFlags::IS_LEXICAL;
        }
        if symbol_flags.contains(SymbolFlags::IS_CONST) {
            flags |= PropertyFlags::IS_LEXICAL | PropertyFlags::NOT_WRITABLE;
        }
        if has_arguments && symbol.is_param() {
            flags |= PropertyFlags::IS_PARAMETER | PropertyFlags::HAS_ARGUMENTS;
        }
        flags
    }
}

/// Where a property's value is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PropertyLocation {
    /// Index into the object's fixed fields
    Field(u32),
    /// Index into the arguments object
    Parameter(u32),
    /// Index into the spill array
    Spill(u32),
}

/// One named property of a shape
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Property {
    pub key: String,
    pub flags: PropertyFlags,
    pub location: PropertyLocation,
}

/// Storage strategy of a shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Layout {
    Field,
    Spill,
}

/// Ordered layout description shared by all objects of one shape
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PropertyMap {
    layout: Layout,
    properties: Vec<Property>,
    field_count: u32,
    field_maximum: u32,
    spill_length: u32,
}

/// A property request before layout: key plus flags
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapEntry {
    pub key: String,
    pub flags: PropertyFlags,
}

impl MapEntry {
    pub fn new(key: impl Into<String>, flags: PropertyFlags) -> Self {
        Self {
            key: key.into(),
            flags,
        }
    }

    fn is_parameter(&self) -> bool {
        self.flags.contains(PropertyFlags::IS_PARAMETER)
    }
}

impl PropertyMap {
    /// Field layout. Parameter entries are numbered in their own index
    /// space and do not consume fields.
    pub fn field_layout(entries: &[MapEntry]) -> PropertyMap {
        let mut properties = Vec::with_capacity(entries.len());
        let mut fields = 0;
        let mut params = 0;
        for entry in entries {
            let location = if entry.is_parameter() {
                params += 1;
                PropertyLocation::Parameter(params - 1)
            } else {
                fields += 1;
                PropertyLocation::Field(fields - 1)
            };
            properties.push(Property {
                key: entry.key.clone(),
                flags: entry.flags,
                location,
            });
        }
        PropertyMap {
            layout: Layout::Field,
            properties,
            field_count: padded_field_count(fields),
            field_maximum: fields,
            spill_length: 0,
        }
    }

    /// Spill layout. Array-index keys must already be filtered out.
    pub fn spill_layout(entries: &[MapEntry]) -> PropertyMap {
        let properties: Vec<Property> = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| Property {
                key: entry.key.clone(),
                flags: entry.flags,
                location: PropertyLocation::Spill(i as u32),
            })
            .collect();
        PropertyMap {
            layout: Layout::Spill,
            spill_length: properties.len() as u32,
            properties,
            field_count: 0,
            field_maximum: 0,
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter()
    }

    /// Allocated field count, rounded up to a padding class
    pub fn field_count(&self) -> u32 {
        self.field_count
    }

    /// Fields actually used
    pub fn field_maximum(&self) -> u32 {
        self.field_maximum
    }

    pub fn spill_length(&self) -> u32 {
        self.spill_length
    }

    /// Whether some properties live in an arguments object
    pub fn has_parameters(&self) -> bool {
        self.properties
            .iter()
            .any(|p| matches!(p.location, PropertyLocation::Parameter(_)))
    }

    pub fn parameter_count(&self) -> u32 {
        self.properties
            .iter()
            .filter(|p| matches!(p.location, PropertyLocation::Parameter(_)))
            .count() as u32
    }
}

impl fmt::Display for PropertyMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, property) in self.properties.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match property.location {
                PropertyLocation::Field(n) => write!(f, "{}@f{}", property.key, n)?,
                PropertyLocation::Parameter(n) => write!(f, "{}@p{}", property.key, n)?,
                PropertyLocation::Spill(n) => write!(f, "{}@s{}", property.key, n)?,
            }
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_classes() {
        assert_eq!(padded_field_count(0), 0);
        assert_eq!(padded_field_count(1), 4);
        assert_eq!(padded_field_count(4), 4);
        assert_eq!(padded_field_count(5), 8);
        assert_eq!(padded_field_count(200), 256);
        assert_eq!(padded_field_count(300), 300);
    }

    #[test]
    fn test_array_index_keys() {
        assert_eq!(array_index("0"), Some(0));
        assert_eq!(array_index("2"), Some(2));
        assert_eq!(array_index("4294967294"), Some(4_294_967_294));
        assert_eq!(array_index("4294967295"), None);
        assert_eq!(array_index("01"), None);
        assert_eq!(array_index("-1"), None);
        assert_eq!(array_index("1.5"), None);
        assert_eq!(array_index("x"), None);
        assert_eq!(array_index(""), None);
    }

    #[test]
    fn test_field_layout_with_parameters() {
        let entries = vec![
            MapEntry::new("a", PropertyFlags::IS_PARAMETER | PropertyFlags::HAS_ARGUMENTS),
            MapEntry::new("x", PropertyFlags::ALWAYS_OBJECT),
            MapEntry::new("b", PropertyFlags::IS_PARAMETER | PropertyFlags::HAS_ARGUMENTS),
            MapEntry::new("y", PropertyFlags::CAN_BE_PRIMITIVE),
        ];
        let map = PropertyMap::field_layout(&entries);
        assert_eq!(map.get("a").unwrap().location, PropertyLocation::Parameter(0));
        assert_eq!(map.get("b").unwrap().location, PropertyLocation::Parameter(1));
        assert_eq!(map.get("x").unwrap().location, PropertyLocation::Field(0));
        assert_eq!(map.get("y").unwrap().location, PropertyLocation::Field(1));
        assert_eq!(map.field_maximum(), 2);
        assert_eq!(map.field_count(), 4);
        assert!(map.has_parameters());
        assert_eq!(map.parameter_count(), 2);
    }

    #[test]
    fn test_symbol_flags() {
        use crate::ast::SymbolKind;
        let param = Symbol::new("a", SymbolKind::Parameter, Type::Int);
        let flags = PropertyFlags::for_symbol(&param, true);
        assert!(flags.contains(PropertyFlags::IS_PARAMETER | PropertyFlags::CAN_BE_PRIMITIVE));
        let decl = Symbol::new("f", SymbolKind::Variable, Type::Object)
            .with_flags(SymbolFlags::IS_FUNCTION_DECLARATION | SymbolFlags::IS_CONST);
        let flags = PropertyFlags::for_symbol(&decl, false);
        assert!(flags.contains(PropertyFlags::IS_FUNCTION_DECLARATION));
        assert!(flags.contains(PropertyFlags::NOT_WRITABLE));
        assert!(flags.contains(PropertyFlags::ALWAYS_OBJECT));
    }
}
