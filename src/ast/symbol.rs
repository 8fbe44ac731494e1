//! Symbols and per-function symbol tables

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Type;
use crate::error::{Error, Result};

/// Index of a symbol in its function's [`SymbolTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolId(pub u32);

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sym#{}", self.0)
    }
}

/// What a symbol names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolKind {
    /// Compiler temporary
    Temporary,
    /// Formal parameter
    Parameter,
    /// Declared variable (var, let, const, function declaration)
    Variable,
    /// Compiler-reserved storage (callee, this, scope, ...)
    Internal,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SymbolFlags: u16 {
        /// Lives in a scope object instead of (or besides) a slot
        const IS_SCOPE = 1 << 0;
        /// Wants a local slot; the frame that owns it assigns the number
        const NEEDS_SLOT = 1 << 1;
        /// Declared by a function declaration
        const IS_FUNCTION_DECLARATION = 1 << 2;
        /// May hold undefined on some path
        const CAN_BE_UNDEFINED = 1 << 3;
        /// const binding
        const IS_CONST = 1 << 4;
        /// let/const binding
        const IS_LET = 1 << 5;
    }
}

/// Storage classification derived from a symbol's flags and slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Unassigned,
    LocalSlot(u16),
    ScopeProperty(Option<u32>),
}

/// A named storage location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    name: String,
    kind: SymbolKind,
    ty: Type,
    flags: SymbolFlags,
    slot: Option<u16>,
    field_index: Option<u32>,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, ty: Type) -> Self {
        Self {
            name: name.into(),
            kind,
            ty,
            flags: SymbolFlags::NEEDS_SLOT,
            slot: None,
            field_index: None,
        }
    }

    pub fn with_flags(mut self, flags: SymbolFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SymbolKind {
        self.kind
    }

    pub fn ty(&self) -> Type {
        self.ty
    }

    pub fn set_type(&mut self, ty: Type) {
        self.ty = ty;
    }

    pub fn flags(&self) -> SymbolFlags {
        self.flags
    }

    pub fn is_param(&self) -> bool {
        self.kind == SymbolKind::Parameter
    }

    pub fn is_internal(&self) -> bool {
        self.kind == SymbolKind::Internal
    }

    pub fn is_scope(&self) -> bool {
        self.flags.contains(SymbolFlags::IS_SCOPE)
    }

    pub fn needs_slot(&self) -> bool {
        self.flags.contains(SymbolFlags::NEEDS_SLOT)
    }

    pub fn is_function_declaration(&self) -> bool {
        self.flags.contains(SymbolFlags::IS_FUNCTION_DECLARATION)
    }

    pub fn can_be_undefined(&self) -> bool {
        self.flags.contains(SymbolFlags::CAN_BE_UNDEFINED)
    }

    /// Width in slots
    pub fn width(&self) -> u16 {
        self.ty.slots()
    }

    pub fn slot(&self) -> Option<u16> {
        self.slot
    }

    pub fn field_index(&self) -> Option<u32> {
        self.field_index
    }

    /// Current storage classification. A scope-property symbol may still
    /// carry the slot its incoming value arrives in.
    pub fn storage(&self) -> StorageClass {
        if self.is_scope() {
            StorageClass::ScopeProperty(self.field_index)
        } else if let Some(slot) = self.slot {
            StorageClass::LocalSlot(slot)
        } else {
            StorageClass::Unassigned
        }
    }

    /// Move the symbol into the scope object
    pub fn set_scope(&mut self) {
        self.flags |= SymbolFlags::IS_SCOPE;
    }

    /// Give up the slot, permanently for scope symbols
    pub fn strip_slot(&mut self) {
        self.flags.remove(SymbolFlags::NEEDS_SLOT);
        self.slot = None;
    }

    /// Request a slot again. A scope-property symbol that already lost its
    /// slot can never regain one.
    pub fn request_slot(&mut self) -> Result<()> {
        if self.is_scope() && !self.needs_slot() {
            return Err(Error::internal(format!(
                "scope symbol '{}' cannot regain a slot",
                self.name
            )));
        }
        self.flags |= SymbolFlags::NEEDS_SLOT;
        Ok(())
    }

    pub(crate) fn assign_slot(&mut self, slot: u16) -> Result<()> {
        if !self.needs_slot() {
            return Err(Error::internal(format!(
                "symbol '{}' was given slot {} but does not need one",
                self.name, slot
            )));
        }
        self.slot = Some(slot);
        Ok(())
    }

    pub(crate) fn set_field_index(&mut self, index: u32) {
        self.field_index = Some(index);
    }
}

/// Ids of the compiler-reserved symbols every function owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservedSymbols {
    pub callee: SymbolId,
    pub this: SymbolId,
    pub scope: SymbolId,
    pub ret: SymbolId,
    pub varargs: Option<SymbolId>,
    pub arguments: Option<SymbolId>,
}

/// Arena of the symbols declared in one function
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, symbol: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(symbol);
        id
    }

    pub fn get(&self, id: SymbolId) -> Result<&Symbol> {
        self.symbols
            .get(id.0 as usize)
            .ok_or_else(|| Error::internal(format!("unknown symbol {}", id)))
    }

    pub fn get_mut(&mut self, id: SymbolId) -> Result<&mut Symbol> {
        self.symbols
            .get_mut(id.0 as usize)
            .ok_or_else(|| Error::internal(format!("unknown symbol {}", id)))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (SymbolId(i as u32), s))
    }

    /// Find a symbol by name, most recently declared first
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.symbols
            .iter()
            .rposition(|s| s.name == name)
            .map(|i| SymbolId(i as u32))
    }
}
