//! Local slot numbering and dynamic scope tracking
//!
//! A [`ScopeTracker`] is threaded through the passes that need to know
//! which slots are live. Each lexical block pushes a [`Frame`]; a function
//! body starts numbering at 0, any other block continues from the first
//! free slot of its parent. Popping a frame releases its slots to later
//! siblings.

use tracing::trace;

use crate::ast::{SymbolId, SymbolTable, Type};
use crate::error::{Error, Result};

/// Symbols of one lexical block and the slot range they occupy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    base: u16,
    local: u16,
    quick: u16,
    symbols: Vec<SymbolId>,
}

impl Frame {
    /// First slot of this frame, the parent's total
    pub fn base(&self) -> u16 {
        self.base
    }

    /// Slots this frame contributes
    pub fn local(&self) -> u16 {
        self.local
    }

    pub fn total(&self) -> u16 {
        self.base + self.local
    }

    pub fn symbols(&self) -> &[SymbolId] {
        &self.symbols
    }

    /// Number the frame's slot-needing symbols contiguously from `base`.
    /// Quick slots stay reserved after them.
    fn assign(&mut self, table: &mut SymbolTable) -> Result<()> {
        self.local = 0;
        for &id in &self.symbols {
            let symbol = table.get_mut(id)?;
            if !symbol.needs_slot() {
                continue;
            }
            let width = symbol.width();
            symbol.assign_slot(self.base + self.local)?;
            self.local += width;
        }
        self.local += self.quick;
        Ok(())
    }
}

/// Frame stack plus the dynamic scope boundary counter
#[derive(Debug, Default)]
pub struct ScopeTracker {
    frames: Vec<Frame>,
    dynamic_scope_count: u32,
    max_slots: u16,
}

impl ScopeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker for a function declared inside a dynamic scope
    pub fn in_dynamic_context(in_dynamic_scope: bool) -> Self {
        Self {
            dynamic_scope_count: u32::from(in_dynamic_scope),
            ..Self::default()
        }
    }

    /// Enter a block declaring `symbols` and assign their slots
    pub fn push_frame(
        &mut self,
        symbols: &[SymbolId],
        table: &mut SymbolTable,
        is_function_body: bool,
    ) -> Result<()> {
        let base = if is_function_body {
            0
        } else {
            self.frames.last().map(Frame::total).unwrap_or(0)
        };
        let mut frame = Frame {
            base,
            local: 0,
            quick: 0,
            symbols: symbols.to_vec(),
        };
        frame.assign(table)?;
        trace!(depth = self.frames.len(), base, local = frame.local, "push frame");
        self.max_slots = self.max_slots.max(frame.total());
        self.frames.push(frame);
        Ok(())
    }

    /// Leave the innermost block
    pub fn pop_frame(&mut self) -> Result<Frame> {
        self.frames
            .pop()
            .ok_or_else(|| Error::frame_mismatch("pop_frame without a matching push_frame"))
    }

    /// Renumber the innermost frame from its current symbol order.
    /// Running it twice in a row changes nothing.
    pub fn realign(&mut self, table: &mut SymbolTable) -> Result<()> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| Error::frame_mismatch("realign with no open frame"))?;
        frame.assign(table)?;
        self.max_slots = self.max_slots.max(frame.total());
        Ok(())
    }

    /// Allocate an anonymous slot in the innermost frame. It lives until
    /// the frame is popped.
    pub fn quick_slot(&mut self, ty: Type) -> Result<u16> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| Error::frame_mismatch("quick slot with no open frame"))?;
        let slot = frame.total();
        let width = ty.normalized().slots();
        frame.quick += width;
        frame.local += width;
        self.max_slots = self.max_slots.max(frame.total());
        Ok(slot)
    }

    pub fn enter_dynamic_scope(&mut self) {
        self.dynamic_scope_count += 1;
    }

    pub fn leave_dynamic_scope(&mut self) -> Result<()> {
        self.dynamic_scope_count = self
            .dynamic_scope_count
            .checked_sub(1)
            .ok_or_else(|| Error::frame_mismatch("left a dynamic scope that was never entered"))?;
        Ok(())
    }

    pub fn in_dynamic_scope(&self) -> bool {
        self.dynamic_scope_count > 0
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// First free slot of the innermost frame
    pub fn next_slot(&self) -> u16 {
        self.frames.last().map(Frame::total).unwrap_or(0)
    }

    /// High-water mark of slots in use
    pub fn max_slots(&self) -> u16 {
        self.max_slots
    }

    pub fn current(&self) -> Option<&Frame> {
        self.frames.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Symbol, SymbolKind};

    fn table(types: &[Type]) -> (SymbolTable, Vec<SymbolId>) {
        let mut table = SymbolTable::new();
        let ids = types
            .iter()
            .enumerate()
            .map(|(i, ty)| table.add(Symbol::new(format!("v{}", i), SymbolKind::Variable, *ty)))
            .collect();
        (table, ids)
    }

    #[test]
    fn test_function_body_starts_at_zero() {
        let (mut symbols, ids) = table(&[Type::Int, Type::Number, Type::Object]);
        let mut tracker = ScopeTracker::new();
        tracker.push_frame(&ids, &mut symbols, true).unwrap();
        let slots: Vec<_> = ids.iter().map(|id| symbols.get(*id).unwrap().slot()).collect();
        assert_eq!(slots, vec![Some(0), Some(1), Some(3)]);
        assert_eq!(tracker.current().unwrap().total(), 4);
    }

    #[test]
    fn test_nested_block_continues_from_parent() {
        let (mut symbols, ids) = table(&[Type::Int, Type::Object, Type::Long]);
        let mut tracker = ScopeTracker::new();
        tracker.push_frame(&ids[..1], &mut symbols, true).unwrap();
        tracker.push_frame(&ids[1..2], &mut symbols, false).unwrap();
        assert_eq!(symbols.get(ids[1]).unwrap().slot(), Some(1));
        tracker.pop_frame().unwrap();

        // The sibling reuses the released range
        tracker.push_frame(&ids[2..], &mut symbols, false).unwrap();
        assert_eq!(symbols.get(ids[2]).unwrap().slot(), Some(1));
        assert_eq!(tracker.max_slots(), 3);
    }

    #[test]
    fn test_symbols_without_slots_are_skipped() {
        let (mut symbols, ids) = table(&[Type::Int, Type::Object, Type::Int]);
        symbols.get_mut(ids[1]).unwrap().strip_slot();
        let mut tracker = ScopeTracker::new();
        tracker.push_frame(&ids, &mut symbols, true).unwrap();
        assert_eq!(symbols.get(ids[1]).unwrap().slot(), None);
        assert_eq!(symbols.get(ids[2]).unwrap().slot(), Some(1));
    }

    #[test]
    fn test_realign_is_idempotent() {
        let (mut symbols, ids) = table(&[Type::Number, Type::Int]);
        let mut tracker = ScopeTracker::new();
        tracker.push_frame(&ids, &mut symbols, true).unwrap();
        symbols.get_mut(ids[0]).unwrap().set_type(Type::Int);
        tracker.realign(&mut symbols).unwrap();
        let once: Vec<_> = ids.iter().map(|id| symbols.get(*id).unwrap().slot()).collect();
        tracker.realign(&mut symbols).unwrap();
        let twice: Vec<_> = ids.iter().map(|id| symbols.get(*id).unwrap().slot()).collect();
        assert_eq!(once, vec![Some(0), Some(1)]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_quick_slot_extends_current_frame() {
        let (mut symbols, ids) = table(&[Type::Int]);
        let mut tracker = ScopeTracker::new();
        tracker.push_frame(&ids, &mut symbols, true).unwrap();
        assert_eq!(tracker.quick_slot(Type::Object).unwrap(), 1);
        assert_eq!(tracker.quick_slot(Type::Number).unwrap(), 2);
        assert_eq!(tracker.next_slot(), 4);
        tracker.push_frame(&[], &mut symbols, false).unwrap();
        assert_eq!(tracker.current().unwrap().base(), 4);
    }

    #[test]
    fn test_realign_keeps_quick_slots() {
        let (mut symbols, ids) = table(&[Type::Int]);
        let mut tracker = ScopeTracker::new();
        tracker.push_frame(&ids, &mut symbols, true).unwrap();
        let first = tracker.quick_slot(Type::Int).unwrap();
        tracker.realign(&mut symbols).unwrap();
        let second = tracker.quick_slot(Type::Int).unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(symbols.get(ids[0]).unwrap().slot(), Some(0));
        tracker.push_frame(&[], &mut symbols, false).unwrap();
        assert_eq!(tracker.current().unwrap().base(), 3);
    }

    #[test]
    fn test_unbalanced_operations_fail() {
        let mut tracker = ScopeTracker::new();
        assert!(matches!(tracker.pop_frame(), Err(Error::FrameMismatch(_))));
        assert!(tracker.quick_slot(Type::Object).is_err());
        assert!(tracker.leave_dynamic_scope().is_err());
    }

    #[test]
    fn test_dynamic_scope_counter() {
        let mut tracker = ScopeTracker::in_dynamic_context(true);
        assert!(tracker.in_dynamic_scope());
        tracker.enter_dynamic_scope();
        tracker.leave_dynamic_scope().unwrap();
        tracker.leave_dynamic_scope().unwrap();
        assert!(!tracker.in_dynamic_scope());
    }
}
