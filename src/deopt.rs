//! Deoptimization continuations
//!
//! When a speculative operation fails at run time, execution resumes in a
//! less specialized version of the function. The continuation recorded for
//! the failing program point tells the runtime which locals are live and
//! which of them must be pushed back onto the evaluation stack.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::ast::{ProgramPoint, Type};
use crate::error::{Error, Result};

/// Local state needed to resume after a failed speculation at one program
/// point. Immutable; every read hands out a copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeoptContinuation {
    local_types: Vec<Type>,
    stack_slots: Vec<u16>,
    result_type: Type,
}

impl DeoptContinuation {
    pub fn new(local_types: Vec<Type>, stack_slots: Vec<u16>, result_type: Type) -> Self {
        Self {
            local_types,
            stack_slots,
            result_type,
        }
    }

    /// Types of the local slots at the program point, indexed by slot.
    /// `Unknown` marks a dead slot.
    pub fn local_types(&self) -> Vec<Type> {
        self.local_types.clone()
    }

    /// Slots to reload onto the stack, bottom of the stack first
    pub fn stack_slots(&self) -> Vec<u16> {
        self.stack_slots.clone()
    }

    /// Speculative type of the failed operation
    pub fn result_type(&self) -> Type {
        self.result_type
    }
}

/// Continuations of one function keyed by program point
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContinuationTable {
    entries: BTreeMap<ProgramPoint, DeoptContinuation>,
}

impl ContinuationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the continuation of `pp`. Each program point is emitted once,
    /// so a second record is an internal error.
    pub fn insert(&mut self, pp: ProgramPoint, continuation: DeoptContinuation) -> Result<()> {
        if self.entries.contains_key(&pp) {
            return Err(Error::internal(format!("continuation for {} recorded twice", pp)));
        }
        self.entries.insert(pp, continuation);
        Ok(())
    }

    pub fn get(&self, pp: ProgramPoint) -> Option<DeoptContinuation> {
        self.entries.get(&pp).cloned()
    }

    /// Move every record of `other` into this table
    pub fn merge(&mut self, other: ContinuationTable) -> Result<()> {
        for (pp, continuation) in other.entries {
            self.insert(pp, continuation)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn program_points(&self) -> impl Iterator<Item = ProgramPoint> + '_ {
        self.entries.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_are_copies() {
        let continuation = DeoptContinuation::new(vec![Type::Object, Type::Int], vec![1], Type::Int);
        let mut types = continuation.local_types();
        types.clear();
        assert_eq!(continuation.local_types(), vec![Type::Object, Type::Int]);
        assert_eq!(continuation.stack_slots(), vec![1]);
    }

    #[test]
    fn test_duplicate_program_point() {
        let mut table = ContinuationTable::new();
        let c = DeoptContinuation::new(vec![], vec![], Type::Int);
        table.insert(ProgramPoint(1), c.clone()).unwrap();
        assert!(table.insert(ProgramPoint(1), c).is_err());
        assert_eq!(table.len(), 1);
        assert!(table.get(ProgramPoint(2)).is_none());
    }
}
