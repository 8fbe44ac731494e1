//! Call signatures and specialized entry points
//!
//! A [`CallSignature`] fixes the parameter and return types a function is
//! compiled for. Signatures are recorded per [`FunctionId`] in a
//! [`SignatureTable`], which is the only source of truth once passes have
//! revised the tree.

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::ast::{FunctionId, FunctionNode, Type};
use crate::bytecode::MethodDescriptor;
use crate::error::{Error, Result};

/// Types observed (or guessed) at a call site, in calling-convention
/// order: the callee reference when the callee needs it, the receiver,
/// then the arguments
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CallSiteType {
    pub has_callee: bool,
    pub params: Vec<Type>,
    pub return_type: Type,
}

impl CallSiteType {
    /// Call site passing `args` to a callee, with object-typed leading slots
    pub fn for_arguments(has_callee: bool, args: &[Type], return_type: Type) -> Self {
        let mut params = Vec::with_capacity(args.len() + 2);
        if has_callee {
            params.push(Type::Object);
        }
        params.push(Type::Object);
        params.extend_from_slice(args);
        Self {
            has_callee,
            params,
            return_type,
        }
    }

    /// Slots reserved ahead of the arguments
    pub fn leading_slots(&self) -> usize {
        1 + usize::from(self.has_callee)
    }

    pub fn argument_types(&self) -> &[Type] {
        self.params.get(self.leading_slots()..).unwrap_or(&[])
    }
}

/// Parameter and return types one compiled version of a function accepts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSignature {
    function: FunctionId,
    needs_callee: bool,
    vararg: bool,
    /// Declared parameters, or the single variadic array. `None` means
    /// not yet inferred.
    params: Vec<Option<Type>>,
    return_type: Type,
}

impl CallSignature {
    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn needs_callee(&self) -> bool {
        self.needs_callee
    }

    pub fn is_vararg(&self) -> bool {
        self.vararg
    }

    pub fn params(&self) -> &[Option<Type>] {
        &self.params
    }

    pub fn return_type(&self) -> Type {
        self.return_type
    }

    /// Type of parameter `index`; unknown indices are a lookup failure
    pub fn param_type(&self, index: usize) -> Result<Option<Type>> {
        self.params
            .get(index)
            .copied()
            .ok_or(Error::ParameterNotFound {
                function: self.function,
                index,
            })
    }

    /// Method descriptor of the entry point: callee, receiver, parameters
    pub fn descriptor(&self) -> MethodDescriptor {
        let mut params = Vec::with_capacity(self.params.len() + 2);
        if self.needs_callee {
            params.push(Type::Object);
        }
        params.push(Type::Object);
        params.extend(self.params.iter().map(|p| p.unwrap_or(Type::Object).normalized()));
        MethodDescriptor::new(params, Some(self.return_type.normalized()))
    }

    /// Whether code compiled for this signature can serve `observed`.
    ///
    /// Arity conventions must match, every compiled parameter must be at
    /// least as wide as the observed argument, and the compiled return type
    /// must fit what the call site expects.
    pub fn is_reusable_for(&self, observed: &CallSiteType) -> bool {
        if observed.has_callee != self.needs_callee {
            return false;
        }
        if self.vararg {
            return accepts(observed.return_type, self.return_type);
        }
        let args = observed.argument_types();
        let params_fit = self.params.iter().enumerate().all(|(i, compiled)| {
            let compiled = compiled.unwrap_or(Type::Object);
            let seen = args.get(i).copied().unwrap_or(Type::Object);
            accepts(compiled, seen)
        });
        params_fit && accepts(observed.return_type, self.return_type)
    }
}

/// Whether a slot of type `wide` can hold a value of type `narrow`.
/// Booleans only widen to objects; numbers widen along the lattice.
fn accepts(wide: Type, narrow: Type) -> bool {
    let (wide, narrow) = (wide.normalized(), narrow.normalized());
    wide == narrow
        || wide == Type::Object
        || (wide.is_numeric() && narrow.is_numeric() && wide >= narrow)
}

/// Derives call signatures from a function and an optional call site
pub struct CallSignatureResolver;

impl CallSignatureResolver {
    /// Signature of `function` when called from `call_site`, or its
    /// generic signature without one
    pub fn resolve(function: &FunctionNode, call_site: Option<&CallSiteType>) -> Result<CallSignature> {
        let vararg = function.is_vararg();
        let params = if vararg {
            vec![Some(Type::Object)]
        } else {
            let observed = call_site.map(|c| c.argument_types());
            let mut params = Vec::with_capacity(function.params.len());
            for (i, param) in function.params.iter().enumerate() {
                let ty = match observed {
                    Some(args) => Some(args.get(i).copied().unwrap_or(Type::Object)),
                    None => match param.symbol {
                        Some(id) => Some(function.symbols.get(id)?.ty()),
                        None => Some(param.ty),
                    },
                };
                params.push(ty.filter(|t| *t != Type::Unknown).map(Type::generic));
            }
            params
        };
        let return_type = call_site
            .map(|c| c.return_type)
            .filter(|t| *t != Type::Unknown)
            .unwrap_or(function.return_type);
        Ok(CallSignature {
            function: function.id,
            needs_callee: function.needs_callee(),
            vararg,
            params,
            return_type: return_type.normalized().generic(),
        })
    }

    /// Give the parameter symbols the types of the signature so their slot
    /// widths match the entry point. A parameter whose type is not known
    /// yet arrives as an object.
    pub fn specialize(function: &mut FunctionNode, signature: &CallSignature) -> Result<()> {
        if signature.is_vararg() {
            return Ok(());
        }
        let ids: Vec<_> = function.param_symbols().collect();
        for (i, id) in ids.into_iter().enumerate() {
            let ty = signature.param_type(i)?.unwrap_or(Type::Object);
            function.symbols.get_mut(id)?.set_type(ty);
            if let Some(node) = function.params.get_mut(i) {
                node.ty = ty;
            }
        }
        Ok(())
    }
}

/// A concrete compiled entry point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryPoint {
    pub function: FunctionId,
    pub unit: String,
    pub method: String,
    pub descriptor: MethodDescriptor,
}

/// Signatures and entry points keyed by function id
#[derive(Debug, Clone, Default, Serialize)]
pub struct SignatureTable {
    signatures: FxHashMap<FunctionId, CallSignature>,
    entry_points: FxHashMap<FunctionId, EntryPoint>,
}

impl SignatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, signature: CallSignature) {
        self.signatures.insert(signature.function, signature);
    }

    pub fn get(&self, function: FunctionId) -> Result<&CallSignature> {
        self.signatures
            .get(&function)
            .ok_or(Error::SignatureNotFound(function))
    }

    /// Parameter type as recorded; `Ok(None)` means not yet inferred
    pub fn param_type(&self, function: FunctionId, index: usize) -> Result<Option<Type>> {
        self.get(function)?.param_type(index)
    }

    pub fn set_entry_point(&mut self, entry: EntryPoint) -> Result<()> {
        self.get(entry.function)?;
        self.entry_points.insert(entry.function, entry);
        Ok(())
    }

    /// Entry point of a function with a recorded signature, if compiled
    pub fn entry_point(&self, function: FunctionId) -> Result<Option<&EntryPoint>> {
        self.get(function)?;
        Ok(self.entry_points.get(&function))
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Recorded function ids in ascending order
    pub fn functions(&self) -> Vec<FunctionId> {
        let mut ids: Vec<_> = self.signatures.keys().copied().collect();
        ids.sort();
        ids
    }
}
