//! Compile units: bounded-size output artifacts
//!
//! Every emitted method is attributed to a [`CompileUnit`]. Units are
//! filled first-fit by [`CompileUnits::find_unit`]; a unit accepts new
//! weight only while `weight + w < threshold`. Once an
//! [`ArtifactHandle`] is installed the unit is frozen.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::ast::{FunctionId, LiteralValue, Type};
use crate::bytecode::{CallSiteFlags, MethodCode, MethodDescriptor, MethodEmitter, MethodRef};
use crate::error::{Error, Result};

/// A function whose lazy initialization a unit is responsible for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FunctionInitializer {
    pub function: FunctionId,
    pub method: String,
}

/// Realized artifact of a finalized unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactHandle {
    pub unit: String,
    pub methods: Vec<String>,
    pub weight: u64,
}

/// What a shared scope helper does with the name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SharedCallKind {
    Get,
    Call { argc: u16 },
}

/// Structural identity of a shared scope helper
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SharedCallKey {
    pub name: String,
    pub kind: SharedCallKind,
    /// Argument types, empty for reads
    pub args: Vec<Type>,
    pub ty: Type,
    pub flags: CallSiteFlags,
}

/// A helper method that reads or calls one scope name, shared by every
/// site in a unit with the same key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedScopeCall {
    key: SharedCallKey,
    method: MethodRef,
}

impl SharedScopeCall {
    fn new(unit: &str, index: usize, key: SharedCallKey) -> Self {
        let mut params = vec![Type::Object];
        params.extend(key.args.iter().map(|t| t.normalized()));
        let kind = match key.kind {
            SharedCallKind::Get => "scopeGet",
            SharedCallKind::Call { .. } => "scopeCall",
        };
        let method = MethodRef::new(
            unit.to_string(),
            format!("{}${}${}", kind, key.name, index),
            MethodDescriptor::new(params, Some(key.ty.normalized())),
        );
        Self { key, method }
    }

    pub fn key(&self) -> &SharedCallKey {
        &self.key
    }

    /// Static method to invoke with the scope and the arguments
    pub fn method(&self) -> &MethodRef {
        &self.method
    }

    /// Emit the helper body
    pub fn generate(&self) -> Result<MethodCode> {
        let mut m = MethodEmitter::new(u32::MAX, self.method.name.to_string(), self.method.descriptor.clone());
        let flags = self.key.flags | CallSiteFlags::SCOPE;
        m.load(Type::Object, 0);
        match self.key.kind {
            SharedCallKind::Get => {
                m.dynamic_get(&self.key.name, self.key.ty, flags, None)?;
            }
            SharedCallKind::Call { argc } => {
                m.dynamic_get(&self.key.name, Type::Object, flags, None)?;
                m.push(LiteralValue::Undefined);
                let mut slot = 1;
                for ty in &self.key.args {
                    m.load(*ty, slot);
                    slot += ty.normalized().slots();
                }
                m.dynamic_call(argc, self.key.ty, self.key.flags, None)?;
            }
        }
        m.ret(self.key.ty)?;
        let (code, _) = m.finish()?;
        Ok(code)
    }
}

#[derive(Debug, Default)]
struct UnitState {
    weight: u64,
    initializers: Vec<FunctionInitializer>,
    shared_calls: Vec<SharedScopeCall>,
    shared_index: FxHashMap<SharedCallKey, usize>,
    finalized: bool,
    initialized: bool,
}

impl UnitState {
    fn ensure_open(&self, unit: &str) -> Result<()> {
        if self.finalized {
            Err(Error::UnitFinalized(unit.to_string()))
        } else {
            Ok(())
        }
    }
}

/// One bounded-size output artifact. Every mutation and the switch to
/// finalized happen under `state`.
#[derive(Debug)]
pub struct CompileUnit {
    name: String,
    threshold: u64,
    state: Mutex<UnitState>,
    artifact: OnceLock<ArtifactHandle>,
}

impl CompileUnit {
    pub fn new(name: impl Into<String>, threshold: u64) -> Self {
        Self {
            name: name.into(),
            threshold,
            state: Mutex::new(UnitState::default()),
            artifact: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> u64 {
        self.state.lock().weight
    }

    pub fn can_hold(&self, weight: u64) -> bool {
        let state = self.state.lock();
        !state.finalized && state.weight + weight < self.threshold
    }

    /// Add `weight` if it fits; check and add happen under one lock
    fn try_reserve(&self, weight: u64) -> bool {
        let mut state = self.state.lock();
        if !state.finalized && state.weight + weight < self.threshold {
            state.weight += weight;
            true
        } else {
            false
        }
    }

    pub fn add_weight(&self, weight: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open(&self.name)?;
        state.weight += weight;
        Ok(())
    }

    /// Register a function for lazy initialization; duplicates are ignored
    pub fn add_function_initializer(&self, function: FunctionId, method: impl Into<String>) -> Result<()> {
        let initializer = FunctionInitializer {
            function,
            method: method.into(),
        };
        let mut state = self.state.lock();
        state.ensure_open(&self.name)?;
        if !state.initializers.contains(&initializer) {
            state.initializers.push(initializer);
        }
        Ok(())
    }

    pub fn initializers(&self) -> Vec<FunctionInitializer> {
        self.state.lock().initializers.clone()
    }

    /// Get or create the shared helper for `key`
    pub fn shared_scope_call(&self, key: SharedCallKey) -> Result<SharedScopeCall> {
        let mut state = self.state.lock();
        if let Some(&index) = state.shared_index.get(&key) {
            return Ok(state.shared_calls[index].clone());
        }
        state.ensure_open(&self.name)?;
        let index = state.shared_calls.len();
        let call = SharedScopeCall::new(&self.name, index, key.clone());
        state.shared_index.insert(key, index);
        state.shared_calls.push(call.clone());
        Ok(call)
    }

    /// Shared helpers in creation order
    pub fn shared_calls(&self) -> Vec<SharedScopeCall> {
        self.state.lock().shared_calls.clone()
    }

    pub fn is_finalized(&self) -> bool {
        self.state.lock().finalized
    }

    pub fn artifact(&self) -> Option<&ArtifactHandle> {
        self.artifact.get()
    }

    /// Install the realized artifact. Happens once; later weight and
    /// initializer additions fail.
    pub fn set_artifact(&self, handle: ArtifactHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open(&self.name)?;
        self.artifact
            .set(handle)
            .map_err(|_| Error::UnitFinalized(self.name.clone()))?;
        state.finalized = true;
        Ok(())
    }

    /// Hand out the initializer set of a finalized unit and clear it. A
    /// second call is an error.
    pub fn initialize_functions_code(&self) -> Result<Vec<FunctionInitializer>> {
        let mut state = self.state.lock();
        if !state.finalized {
            return Err(Error::internal(format!(
                "compile unit {} initialized before it was finalized",
                self.name
            )));
        }
        if state.initialized {
            return Err(Error::UnitFinalized(self.name.clone()));
        }
        state.initialized = true;
        Ok(std::mem::take(&mut state.initializers))
    }
}

/// The open compile units of one compiler
#[derive(Debug)]
pub struct CompileUnits {
    prefix: String,
    threshold: u64,
    units: RwLock<Vec<Arc<CompileUnit>>>,
}

impl CompileUnits {
    pub fn new(prefix: impl Into<String>, threshold: u64) -> Self {
        Self {
            prefix: prefix.into(),
            threshold,
            units: RwLock::new(Vec::new()),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// First unit that can hold `weight`, charged with it. A new unit is
    /// opened when none can; a weight at or past the threshold always gets
    /// a unit of its own.
    pub fn find_unit(&self, weight: u64) -> Arc<CompileUnit> {
        let mut units = self.units.write();
        if let Some(unit) = units.iter().find(|u| u.try_reserve(weight)) {
            return Arc::clone(unit);
        }
        let name = format!("{}${}", self.prefix, units.len());
        debug!(unit = %name, weight, "opening compile unit");
        let unit = Arc::new(CompileUnit::new(name, self.threshold));
        unit.state.lock().weight = weight;
        units.push(Arc::clone(&unit));
        unit
    }

    pub fn get(&self, name: &str) -> Result<Arc<CompileUnit>> {
        self.units
            .read()
            .iter()
            .find(|u| u.name == name)
            .cloned()
            .ok_or_else(|| Error::internal(format!("unknown compile unit {}", name)))
    }

    pub fn units(&self) -> Vec<Arc<CompileUnit>> {
        self.units.read().clone()
    }

    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.read().is_empty()
    }
}

/// Turns a unit's methods into a loadable artifact
pub trait CodeInstaller: Send + Sync {
    fn install(&self, unit: &CompileUnit, methods: &[MethodCode]) -> Result<ArtifactHandle>;
}

/// Installer that keeps the methods in memory
#[derive(Debug, Default)]
pub struct InMemoryInstaller {
    installed: Mutex<FxHashMap<String, Vec<MethodCode>>>,
}

impl InMemoryInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Methods installed for `unit`
    pub fn methods(&self, unit: &str) -> Vec<MethodCode> {
        self.installed.lock().get(unit).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.installed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.installed.lock().is_empty()
    }
}

impl CodeInstaller for InMemoryInstaller {
    fn install(&self, unit: &CompileUnit, methods: &[MethodCode]) -> Result<ArtifactHandle> {
        let mut installed = self.installed.lock();
        if installed.contains_key(unit.name()) {
            return Err(Error::UnitFinalized(unit.name().to_string()));
        }
        installed.insert(unit.name().to_string(), methods.to_vec());
        Ok(ArtifactHandle {
            unit: unit.name().to_string(),
            methods: methods.iter().map(|m| m.name.clone()).collect(),
            weight: unit.weight(),
        })
    }
}
