//! Closure registry and the closure-tree ABI shared with the host renderer.

use crate::{
    error::{Error, Result},
    ir::{self, IrModule},
    types::DataType,
};
use cranelift_codegen::ir::{AbiParam, Signature};
use indexmap::IndexMap;
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::{mem, sync::Arc};
use tracing::debug;

/// Identifier of a registered closure type. Nonzero; user closures are
/// positive, assigned densely from 1. Not stable across process restarts.
pub type ClosureId = i32;

pub const CLOSURE_INVALID: ClosureId = 0;
pub const CLOSURE_ADD: ClosureId = -1;
pub const CLOSURE_MUL: ClosureId = -2;

/// Host symbol of the closure-tree node allocator.
pub const CLOSURE_ALLOCATOR_SYMBOL: &str = "tsl_allocate_closure";

/// Host symbol of the constructor of a registered closure.
pub fn constructor_symbol(name: &str) -> SmolStr {
    SmolStr::new(format!("make_closure_{}", name))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Closure-tree nodes
////////////////////////////////////////////////////////////////////////////////////////////////////

// These layouts are wire-compatible with the host renderer; generated code
// stores node fields at the exact offsets below. 64-bit pointers only.

#[repr(C)]
#[derive(Debug)]
pub struct ClosureTreeNodeBase {
    pub id: ClosureId,
}

#[repr(C)]
#[derive(Debug)]
pub struct ClosureTreeNodeAdd {
    pub id: ClosureId,
    pub left: *mut ClosureTreeNodeBase,
    pub right: *mut ClosureTreeNodeBase,
}

#[repr(C)]
#[derive(Debug)]
pub struct ClosureTreeNodeMul {
    pub id: ClosureId,
    pub weight: f32,
    pub child: *mut ClosureTreeNodeBase,
}

const _: () = {
    assert!(mem::size_of::<ClosureTreeNodeBase>() == 4);
    assert!(mem::size_of::<ClosureTreeNodeAdd>() == 24);
    assert!(mem::offset_of!(ClosureTreeNodeAdd, left) == 8);
    assert!(mem::offset_of!(ClosureTreeNodeAdd, right) == 16);
    assert!(mem::size_of::<ClosureTreeNodeMul>() == 16);
    assert!(mem::offset_of!(ClosureTreeNodeMul, weight) == 4);
    assert!(mem::offset_of!(ClosureTreeNodeMul, child) == 8);
};

pub(crate) const ADD_NODE_SIZE: u32 = mem::size_of::<ClosureTreeNodeAdd>() as u32;
pub(crate) const ADD_LEFT_OFFSET: i32 = mem::offset_of!(ClosureTreeNodeAdd, left) as i32;
pub(crate) const ADD_RIGHT_OFFSET: i32 = mem::offset_of!(ClosureTreeNodeAdd, right) as i32;
pub(crate) const MUL_NODE_SIZE: u32 = mem::size_of::<ClosureTreeNodeMul>() as u32;
pub(crate) const MUL_WEIGHT_OFFSET: i32 = mem::offset_of!(ClosureTreeNodeMul, weight) as i32;
pub(crate) const MUL_CHILD_OFFSET: i32 = mem::offset_of!(ClosureTreeNodeMul, child) as i32;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Registry
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug)]
pub struct ClosureField {
    pub name: SmolStr,
    pub ty: DataType,
}

impl ClosureField {
    pub fn new(name: impl Into<SmolStr>, ty: DataType) -> ClosureField {
        ClosureField { name: name.into(), ty }
    }
}

#[derive(Clone, Debug)]
pub struct ClosureSchema {
    pub id: ClosureId,
    pub name: SmolStr,
    pub fields: Vec<ClosureField>,
    pub size: u32,
}

struct RegistryInner {
    schemas: IndexMap<SmolStr, ClosureSchema>,
    module: Arc<IrModule>,
}

/// Assigns stable ids to named closure types and owns the closure module: an
/// IR module declaring the host's allocator and per-closure constructors.
/// Registration serializes under one mutex; readers get copy-on-write
/// snapshots of the module.
pub struct ClosureRegistry {
    inner: Mutex<RegistryInner>,
}

impl ClosureRegistry {
    pub fn new() -> ClosureRegistry {
        let mut module = IrModule::new("tsl_closures");
        module.declare(CLOSURE_ALLOCATOR_SYMBOL, allocator_signature());
        ClosureRegistry {
            inner: Mutex::new(RegistryInner {
                schemas: IndexMap::new(),
                module: Arc::new(module),
            }),
        }
    }

    /// Registers a closure type and returns its id. Re-registering a name
    /// returns the previously assigned id without mutating the module.
    pub fn register(&self, name: &str, fields: &[ClosureField], size: u32) -> Result<ClosureId> {
        if size == 0 {
            return Err(Error::InvalidClosureSchema);
        }
        for field in fields {
            match field.ty {
                DataType::Void | DataType::Closure => return Err(Error::InvalidClosureSchema),
                _ => {}
            }
        }

        let mut inner = self.inner.lock();
        if let Some(schema) = inner.schemas.get(name) {
            return Ok(schema.id);
        }

        let id = inner.schemas.len() as ClosureId + 1;
        let schema = ClosureSchema {
            id,
            name: SmolStr::new(name),
            fields: fields.to_vec(),
            size,
        };
        Arc::make_mut(&mut inner.module).declare(constructor_symbol(name), constructor_signature(fields));
        inner.schemas.insert(schema.name.clone(), schema);
        debug!(closure = name, id, "registered closure");
        Ok(id)
    }

    pub fn schema(&self, name: &str) -> Option<ClosureSchema> {
        self.inner.lock().schemas.get(name).cloned()
    }

    /// A snapshot of the closure module, to be cloned (never moved) into an
    /// execution engine.
    pub fn closure_module(&self) -> Arc<IrModule> {
        self.inner.lock().module.clone()
    }
}

impl Default for ClosureRegistry {
    fn default() -> Self {
        ClosureRegistry::new()
    }
}

pub(crate) fn allocator_signature() -> Signature {
    let mut sig = Signature::new(ir::host_call_conv());
    sig.params.push(AbiParam::new(cranelift_codegen::ir::types::I32));
    sig.returns.push(AbiParam::new(ir::pointer_type()));
    sig
}

pub(crate) fn constructor_signature(fields: &[ClosureField]) -> Signature {
    let mut sig = Signature::new(ir::host_call_conv());
    for field in fields {
        sig.params.push(AbiParam::new(ir::abi_param_type(field.ty)));
    }
    sig.returns.push(AbiParam::new(ir::pointer_type()));
    sig
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_ids_and_idempotent_registration() {
        let registry = ClosureRegistry::new();
        let lambert = registry
            .register("Lambert", &[ClosureField::new("base_color", DataType::Float3)], 16)
            .unwrap();
        let oren = registry
            .register(
                "OrenNayar",
                &[
                    ClosureField::new("base_color", DataType::Float3),
                    ClosureField::new("sigma", DataType::Float),
                ],
                24,
            )
            .unwrap();
        assert_eq!(lambert, 1);
        assert_eq!(oren, 2);

        let module_before = registry.closure_module();
        let again = registry
            .register("Lambert", &[ClosureField::new("base_color", DataType::Float3)], 16)
            .unwrap();
        assert_eq!(again, lambert);
        // no module mutation on re-registration
        assert_eq!(module_before.len(), registry.closure_module().len());
    }

    #[test]
    fn rejects_bad_schemas() {
        let registry = ClosureRegistry::new();
        assert!(matches!(
            registry.register("Empty", &[], 0),
            Err(Error::InvalidClosureSchema)
        ));
        assert!(matches!(
            registry.register("Nested", &[ClosureField::new("inner", DataType::Closure)], 8),
            Err(Error::InvalidClosureSchema)
        ));
    }

    #[test]
    fn module_declares_constructors() {
        let registry = ClosureRegistry::new();
        registry
            .register("Lambert", &[ClosureField::new("base_color", DataType::Float3)], 16)
            .unwrap();
        let module = registry.closure_module();
        assert!(module.lookup(CLOSURE_ALLOCATOR_SYMBOL).is_some());
        assert!(module.lookup("make_closure_Lambert").is_some());
    }
}
