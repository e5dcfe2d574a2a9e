//! IR modules.
//!
//! A module is an ordered symbol table: imported prototypes (host symbols,
//! other modules' functions) and defined functions with their Cranelift IR
//! bodies. Call sites inside the bodies reference callees through
//! `UserExternalName { namespace: 0, index }` where `index` is the callee's
//! position in *this* module's table; installing a module into an execution
//! engine remaps those indices to the engine's function ids. Bodies are plain
//! data, so cloning a module is a pure deep copy usable from any thread.

use crate::{template::ShaderArgument, types::DataType};
use cranelift_codegen::ir::{types, AbiParam, ExternalName, Function, Signature, Type, UserExternalName};
use cranelift_codegen::isa::CallConv;
use cranelift_module::FuncId;
use once_cell::sync::Lazy;
use smol_str::SmolStr;
use std::collections::HashMap;
use target_lexicon::Triple;

#[derive(Clone)]
pub struct IrSymbol {
    pub name: SmolStr,
    pub signature: Signature,
    pub def: Option<Function>,
}

impl IrSymbol {
    pub fn is_defined(&self) -> bool {
        self.def.is_some()
    }
}

#[derive(Clone)]
pub struct IrModule {
    name: SmolStr,
    symbols: Vec<IrSymbol>,
    index: HashMap<SmolStr, u32>,
}

impl IrModule {
    pub fn new(name: impl Into<SmolStr>) -> IrModule {
        IrModule {
            name: name.into(),
            symbols: vec![],
            index: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares a symbol and returns its local index. Redeclaring an existing
    /// name returns the previous index without touching the table.
    pub fn declare(&mut self, name: impl Into<SmolStr>, signature: Signature) -> u32 {
        let name = name.into();
        if let Some(&local) = self.index.get(&name) {
            return local;
        }
        let local = self.symbols.len() as u32;
        self.index.insert(name.clone(), local);
        self.symbols.push(IrSymbol {
            name,
            signature,
            def: None,
        });
        local
    }

    /// Attaches a body to a previously declared symbol.
    pub fn define(&mut self, local: u32, body: Function) {
        self.symbols[local as usize].def = Some(body);
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    pub fn symbol(&self, local: u32) -> &IrSymbol {
        &self.symbols[local as usize]
    }

    pub fn symbols(&self) -> impl Iterator<Item = &IrSymbol> + '_ {
        self.symbols.iter()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Rewrites the module-local callee indices of a cloned function body to the
/// execution-engine function ids in `ids` (indexed by local symbol index).
pub(crate) fn remap_function_refs(func: &mut Function, ids: &[FuncId]) {
    let mut fixups = Vec::new();
    for (func_ref, ext) in func.dfg.ext_funcs.iter() {
        if let ExternalName::User(name_ref) = ext.name {
            let local = func.params.user_named_funcs()[name_ref].index;
            fixups.push((func_ref, local));
        }
    }
    for (func_ref, local) in fixups {
        let id = ids[local as usize];
        let name_ref = func.declare_imported_user_function(UserExternalName {
            namespace: 0,
            index: id.as_u32(),
        });
        func.dfg.ext_funcs[func_ref].name = ExternalName::User(name_ref);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ABI lowering
////////////////////////////////////////////////////////////////////////////////////////////////////

static HOST_CALL_CONV: Lazy<CallConv> = Lazy::new(|| CallConv::triple_default(&Triple::host()));

/// The native calling convention shared by generated code and the host.
pub(crate) fn host_call_conv() -> CallConv {
    *HOST_CALL_CONV
}

pub(crate) fn pointer_type() -> Type {
    if cfg!(target_pointer_width = "32") {
        types::I32
    } else {
        types::I64
    }
}

/// The Cranelift type of a by-value scalar, `None` for aggregates.
pub(crate) fn scalar_type(ty: DataType) -> Option<Type> {
    match ty {
        DataType::Int => Some(types::I32),
        DataType::Float => Some(types::F32),
        DataType::Double => Some(types::F64),
        DataType::Bool => Some(types::I8),
        DataType::Closure => Some(pointer_type()),
        _ => None,
    }
}

/// The ABI type of an `in` argument: scalars by value, aggregates by pointer.
pub(crate) fn abi_param_type(ty: DataType) -> Type {
    scalar_type(ty).unwrap_or_else(pointer_type)
}

/// The signature of a shader root function or group wrapper: exposed
/// arguments in order (`out` always by pointer) plus the trailing context
/// pointer.
pub(crate) fn unit_signature(args: &[ShaderArgument]) -> Signature {
    let mut sig = Signature::new(host_call_conv());
    for arg in args {
        let ty = match arg.direction {
            crate::types::ArgDirection::In => abi_param_type(arg.ty),
            crate::types::ArgDirection::Out => pointer_type(),
        };
        sig.params.push(AbiParam::new(ty));
    }
    sig.params.push(AbiParam::new(pointer_type()));
    sig
}

/// The signature of a free function: `in` parameters only, optional scalar
/// return, no context pointer.
pub(crate) fn function_signature(params: &[DataType], ret: DataType) -> Signature {
    let mut sig = Signature::new(host_call_conv());
    for &param in params {
        sig.params.push(AbiParam::new(abi_param_type(param)));
    }
    if ret != DataType::Void {
        // scalar returns only; enforced during lowering
        if let Some(ty) = scalar_type(ret) {
            sig.returns.push(AbiParam::new(ty));
        }
    }
    sig
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_is_idempotent() {
        let mut module = IrModule::new("m");
        let sig = Signature::new(host_call_conv());
        let a = module.declare("f", sig.clone());
        let b = module.declare("f", sig);
        assert_eq!(a, b);
        assert_eq!(module.len(), 1);
    }

    #[test]
    fn scalar_abi_types() {
        assert_eq!(scalar_type(DataType::Float), Some(types::F32));
        assert_eq!(scalar_type(DataType::Bool), Some(types::I8));
        assert_eq!(scalar_type(DataType::Float3), None);
        assert_eq!(abi_param_type(DataType::Float3), pointer_type());
    }
}
