//! Global module: the host context type and the runtime math prototypes
//! every shader sees.

use crate::{
    ir::{self, IrModule},
    types::DataType,
};
use cranelift_codegen::ir::{AbiParam, Signature};

/// Opaque host-defined execution context, passed as the implicit trailing
/// argument of every shader function and group wrapper. The engine never
/// inspects it.
#[repr(C)]
pub struct TslGlobal {
    _opaque: [u8; 0],
}

/// Prototype of a builtin runtime function. `symbol` is the in-process
/// C-runtime symbol the engine's resolver binds the call to.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinFunction {
    pub name: &'static str,
    pub symbol: &'static str,
    pub params: &'static [DataType],
    pub ret: DataType,
}

const F1: &[DataType] = &[DataType::Float];
const F2: &[DataType] = &[DataType::Float, DataType::Float];

static BUILTIN_FUNCTIONS: &[BuiltinFunction] = &[
    BuiltinFunction { name: "sin", symbol: "sinf", params: F1, ret: DataType::Float },
    BuiltinFunction { name: "cos", symbol: "cosf", params: F1, ret: DataType::Float },
    BuiltinFunction { name: "tan", symbol: "tanf", params: F1, ret: DataType::Float },
    BuiltinFunction { name: "sqrt", symbol: "sqrtf", params: F1, ret: DataType::Float },
    BuiltinFunction { name: "pow", symbol: "powf", params: F2, ret: DataType::Float },
    BuiltinFunction { name: "floor", symbol: "floorf", params: F1, ret: DataType::Float },
    BuiltinFunction { name: "abs", symbol: "fabsf", params: F1, ret: DataType::Float },
    BuiltinFunction { name: "exp", symbol: "expf", params: F1, ret: DataType::Float },
    BuiltinFunction { name: "log", symbol: "logf", params: F1, ret: DataType::Float },
];

/// Declares the types and external prototypes shared by every compiled
/// shader. Created once by the shading context and referenced by each
/// compile.
pub struct GlobalModule {
    builtins: &'static [BuiltinFunction],
}

impl GlobalModule {
    pub fn new() -> GlobalModule {
        GlobalModule {
            builtins: BUILTIN_FUNCTIONS,
        }
    }

    pub(crate) fn find(&self, name: &str) -> Option<&'static BuiltinFunction> {
        self.builtins.iter().find(|b| b.name == name)
    }

    /// Materializes the runtime prototypes inside a unit module.
    pub(crate) fn declare_prototypes(&self, module: &mut IrModule) {
        for builtin in self.builtins {
            module.declare(builtin.symbol, builtin_signature(builtin));
        }
    }
}

impl Default for GlobalModule {
    fn default() -> Self {
        GlobalModule::new()
    }
}

pub(crate) fn builtin_signature(builtin: &BuiltinFunction) -> Signature {
    let mut sig = Signature::new(ir::host_call_conv());
    for &param in builtin.params {
        sig.params.push(AbiParam::new(ir::abi_param_type(param)));
    }
    if let Some(ty) = ir::scalar_type(builtin.ret) {
        sig.returns.push(AbiParam::new(ty));
    }
    sig
}
