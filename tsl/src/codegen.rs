//! AST lowering.
//!
//! Recursive lowering of a parsed shader into an IR module: type resolution,
//! symbol scopes, expression and control-flow emission, prologue/epilogue.
//! Locals live in explicit stack slots and are accessed through loads and
//! stores; the backend's optimizer turns them back into registers when the
//! template allows optimization.

use crate::{
    ast::{
        AstStore, BinaryOp, Expr, ExprId, FunctionDecl, FunctionId, GlobalDecl, GlobalId, Span, Stmt, StmtId,
        StructDecl, StructId, TypeSpec, UnaryOp,
    },
    closure::{self, ClosureRegistry, ClosureSchema},
    error::DiagnosticSink,
    global::GlobalModule,
    ir::{self, IrModule},
    template::ShaderArgument,
    types::{ArgDirection, DataType, ShaderValue},
};
use cranelift_codegen::ir::{
    condcodes::{FloatCC, IntCC},
    types, Block, ExtFuncData, ExternalName, FuncRef, Function, Inst, InstBuilder, MemFlags, Signature, StackSlot,
    StackSlotData, StackSlotKind, UserExternalName, UserFuncName, Value,
};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use indexmap::IndexSet;
use smol_str::SmolStr;
use std::{collections::HashMap, fmt};
use tracing::debug;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Inputs & outputs
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) struct CodegenInput<'a> {
    pub store: &'a AstStore,
    pub module_name: &'a str,
    pub registry: &'a ClosureRegistry,
    pub globals: &'a GlobalModule,
    pub structs: &'a [StructId],
    pub global_params: &'a [GlobalId],
    pub functions: &'a [FunctionId],
    pub root: FunctionId,
    pub touched_closures: &'a IndexSet<SmolStr>,
}

pub(crate) struct LoweredUnit {
    pub module: IrModule,
    pub root_symbol: SmolStr,
    pub exposed_args: Vec<ShaderArgument>,
}

#[derive(Clone, Debug)]
struct FieldLayout {
    name: SmolStr,
    ty: DataType,
    offset: u32,
}

#[derive(Clone, Debug)]
struct StructLayout {
    fields: Vec<FieldLayout>,
    size: u32,
    align: u32,
}

impl StructLayout {
    fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Clone)]
struct FnInfo {
    local: u32,
    params: Vec<DataType>,
    ret: DataType,
}

/// Resolved type of a value or variable.
#[derive(Clone, Debug, PartialEq, Eq)]
enum VTy {
    Base(DataType),
    Struct(SmolStr),
}

impl fmt::Display for VTy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VTy::Base(ty) => write!(f, "{}", ty),
            VTy::Struct(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Clone, Copy)]
enum Repr {
    /// A by-value scalar (including closure pointers).
    Value(Value),
    /// The address of an aggregate or struct.
    Addr(Value),
    /// Result of a void call.
    Void,
}

#[derive(Clone)]
struct RValue {
    ty: VTy,
    repr: Repr,
}

impl RValue {
    fn base(ty: DataType, value: Value) -> RValue {
        RValue {
            ty: VTy::Base(ty),
            repr: Repr::Value(value),
        }
    }

    fn addr(ty: VTy, addr: Value) -> RValue {
        RValue {
            ty,
            repr: Repr::Addr(addr),
        }
    }
}

#[derive(Clone, Copy)]
enum VarKind {
    Slot(StackSlot),
    /// An `out` argument passed by pointer.
    OutPtr(Value),
}

#[derive(Clone)]
struct VarBinding {
    kind: VarKind,
    ty: VTy,
}

#[derive(Clone, Copy)]
struct LoopTargets {
    continue_block: Block,
    break_block: Block,
}

struct Env<'a> {
    store: &'a AstStore,
    module: &'a IrModule,
    globals: &'a GlobalModule,
    structs: &'a HashMap<SmolStr, StructLayout>,
    global_consts: &'a HashMap<SmolStr, ShaderValue>,
    functions: &'a HashMap<SmolStr, FnInfo>,
    schemas: &'a HashMap<SmolStr, ClosureSchema>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Unit lowering driver
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) fn lower_unit(input: &CodegenInput, sink: &mut DiagnosticSink) -> Option<LoweredUnit> {
    let store = input.store;
    let mut module = IrModule::new(input.module_name);

    // runtime prototypes and the closure allocator
    input.globals.declare_prototypes(&mut module);
    module.declare(closure::CLOSURE_ALLOCATOR_SYMBOL, closure::allocator_signature());

    // constructors of every closure the shader touches
    let mut schemas: HashMap<SmolStr, ClosureSchema> = HashMap::new();
    for name in input.touched_closures {
        if let Some(schema) = input.registry.schema(name) {
            module.declare(
                closure::constructor_symbol(name),
                closure::constructor_signature(&schema.fields),
            );
            schemas.insert(name.clone(), schema);
        }
    }

    // structures
    let mut structs: HashMap<SmolStr, StructLayout> = HashMap::new();
    for &sid in input.structs {
        let decl = &store.structs[sid];
        if structs.contains_key(&decl.name) {
            sink.error(format!("duplicate structure `{}`", decl.name), Some(decl.span));
            continue;
        }
        if let Some(layout) = build_struct_layout(decl, sink) {
            structs.insert(decl.name.clone(), layout);
        }
    }

    // global parameters become named constants
    let mut global_consts: HashMap<SmolStr, ShaderValue> = HashMap::new();
    for &gid in input.global_params {
        let decl = &store.globals[gid];
        if let Some(value) = lower_global_param(store, decl, sink) {
            if global_consts.insert(decl.name.clone(), value).is_some() {
                sink.error(format!("duplicate global parameter `{}`", decl.name), Some(decl.span));
            }
        }
    }

    // pre-declare free function signatures so definition order is free
    let mut functions: HashMap<SmolStr, FnInfo> = HashMap::new();
    for &fid in input.functions {
        let decl = &store.functions[fid];
        if functions.contains_key(&decl.name) || input.globals.find(&decl.name).is_some() {
            sink.error(format!("duplicate function `{}`", decl.name), Some(decl.span));
            continue;
        }
        let mut params = Vec::with_capacity(decl.params.len());
        for param in &decl.params {
            match &param.ty {
                TypeSpec::Base(ty) if *ty != DataType::Void => params.push(*ty),
                other => {
                    sink.error(
                        format!("parameter `{}` of `{}` has unsupported type `{}`", param.name, decl.name, other),
                        Some(decl.span),
                    );
                }
            }
        }
        let ret = match &decl.ret {
            TypeSpec::Base(ty) if *ty == DataType::Void || ir::scalar_type(*ty).is_some() => *ty,
            other => {
                sink.error(
                    format!("function `{}` has unsupported return type `{}`", decl.name, other),
                    Some(decl.span),
                );
                DataType::Void
            }
        };
        let symbol = format!("{}::{}", input.module_name, decl.name);
        let local = module.declare(symbol, ir::function_signature(&params, ret));
        functions.insert(decl.name.clone(), FnInfo { local, params, ret });
    }

    // shader root interface
    let root_decl = &store.functions[input.root];
    if functions.contains_key(&root_decl.name) {
        sink.error(
            format!("shader entry `{}` collides with a function of the same name", root_decl.name),
            Some(root_decl.span),
        );
    }
    let exposed_args = build_exposed_arguments(store, root_decl, sink);
    let root_symbol = SmolStr::new(format!("{}::{}", input.module_name, root_decl.name));
    let root_local = module.declare(root_symbol.clone(), ir::unit_signature(&exposed_args));

    // a broken interface makes body lowering meaningless
    if sink.has_errors() {
        return None;
    }

    let env = Env {
        store,
        module: &module,
        globals: input.globals,
        structs: &structs,
        global_consts: &global_consts,
        functions: &functions,
        schemas: &schemas,
    };

    let mut fbc = FunctionBuilderContext::new();
    let mut bodies: Vec<(u32, Function)> = Vec::new();
    for &fid in input.functions {
        let decl = &store.functions[fid];
        let info = env.functions[&decl.name].clone();
        let body = lower_function(&env, &mut fbc, sink, decl, info.local, ir::function_signature(&info.params, info.ret), None);
        bodies.push((info.local, body));
    }
    let root_body = lower_function(
        &env,
        &mut fbc,
        sink,
        root_decl,
        root_local,
        ir::unit_signature(&exposed_args),
        Some(&exposed_args),
    );
    bodies.push((root_local, root_body));

    if sink.has_errors() {
        return None;
    }
    for (local, body) in bodies {
        module.define(local, body);
    }

    debug!(
        module = input.module_name,
        functions = input.functions.len() + 1,
        root = %root_symbol,
        "lowered shader unit"
    );
    Some(LoweredUnit {
        module,
        root_symbol,
        exposed_args,
    })
}

fn round_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

fn build_struct_layout(decl: &StructDecl, sink: &mut DiagnosticSink) -> Option<StructLayout> {
    let mut fields: Vec<FieldLayout> = Vec::new();
    let mut offset = 0u32;
    let mut align = 1u32;
    for (name, ty) in &decl.fields {
        let base = match ty {
            TypeSpec::Base(base) if *base != DataType::Void => *base,
            other => {
                sink.error(
                    format!("field `{}` of struct `{}` has unsupported type `{}`", name, decl.name, other),
                    Some(decl.span),
                );
                return None;
            }
        };
        if fields.iter().any(|f| &f.name == name) {
            sink.error(
                format!("duplicate field `{}` in struct `{}`", name, decl.name),
                Some(decl.span),
            );
            return None;
        }
        offset = round_up(offset, base.align());
        fields.push(FieldLayout {
            name: name.clone(),
            ty: base,
            offset,
        });
        offset += base.size();
        align = align.max(base.align());
    }
    if fields.is_empty() {
        sink.error(format!("struct `{}` has no fields", decl.name), Some(decl.span));
        return None;
    }
    Some(StructLayout {
        fields,
        size: round_up(offset, align),
        align,
    })
}

fn lower_global_param(store: &AstStore, decl: &GlobalDecl, sink: &mut DiagnosticSink) -> Option<ShaderValue> {
    let ty = match &decl.ty {
        TypeSpec::Base(ty) if *ty != DataType::Void && *ty != DataType::Closure => *ty,
        other => {
            sink.error(
                format!("global parameter `{}` has unsupported type `{}`", decl.name, other),
                Some(decl.span),
            );
            return None;
        }
    };
    let Some(init) = decl.init else {
        sink.error(
            format!("global parameter `{}` needs a literal initializer", decl.name),
            Some(decl.span),
        );
        return None;
    };
    let Some(value) = fold_literal(store, init) else {
        sink.error(
            format!("initializer of global parameter `{}` is not a literal", decl.name),
            Some(store.expr_span(init)),
        );
        return None;
    };
    match coerce_literal(value, ty) {
        Some(value) => Some(value),
        None => {
            sink.error(
                format!(
                    "initializer of global parameter `{}` has type `{}`, expected `{}`",
                    decl.name,
                    value.data_type(),
                    ty
                ),
                Some(store.expr_span(init)),
            );
            None
        }
    }
}

fn build_exposed_arguments(store: &AstStore, decl: &FunctionDecl, sink: &mut DiagnosticSink) -> Vec<ShaderArgument> {
    let mut args = Vec::with_capacity(decl.params.len());
    for param in &decl.params {
        let ty = match &param.ty {
            TypeSpec::Base(ty) if *ty != DataType::Void => *ty,
            other => {
                sink.error(
                    format!("shader argument `{}` has unsupported type `{}`", param.name, other),
                    Some(decl.span),
                );
                continue;
            }
        };
        let mut default = None;
        if let Some(init) = param.default {
            if param.direction == ArgDirection::Out {
                sink.error(
                    format!("default value on `out` argument `{}`", param.name),
                    Some(store.expr_span(init)),
                );
            } else {
                match fold_literal(store, init).and_then(|v| coerce_literal(v, ty)) {
                    Some(value) => default = Some(value),
                    None => sink.error(
                        format!("default of argument `{}` is not a `{}` literal", param.name, ty),
                        Some(store.expr_span(init)),
                    ),
                }
            }
        }
        if args.iter().any(|a: &ShaderArgument| a.name == param.name) {
            sink.error(format!("duplicate shader argument `{}`", param.name), Some(decl.span));
            continue;
        }
        args.push(ShaderArgument {
            name: param.name.clone(),
            ty,
            direction: param.direction,
            default,
        });
    }
    args
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Literal folding
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Folds an expression that must be a literal (argument defaults, global
/// parameters). Returns `None` for anything requiring evaluation.
pub(crate) fn fold_literal(store: &AstStore, id: ExprId) -> Option<ShaderValue> {
    match &store.exprs[id] {
        Expr::IntConst(v) => Some(ShaderValue::Int(*v as i32)),
        Expr::FloatConst(v) => Some(ShaderValue::Float(*v)),
        Expr::BoolConst(v) => Some(ShaderValue::Bool(*v)),
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
        } => match fold_literal(store, *operand)? {
            ShaderValue::Int(v) => Some(ShaderValue::Int(-v)),
            ShaderValue::Float(v) => Some(ShaderValue::Float(-v)),
            ShaderValue::Double(v) => Some(ShaderValue::Double(-v)),
            _ => None,
        },
        Expr::Construct { ty, args } => {
            let lanes = ty.lanes()? as usize;
            if args.len() != 1 && args.len() != lanes {
                return None;
            }
            let mut folded = Vec::with_capacity(args.len());
            for &arg in args.iter() {
                match fold_literal(store, arg)? {
                    ShaderValue::Float(v) => folded.push(v),
                    ShaderValue::Int(v) => folded.push(v as f32),
                    _ => return None,
                }
            }
            let mut data = [0.0f32; 16];
            for lane in 0..lanes {
                data[lane] = if folded.len() == 1 { folded[0] } else { folded[lane] };
            }
            match ty {
                DataType::Float3 => Some(ShaderValue::Float3([data[0], data[1], data[2]])),
                DataType::Float4 => Some(ShaderValue::Float4([data[0], data[1], data[2], data[3]])),
                DataType::Matrix => Some(ShaderValue::Matrix(data)),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Implicit conversion between literal values: `int -> float -> double`.
pub(crate) fn coerce_literal(value: ShaderValue, want: DataType) -> Option<ShaderValue> {
    if value.data_type() == want {
        return Some(value);
    }
    match (value, want) {
        (ShaderValue::Int(v), DataType::Float) => Some(ShaderValue::Float(v as f32)),
        (ShaderValue::Int(v), DataType::Double) => Some(ShaderValue::Double(v as f64)),
        (ShaderValue::Float(v), DataType::Double) => Some(ShaderValue::Double(v as f64)),
        _ => None,
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Function lowering
////////////////////////////////////////////////////////////////////////////////////////////////////

fn lower_function(
    env: &Env,
    fbc: &mut FunctionBuilderContext,
    sink: &mut DiagnosticSink,
    decl: &FunctionDecl,
    local: u32,
    signature: Signature,
    shader_args: Option<&[ShaderArgument]>,
) -> Function {
    let mut func = Function::with_name_signature(UserFuncName::user(0, local), signature);
    let ret = match &decl.ret {
        TypeSpec::Base(ty) => *ty,
        TypeSpec::Named(_) => DataType::Void,
    };
    let lowerer = Lowerer {
        env,
        sink,
        b: FunctionBuilder::new(&mut func, fbc),
        scopes: vec![],
        loops: vec![],
        func_refs: HashMap::new(),
        ret,
        terminated: false,
    };
    lowerer.run(decl, shader_args);
    func
}

struct Lowerer<'a, 'b> {
    env: &'a Env<'a>,
    sink: &'a mut DiagnosticSink,
    b: FunctionBuilder<'b>,
    scopes: Vec<HashMap<SmolStr, VarBinding>>,
    loops: Vec<LoopTargets>,
    func_refs: HashMap<u32, FuncRef>,
    ret: DataType,
    terminated: bool,
}

impl<'a, 'b> Lowerer<'a, 'b> {
    fn run(mut self, decl: &FunctionDecl, shader_args: Option<&[ShaderArgument]>) {
        let entry = self.b.create_block();
        self.b.append_block_params_for_function_params(entry);
        self.b.switch_to_block(entry);
        let params: Vec<Value> = self.b.block_params(entry).to_vec();

        self.scopes.push(HashMap::new());
        if let Some(args) = shader_args {
            for (i, arg) in args.iter().enumerate() {
                let binding = match arg.direction {
                    ArgDirection::Out => VarBinding {
                        kind: VarKind::OutPtr(params[i]),
                        ty: VTy::Base(arg.ty),
                    },
                    ArgDirection::In => {
                        let kind = self.spill_param(arg.ty, params[i]);
                        VarBinding {
                            kind,
                            ty: VTy::Base(arg.ty),
                        }
                    }
                };
                self.bind(&arg.name, binding, decl.span);
            }
            // the trailing tsl_global pointer is opaque to generated code
        } else {
            for (i, param) in decl.params.iter().enumerate() {
                let ty = match &param.ty {
                    TypeSpec::Base(ty) => *ty,
                    // rejected during pre-declaration
                    TypeSpec::Named(_) => continue,
                };
                let kind = self.spill_param(ty, params[i]);
                self.bind(
                    &param.name,
                    VarBinding {
                        kind,
                        ty: VTy::Base(ty),
                    },
                    decl.span,
                );
            }
        }

        self.lower_stmt(decl.body);

        if !self.terminated {
            if self.ret == DataType::Void {
                self.b.ins().return_(&[]);
            } else {
                self.sink
                    .error(format!("missing return in function `{}`", decl.name), Some(decl.span));
                let zero = self.zero_value(self.ret);
                self.b.ins().return_(&[zero]);
            }
        }
        self.b.seal_all_blocks();
        self.b.finalize();
    }

    /// Copies an incoming parameter into an addressable stack slot.
    fn spill_param(&mut self, ty: DataType, value: Value) -> VarKind {
        let slot = self.create_slot(ty.size(), ty.align());
        if ty.is_aggregate() {
            let dst = self.slot_addr(slot);
            self.emit_copy(dst, value, ty.size());
        } else {
            self.b.ins().stack_store(value, slot, 0);
        }
        VarKind::Slot(slot)
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Infrastructure
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn create_slot(&mut self, size: u32, align: u32) -> StackSlot {
        let shift = align.trailing_zeros() as u8;
        self.b
            .create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size.max(1), shift))
    }

    fn slot_addr(&mut self, slot: StackSlot) -> Value {
        self.b.ins().stack_addr(ir::pointer_type(), slot, 0)
    }

    fn bind(&mut self, name: &SmolStr, binding: VarBinding, span: Span) {
        let scope = match self.scopes.last_mut() {
            Some(scope) => scope,
            None => return,
        };
        if scope.insert(name.clone(), binding).is_some() {
            self.sink
                .error(format!("`{}` is already declared in this scope", name), Some(span));
        }
    }

    fn lookup(&self, name: &str) -> Option<VarBinding> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name).cloned())
    }

    fn func_ref(&mut self, local: u32) -> FuncRef {
        if let Some(&func_ref) = self.func_refs.get(&local) {
            return func_ref;
        }
        let signature = self.env.module.symbol(local).signature.clone();
        let sig_ref = self.b.func.import_signature(signature);
        let name_ref = self.b.func.declare_imported_user_function(UserExternalName {
            namespace: 0,
            index: local,
        });
        let func_ref = self.b.func.import_function(ExtFuncData {
            name: ExternalName::user(name_ref),
            signature: sig_ref,
            colocated: false,
            patchable: false,
        });
        self.func_refs.insert(local, func_ref);
        func_ref
    }

    fn call_local(&mut self, local: u32, args: &[Value]) -> Inst {
        let func_ref = self.func_ref(local);
        self.b.ins().call(func_ref, args)
    }

    fn zero_value(&mut self, ty: DataType) -> Value {
        match ty {
            DataType::Float => self.b.ins().f32const(0.0f32),
            DataType::Double => self.b.ins().f64const(0.0f64),
            DataType::Closure => self.b.ins().iconst(ir::pointer_type(), 0),
            DataType::Bool => self.b.ins().iconst(types::I8, 0),
            _ => self.b.ins().iconst(types::I32, 0),
        }
    }

    fn vty_size_align(&self, ty: &VTy) -> (u32, u32) {
        match ty {
            VTy::Base(base) => (base.size(), base.align()),
            VTy::Struct(name) => match self.env.structs.get(name) {
                Some(layout) => (layout.size, layout.align),
                None => (0, 1),
            },
        }
    }

    fn emit_copy(&mut self, dst: Value, src: Value, size: u32) {
        let flags = MemFlags::trusted();
        let mut offset = 0u32;
        while offset + 4 <= size {
            let word = self.b.ins().load(types::I32, flags, src, offset as i32);
            self.b.ins().store(flags, word, dst, offset as i32);
            offset += 4;
        }
        while offset < size {
            let byte = self.b.ins().load(types::I8, flags, src, offset as i32);
            self.b.ins().store(flags, byte, dst, offset as i32);
            offset += 1;
        }
    }

    fn materialize_value(&mut self, value: &ShaderValue) -> RValue {
        if let Some(lanes) = value.lanes() {
            let ty = value.data_type();
            let slot = self.create_slot(ty.size(), ty.align());
            for (i, lane) in lanes.iter().enumerate() {
                let v = self.b.ins().f32const(*lane);
                self.b.ins().stack_store(v, slot, (i * 4) as i32);
            }
            let addr = self.slot_addr(slot);
            RValue::addr(VTy::Base(ty), addr)
        } else {
            let (ty, v) = match *value {
                ShaderValue::Int(v) => (DataType::Int, self.b.ins().iconst(types::I32, v as i64)),
                ShaderValue::Float(v) => (DataType::Float, self.b.ins().f32const(v)),
                ShaderValue::Double(v) => (DataType::Double, self.b.ins().f64const(v)),
                ShaderValue::Bool(v) => (DataType::Bool, self.b.ins().iconst(types::I8, v as i64)),
                _ => unreachable!("composite handled above"),
            };
            RValue::base(ty, v)
        }
    }

    fn resolve_vty(&mut self, ty: &TypeSpec, span: Span) -> Option<VTy> {
        match ty {
            TypeSpec::Base(DataType::Void) => {
                self.sink.error("cannot declare a variable of type `void`", Some(span));
                None
            }
            TypeSpec::Base(base) => Some(VTy::Base(*base)),
            TypeSpec::Named(name) => {
                if self.env.structs.contains_key(name) {
                    Some(VTy::Struct(name.clone()))
                } else {
                    self.sink.error(format!("unknown type `{}`", name), Some(span));
                    None
                }
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Conversions
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn numeric_rank(ty: DataType) -> Option<u8> {
        match ty {
            DataType::Int => Some(0),
            DataType::Float => Some(1),
            DataType::Double => Some(2),
            _ => None,
        }
    }

    fn promote_scalar(&mut self, value: Value, from: DataType, to: DataType) -> Value {
        match (from, to) {
            (DataType::Int, DataType::Float) => self.b.ins().fcvt_from_sint(types::F32, value),
            (DataType::Int, DataType::Double) => self.b.ins().fcvt_from_sint(types::F64, value),
            (DataType::Float, DataType::Double) => self.b.ins().fpromote(types::F64, value),
            _ => value,
        }
    }

    /// Converts an r-value to the ABI value of type `want`: scalars by value
    /// with numeric promotion, aggregates by address.
    fn coerce_to(&mut self, rv: &RValue, want: DataType, span: Span, what: &str) -> Option<Value> {
        match (&rv.ty, rv.repr) {
            (VTy::Base(from), Repr::Value(v)) if *from == want => Some(v),
            (VTy::Base(from), Repr::Addr(a)) if *from == want => Some(a),
            (VTy::Base(from), Repr::Value(v)) => {
                match (Self::numeric_rank(*from), Self::numeric_rank(want)) {
                    (Some(fr), Some(wr)) if fr < wr => Some(self.promote_scalar(v, *from, want)),
                    _ => {
                        self.sink.error(
                            format!("{}: expected `{}`, found `{}`", what, want, from),
                            Some(span),
                        );
                        None
                    }
                }
            }
            _ => {
                self.sink.error(
                    format!("{}: expected `{}`, found `{}`", what, want, rv.ty),
                    Some(span),
                );
                None
            }
        }
    }

    fn expect_bool(&mut self, rv: &RValue, span: Span, what: &str) -> Option<Value> {
        match (&rv.ty, rv.repr) {
            (VTy::Base(DataType::Bool), Repr::Value(v)) => Some(v),
            _ => {
                self.sink
                    .error(format!("{} must be `bool`, found `{}`", what, rv.ty), Some(span));
                None
            }
        }
    }

    fn addr_of(&mut self, rv: &RValue, span: Span) -> Option<Value> {
        match rv.repr {
            Repr::Addr(addr) => Some(addr),
            _ => {
                self.sink.error("expected an addressable value", Some(span));
                None
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Statements
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn lower_stmt(&mut self, id: StmtId) {
        if self.terminated {
            // dead code after a terminator is silently dropped
            return;
        }
        let store = self.env.store;
        let span = store.stmt_span(id);
        match &store.stmts[id] {
            Stmt::Block(stmts) => {
                self.scopes.push(HashMap::new());
                for &stmt in stmts {
                    self.lower_stmt(stmt);
                }
                self.scopes.pop();
            }
            Stmt::Decl { name, ty, init } => {
                let Some(vty) = self.resolve_vty(ty, span) else { return };
                let (size, align) = self.vty_size_align(&vty);
                let slot = self.create_slot(size, align);
                if let Some(init) = *init {
                    if let Some(rv) = self.lower_expr(init) {
                        let addr = self.slot_addr(slot);
                        self.store_into(addr, &vty, &rv, store.expr_span(init));
                    }
                }
                self.bind(
                    name,
                    VarBinding {
                        kind: VarKind::Slot(slot),
                        ty: vty,
                    },
                    span,
                );
            }
            Stmt::Assign { place, value } => {
                let target = self.lower_place(*place);
                let rv = self.lower_expr(*value);
                if let (Some((addr, ty)), Some(rv)) = (target, rv) {
                    self.store_into(addr, &ty, &rv, span);
                }
            }
            Stmt::Expr(expr) => {
                let _ = self.lower_expr(*expr);
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => self.lower_if(*cond, *then_branch, *else_branch),
            Stmt::While { cond, body } => self.lower_while(*cond, *body),
            Stmt::For { init, cond, step, body } => self.lower_for(*init, *cond, *step, *body),
            Stmt::Return(value) => self.lower_return(*value, span),
            Stmt::Break => match self.loops.last().copied() {
                Some(targets) => {
                    self.b.ins().jump(targets.break_block, &[]);
                    self.terminated = true;
                }
                None => self.sink.error("`break` outside of a loop", Some(span)),
            },
            Stmt::Continue => match self.loops.last().copied() {
                Some(targets) => {
                    self.b.ins().jump(targets.continue_block, &[]);
                    self.terminated = true;
                }
                None => self.sink.error("`continue` outside of a loop", Some(span)),
            },
        }
    }

    fn lower_condition(&mut self, cond: ExprId) -> Value {
        let span = self.env.store.expr_span(cond);
        let value = self
            .lower_expr(cond)
            .and_then(|rv| self.expect_bool(&rv, span, "condition"));
        // keep the CFG well-formed even when the condition failed to lower
        value.unwrap_or_else(|| self.b.ins().iconst(types::I8, 0))
    }

    fn lower_if(&mut self, cond: ExprId, then_branch: StmtId, else_branch: Option<StmtId>) {
        let cond_v = self.lower_condition(cond);
        let then_block = self.b.create_block();
        let mut merge: Option<Block> = None;

        if let Some(else_id) = else_branch {
            let else_block = self.b.create_block();
            self.b.ins().brif(cond_v, then_block, &[], else_block, &[]);

            self.b.switch_to_block(then_block);
            self.terminated = false;
            self.lower_stmt(then_branch);
            if !self.terminated {
                let m = *merge.get_or_insert_with(|| self.b.create_block());
                self.b.ins().jump(m, &[]);
            }

            self.b.switch_to_block(else_block);
            self.terminated = false;
            self.lower_stmt(else_id);
            if !self.terminated {
                let m = *merge.get_or_insert_with(|| self.b.create_block());
                self.b.ins().jump(m, &[]);
            }
        } else {
            let m = self.b.create_block();
            merge = Some(m);
            self.b.ins().brif(cond_v, then_block, &[], m, &[]);

            self.b.switch_to_block(then_block);
            self.terminated = false;
            self.lower_stmt(then_branch);
            if !self.terminated {
                self.b.ins().jump(m, &[]);
            }
        }

        match merge {
            Some(m) => {
                self.b.switch_to_block(m);
                self.terminated = false;
            }
            // both branches terminated
            None => self.terminated = true,
        }
    }

    fn lower_while(&mut self, cond: ExprId, body: StmtId) {
        let header = self.b.create_block();
        let body_block = self.b.create_block();
        let exit = self.b.create_block();

        self.b.ins().jump(header, &[]);
        self.b.switch_to_block(header);
        let cond_v = self.lower_condition(cond);
        self.b.ins().brif(cond_v, body_block, &[], exit, &[]);

        self.b.switch_to_block(body_block);
        self.loops.push(LoopTargets {
            continue_block: header,
            break_block: exit,
        });
        self.terminated = false;
        self.lower_stmt(body);
        self.loops.pop();
        if !self.terminated {
            self.b.ins().jump(header, &[]);
        }

        self.b.switch_to_block(exit);
        self.terminated = false;
    }

    fn lower_for(&mut self, init: Option<StmtId>, cond: Option<ExprId>, step: Option<StmtId>, body: StmtId) {
        self.scopes.push(HashMap::new());
        if let Some(init) = init {
            self.lower_stmt(init);
        }

        let header = self.b.create_block();
        let body_block = self.b.create_block();
        let step_block = self.b.create_block();
        let exit = self.b.create_block();

        self.b.ins().jump(header, &[]);
        self.b.switch_to_block(header);
        let cond_v = match cond {
            Some(cond) => self.lower_condition(cond),
            None => self.b.ins().iconst(types::I8, 1),
        };
        self.b.ins().brif(cond_v, body_block, &[], exit, &[]);

        self.b.switch_to_block(body_block);
        self.loops.push(LoopTargets {
            continue_block: step_block,
            break_block: exit,
        });
        self.terminated = false;
        self.lower_stmt(body);
        self.loops.pop();
        if !self.terminated {
            self.b.ins().jump(step_block, &[]);
        }

        self.b.switch_to_block(step_block);
        self.terminated = false;
        if let Some(step) = step {
            self.lower_stmt(step);
        }
        self.b.ins().jump(header, &[]);

        self.b.switch_to_block(exit);
        self.terminated = false;
        self.scopes.pop();
    }

    fn lower_return(&mut self, value: Option<ExprId>, span: Span) {
        match (self.ret, value) {
            (DataType::Void, None) => {
                self.b.ins().return_(&[]);
            }
            (DataType::Void, Some(_)) => {
                self.sink.error("cannot return a value from a void function", Some(span));
                self.b.ins().return_(&[]);
            }
            (ret, Some(expr)) => {
                let expr_span = self.env.store.expr_span(expr);
                let value = self
                    .lower_expr(expr)
                    .and_then(|rv| self.coerce_to(&rv, ret, expr_span, "return value"));
                let value = value.unwrap_or_else(|| self.zero_value(ret));
                self.b.ins().return_(&[value]);
            }
            (ret, None) => {
                self.sink
                    .error(format!("missing return value of type `{}`", ret), Some(span));
                let zero = self.zero_value(ret);
                self.b.ins().return_(&[zero]);
            }
        }
        self.terminated = true;
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Places
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn lower_place(&mut self, id: ExprId) -> Option<(Value, VTy)> {
        let store = self.env.store;
        let span = store.expr_span(id);
        match &store.exprs[id] {
            Expr::Ident(name) => {
                if let Some(binding) = self.lookup(name) {
                    let addr = match binding.kind {
                        VarKind::Slot(slot) => self.slot_addr(slot),
                        VarKind::OutPtr(ptr) => ptr,
                    };
                    Some((addr, binding.ty))
                } else if self.env.global_consts.contains_key(name.as_str()) {
                    self.sink
                        .error(format!("cannot assign to global parameter `{}`", name), Some(span));
                    None
                } else {
                    self.sink.error(format!("unknown symbol `{}`", name), Some(span));
                    None
                }
            }
            Expr::Field { base, field } => {
                let (base_addr, base_ty) = self.lower_place(*base)?;
                let (offset, field_ty) = self.field_offset(&base_ty, field, span)?;
                let addr = if offset == 0 {
                    base_addr
                } else {
                    self.b.ins().iadd_imm(base_addr, offset as i64)
                };
                Some((addr, field_ty))
            }
            _ => {
                self.sink.error("expression is not assignable", Some(span));
                None
            }
        }
    }

    fn field_offset(&mut self, base: &VTy, field: &str, span: Span) -> Option<(u32, VTy)> {
        match base {
            VTy::Base(ty) if ty.is_vector() => {
                let lanes = ty.lanes().unwrap_or(0);
                let lane = match field {
                    "x" => 0,
                    "y" => 1,
                    "z" => 2,
                    "w" => 3,
                    _ => {
                        self.sink.error(
                            format!("unsupported swizzle `.{}` on `{}`", field, base),
                            Some(span),
                        );
                        return None;
                    }
                };
                if lane >= lanes {
                    self.sink
                        .error(format!("component `.{}` out of range for `{}`", field, base), Some(span));
                    return None;
                }
                Some((lane * 4, VTy::Base(DataType::Float)))
            }
            VTy::Struct(name) => {
                let layout = self.env.structs.get(name)?;
                match layout.field(field) {
                    Some(f) => Some((f.offset, VTy::Base(f.ty))),
                    None => {
                        self.sink
                            .error(format!("struct `{}` has no field `{}`", name, field), Some(span));
                        None
                    }
                }
            }
            _ => {
                self.sink
                    .error(format!("type `{}` has no field `{}`", base, field), Some(span));
                None
            }
        }
    }

    fn store_into(&mut self, addr: Value, ty: &VTy, rv: &RValue, span: Span) {
        let flags = MemFlags::trusted();
        match ty {
            VTy::Base(base) if !base.is_aggregate() => {
                if let Some(value) = self.coerce_to(rv, *base, span, "assignment") {
                    self.b.ins().store(flags, value, addr, 0);
                }
            }
            _ => {
                if &rv.ty != ty {
                    self.sink.error(
                        format!("assignment: expected `{}`, found `{}`", ty, rv.ty),
                        Some(span),
                    );
                    return;
                }
                let (size, _) = self.vty_size_align(ty);
                if let Some(src) = self.addr_of(rv, span) {
                    self.emit_copy(addr, src, size);
                }
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Expressions
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn lower_expr(&mut self, id: ExprId) -> Option<RValue> {
        let store = self.env.store;
        let span = store.expr_span(id);
        match &store.exprs[id] {
            Expr::IntConst(v) => {
                let value = self.b.ins().iconst(types::I32, *v as i32 as i64);
                Some(RValue::base(DataType::Int, value))
            }
            Expr::FloatConst(v) => {
                let value = self.b.ins().f32const(*v);
                Some(RValue::base(DataType::Float, value))
            }
            Expr::BoolConst(v) => {
                let value = self.b.ins().iconst(types::I8, *v as i64);
                Some(RValue::base(DataType::Bool, value))
            }
            Expr::Ident(name) => {
                if let Some(binding) = self.lookup(name) {
                    Some(self.read_binding(&binding))
                } else if let Some(value) = self.env.global_consts.get(name.as_str()).copied() {
                    Some(self.materialize_value(&value))
                } else {
                    self.sink.error(format!("unknown symbol `{}`", name), Some(span));
                    None
                }
            }
            Expr::Unary { op, operand } => {
                let operand = *operand;
                let op = *op;
                let rv = self.lower_expr(operand)?;
                self.lower_unary(op, rv, span)
            }
            Expr::Binary { op, left, right } => {
                let (op, left, right) = (*op, *left, *right);
                self.lower_binary(op, left, right, span)
            }
            Expr::Call { callee, args } => {
                let callee = callee.clone();
                let args = args.clone();
                self.lower_call(&callee, &args, span)
            }
            Expr::MakeClosure { closure, args } => {
                let closure = closure.clone();
                let args = args.clone();
                self.lower_make_closure(&closure, &args, span)
            }
            Expr::Construct { ty, args } => {
                let ty = *ty;
                let args = args.clone();
                self.lower_construct(ty, &args, span)
            }
            Expr::Field { base, field } => {
                let base = *base;
                let field = field.clone();
                let base_rv = self.lower_expr(base)?;
                self.lower_field(&base_rv, &field, span)
            }
        }
    }

    fn read_binding(&mut self, binding: &VarBinding) -> RValue {
        match (&binding.ty, binding.kind) {
            (VTy::Base(base), VarKind::Slot(slot)) if !base.is_aggregate() => {
                let cl_ty = ir::scalar_type(*base).expect("scalar type");
                let value = self.b.ins().stack_load(cl_ty, slot, 0);
                RValue::base(*base, value)
            }
            (VTy::Base(base), VarKind::OutPtr(ptr)) if !base.is_aggregate() => {
                let cl_ty = ir::scalar_type(*base).expect("scalar type");
                let value = self.b.ins().load(cl_ty, MemFlags::trusted(), ptr, 0);
                RValue::base(*base, value)
            }
            (ty, VarKind::Slot(slot)) => {
                let addr = self.slot_addr(slot);
                RValue::addr(ty.clone(), addr)
            }
            (ty, VarKind::OutPtr(ptr)) => RValue::addr(ty.clone(), ptr),
        }
    }

    fn lower_unary(&mut self, op: UnaryOp, rv: RValue, span: Span) -> Option<RValue> {
        match op {
            UnaryOp::Not => {
                let value = self.expect_bool(&rv, span, "operand of `!`")?;
                let negated = self.b.ins().icmp_imm(IntCC::Equal, value, 0);
                Some(RValue::base(DataType::Bool, negated))
            }
            UnaryOp::Neg => match (&rv.ty, rv.repr) {
                (VTy::Base(DataType::Int), Repr::Value(v)) => {
                    let value = self.b.ins().ineg(v);
                    Some(RValue::base(DataType::Int, value))
                }
                (VTy::Base(DataType::Float), Repr::Value(v)) => {
                    let value = self.b.ins().fneg(v);
                    Some(RValue::base(DataType::Float, value))
                }
                (VTy::Base(DataType::Double), Repr::Value(v)) => {
                    let value = self.b.ins().fneg(v);
                    Some(RValue::base(DataType::Double, value))
                }
                (VTy::Base(ty), Repr::Addr(addr)) if ty.is_vector() => {
                    let ty = *ty;
                    let lanes = ty.lanes().unwrap_or(0);
                    let slot = self.create_slot(ty.size(), ty.align());
                    let flags = MemFlags::trusted();
                    for lane in 0..lanes {
                        let offset = (lane * 4) as i32;
                        let v = self.b.ins().load(types::F32, flags, addr, offset);
                        let neg = self.b.ins().fneg(v);
                        self.b.ins().stack_store(neg, slot, offset);
                    }
                    let out = self.slot_addr(slot);
                    Some(RValue::addr(VTy::Base(ty), out))
                }
                _ => {
                    self.sink
                        .error(format!("cannot negate a value of type `{}`", rv.ty), Some(span));
                    None
                }
            },
        }
    }

    fn lower_binary(&mut self, op: BinaryOp, left: ExprId, right: ExprId, span: Span) -> Option<RValue> {
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            return self.lower_logical(op, left, right);
        }

        let l = self.lower_expr(left)?;
        let r = self.lower_expr(right)?;

        // closure algebra: `closure + closure`, `weight * closure`
        let l_is_closure = l.ty == VTy::Base(DataType::Closure);
        let r_is_closure = r.ty == VTy::Base(DataType::Closure);
        if l_is_closure || r_is_closure {
            return self.lower_closure_op(op, l, r, span);
        }

        // componentwise vector arithmetic and scalar scaling
        if let (VTy::Base(lt), VTy::Base(rt)) = (&l.ty, &r.ty) {
            let (lt, rt) = (*lt, *rt);
            if lt.is_vector() || rt.is_vector() {
                return self.lower_vector_op(op, lt, rt, l, r, span);
            }
        }

        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                self.lower_arith(op, l, r, span)
            }
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                self.lower_compare(op, l, r, span)
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    fn common_numeric(&mut self, l: &RValue, r: &RValue, span: Span, op: BinaryOp) -> Option<(DataType, Value, Value)> {
        let (lt, rt) = match (&l.ty, &r.ty) {
            (VTy::Base(lt), VTy::Base(rt)) => (*lt, *rt),
            _ => {
                self.type_mismatch(op, l, r, span);
                return None;
            }
        };
        let (lv, rv) = match (l.repr, r.repr) {
            (Repr::Value(lv), Repr::Value(rv)) => (lv, rv),
            _ => {
                self.type_mismatch(op, l, r, span);
                return None;
            }
        };
        match (Self::numeric_rank(lt), Self::numeric_rank(rt)) {
            (Some(lr), Some(rr)) => {
                let common = if lr >= rr { lt } else { rt };
                let lv = self.promote_scalar(lv, lt, common);
                let rv = self.promote_scalar(rv, rt, common);
                Some((common, lv, rv))
            }
            _ => {
                self.type_mismatch(op, l, r, span);
                None
            }
        }
    }

    fn type_mismatch(&mut self, op: BinaryOp, l: &RValue, r: &RValue, span: Span) {
        self.sink.error(
            format!(
                "operator `{}` cannot be applied to `{}` and `{}`",
                op_str(op),
                l.ty,
                r.ty
            ),
            Some(span),
        );
    }

    fn lower_arith(&mut self, op: BinaryOp, l: RValue, r: RValue, span: Span) -> Option<RValue> {
        if op == BinaryOp::Rem {
            match (&l.ty, &r.ty, l.repr, r.repr) {
                (VTy::Base(DataType::Int), VTy::Base(DataType::Int), Repr::Value(lv), Repr::Value(rv)) => {
                    let value = self.b.ins().srem(lv, rv);
                    return Some(RValue::base(DataType::Int, value));
                }
                _ => {
                    self.sink
                        .error("operator `%` is only defined for `int` operands", Some(span));
                    return None;
                }
            }
        }
        let (ty, lv, rv) = self.common_numeric(&l, &r, span, op)?;
        let value = if ty == DataType::Int {
            match op {
                BinaryOp::Add => self.b.ins().iadd(lv, rv),
                BinaryOp::Sub => self.b.ins().isub(lv, rv),
                BinaryOp::Mul => self.b.ins().imul(lv, rv),
                BinaryOp::Div => self.b.ins().sdiv(lv, rv),
                _ => unreachable!(),
            }
        } else {
            match op {
                BinaryOp::Add => self.b.ins().fadd(lv, rv),
                BinaryOp::Sub => self.b.ins().fsub(lv, rv),
                BinaryOp::Mul => self.b.ins().fmul(lv, rv),
                BinaryOp::Div => self.b.ins().fdiv(lv, rv),
                _ => unreachable!(),
            }
        };
        Some(RValue::base(ty, value))
    }

    fn lower_compare(&mut self, op: BinaryOp, l: RValue, r: RValue, span: Span) -> Option<RValue> {
        // bool equality
        if matches!(op, BinaryOp::Eq | BinaryOp::Ne)
            && l.ty == VTy::Base(DataType::Bool)
            && r.ty == VTy::Base(DataType::Bool)
        {
            if let (Repr::Value(lv), Repr::Value(rv)) = (l.repr, r.repr) {
                let cc = if op == BinaryOp::Eq { IntCC::Equal } else { IntCC::NotEqual };
                let value = self.b.ins().icmp(cc, lv, rv);
                return Some(RValue::base(DataType::Bool, value));
            }
        }
        let (ty, lv, rv) = self.common_numeric(&l, &r, span, op)?;
        let value = if ty == DataType::Int {
            let cc = match op {
                BinaryOp::Eq => IntCC::Equal,
                BinaryOp::Ne => IntCC::NotEqual,
                BinaryOp::Lt => IntCC::SignedLessThan,
                BinaryOp::Le => IntCC::SignedLessThanOrEqual,
                BinaryOp::Gt => IntCC::SignedGreaterThan,
                BinaryOp::Ge => IntCC::SignedGreaterThanOrEqual,
                _ => unreachable!(),
            };
            self.b.ins().icmp(cc, lv, rv)
        } else {
            let cc = match op {
                BinaryOp::Eq => FloatCC::Equal,
                BinaryOp::Ne => FloatCC::NotEqual,
                BinaryOp::Lt => FloatCC::LessThan,
                BinaryOp::Le => FloatCC::LessThanOrEqual,
                BinaryOp::Gt => FloatCC::GreaterThan,
                BinaryOp::Ge => FloatCC::GreaterThanOrEqual,
                _ => unreachable!(),
            };
            self.b.ins().fcmp(cc, lv, rv)
        };
        Some(RValue::base(DataType::Bool, value))
    }

    fn lower_logical(&mut self, op: BinaryOp, left: ExprId, right: ExprId) -> Option<RValue> {
        let left_span = self.env.store.expr_span(left);
        let l = self.lower_expr(left)?;
        let lv = self.expect_bool(&l, left_span, "operand of a logical operator")?;

        let slot = self.create_slot(1, 1);
        self.b.ins().stack_store(lv, slot, 0);

        let rhs_block = self.b.create_block();
        let merge = self.b.create_block();
        match op {
            BinaryOp::And => self.b.ins().brif(lv, rhs_block, &[], merge, &[]),
            BinaryOp::Or => self.b.ins().brif(lv, merge, &[], rhs_block, &[]),
            _ => unreachable!(),
        };

        self.b.switch_to_block(rhs_block);
        let right_span = self.env.store.expr_span(right);
        if let Some(rv) = self.lower_expr(right) {
            if let Some(rv) = self.expect_bool(&rv, right_span, "operand of a logical operator") {
                self.b.ins().stack_store(rv, slot, 0);
            }
        }
        self.b.ins().jump(merge, &[]);

        self.b.switch_to_block(merge);
        let out = self.b.ins().stack_load(types::I8, slot, 0);
        Some(RValue::base(DataType::Bool, out))
    }

    fn lower_vector_op(
        &mut self,
        op: BinaryOp,
        lt: DataType,
        rt: DataType,
        l: RValue,
        r: RValue,
        span: Span,
    ) -> Option<RValue> {
        let arith = matches!(op, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div);
        if !arith {
            self.type_mismatch(op, &l, &r, span);
            return None;
        }
        let flags = MemFlags::trusted();
        // componentwise between equal vector types
        if lt == rt && lt.is_vector() {
            let lanes = lt.lanes().unwrap_or(0);
            let la = self.addr_of(&l, span)?;
            let ra = self.addr_of(&r, span)?;
            let slot = self.create_slot(lt.size(), lt.align());
            for lane in 0..lanes {
                let offset = (lane * 4) as i32;
                let a = self.b.ins().load(types::F32, flags, la, offset);
                let b = self.b.ins().load(types::F32, flags, ra, offset);
                let v = self.apply_float_op(op, a, b);
                self.b.ins().stack_store(v, slot, offset);
            }
            let out = self.slot_addr(slot);
            return Some(RValue::addr(VTy::Base(lt), out));
        }
        // vector * scalar, vector / scalar, scalar * vector
        let (vec_ty, vec_rv, scalar_rv, scalar_on_left) = if lt.is_vector() {
            (lt, l.clone(), r.clone(), false)
        } else {
            (rt, r.clone(), l.clone(), true)
        };
        if scalar_on_left && op != BinaryOp::Mul {
            self.type_mismatch(op, &l, &r, span);
            return None;
        }
        if !matches!(op, BinaryOp::Mul | BinaryOp::Div) {
            self.type_mismatch(op, &l, &r, span);
            return None;
        }
        let scalar = self.coerce_to(&scalar_rv, DataType::Float, span, "vector scale factor")?;
        let addr = self.addr_of(&vec_rv, span)?;
        let lanes = vec_ty.lanes().unwrap_or(0);
        let slot = self.create_slot(vec_ty.size(), vec_ty.align());
        for lane in 0..lanes {
            let offset = (lane * 4) as i32;
            let a = self.b.ins().load(types::F32, flags, addr, offset);
            let v = match op {
                BinaryOp::Mul => self.b.ins().fmul(a, scalar),
                BinaryOp::Div => self.b.ins().fdiv(a, scalar),
                _ => unreachable!(),
            };
            self.b.ins().stack_store(v, slot, offset);
        }
        let out = self.slot_addr(slot);
        Some(RValue::addr(VTy::Base(vec_ty), out))
    }

    fn apply_float_op(&mut self, op: BinaryOp, a: Value, b: Value) -> Value {
        match op {
            BinaryOp::Add => self.b.ins().fadd(a, b),
            BinaryOp::Sub => self.b.ins().fsub(a, b),
            BinaryOp::Mul => self.b.ins().fmul(a, b),
            BinaryOp::Div => self.b.ins().fdiv(a, b),
            _ => unreachable!(),
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Closure trees
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn allocate_closure_node(&mut self, size: u32) -> Value {
        let local = self
            .env
            .module
            .lookup(closure::CLOSURE_ALLOCATOR_SYMBOL)
            .expect("closure allocator is always declared");
        let size_v = self.b.ins().iconst(types::I32, size as i64);
        let inst = self.call_local(local, &[size_v]);
        self.b.inst_results(inst)[0]
    }

    fn lower_closure_op(&mut self, op: BinaryOp, l: RValue, r: RValue, span: Span) -> Option<RValue> {
        let flags = MemFlags::trusted();
        let l_is_closure = l.ty == VTy::Base(DataType::Closure);
        let r_is_closure = r.ty == VTy::Base(DataType::Closure);
        match op {
            BinaryOp::Add if l_is_closure && r_is_closure => {
                let (Repr::Value(lv), Repr::Value(rv)) = (l.repr, r.repr) else {
                    self.type_mismatch(op, &l, &r, span);
                    return None;
                };
                let node = self.allocate_closure_node(closure::ADD_NODE_SIZE);
                let id = self.b.ins().iconst(types::I32, closure::CLOSURE_ADD as i64);
                self.b.ins().store(flags, id, node, 0);
                self.b.ins().store(flags, lv, node, closure::ADD_LEFT_OFFSET);
                self.b.ins().store(flags, rv, node, closure::ADD_RIGHT_OFFSET);
                Some(RValue::base(DataType::Closure, node))
            }
            BinaryOp::Mul if l_is_closure != r_is_closure => {
                let (child_rv, weight_rv) = if l_is_closure { (l, r) } else { (r, l) };
                let Repr::Value(child) = child_rv.repr else {
                    self.sink.error("invalid closure operand", Some(span));
                    return None;
                };
                let weight = self.coerce_to(&weight_rv, DataType::Float, span, "closure weight")?;
                let node = self.allocate_closure_node(closure::MUL_NODE_SIZE);
                let id = self.b.ins().iconst(types::I32, closure::CLOSURE_MUL as i64);
                self.b.ins().store(flags, id, node, 0);
                self.b.ins().store(flags, weight, node, closure::MUL_WEIGHT_OFFSET);
                self.b.ins().store(flags, child, node, closure::MUL_CHILD_OFFSET);
                Some(RValue::base(DataType::Closure, node))
            }
            _ => {
                self.sink.error(
                    format!(
                        "operator `{}` is not defined for closures (`{}` and `{}`)",
                        op_str(op),
                        l.ty,
                        r.ty
                    ),
                    Some(span),
                );
                None
            }
        }
    }

    fn lower_make_closure(&mut self, name: &SmolStr, args: &[ExprId], span: Span) -> Option<RValue> {
        let Some(schema) = self.env.schemas.get(name).cloned() else {
            self.sink
                .error(format!("closure `{}` was never registered", name), Some(span));
            return None;
        };
        if args.len() != schema.fields.len() {
            self.sink.error(
                format!(
                    "closure `{}` takes {} arguments, {} given",
                    name,
                    schema.fields.len(),
                    args.len()
                ),
                Some(span),
            );
            return None;
        }
        let mut values = Vec::with_capacity(args.len());
        for (&arg, field) in args.iter().zip(&schema.fields) {
            let arg_span = self.env.store.expr_span(arg);
            let rv = self.lower_expr(arg)?;
            values.push(self.coerce_to(&rv, field.ty, arg_span, &format!("closure field `{}`", field.name))?);
        }
        let local = self
            .env
            .module
            .lookup(&closure::constructor_symbol(name))
            .expect("constructors of touched closures are declared");
        let inst = self.call_local(local, &values);
        let node = self.b.inst_results(inst)[0];
        Some(RValue::base(DataType::Closure, node))
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Calls, constructors, fields
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn lower_call(&mut self, callee: &SmolStr, args: &[ExprId], span: Span) -> Option<RValue> {
        // user functions shadow builtins
        let (local, params, ret) = if let Some(info) = self.env.functions.get(callee).cloned() {
            (info.local, info.params, info.ret)
        } else if let Some(builtin) = self.env.globals.find(callee) {
            let local = self
                .env
                .module
                .lookup(builtin.symbol)
                .expect("builtin prototypes are declared");
            (local, builtin.params.to_vec(), builtin.ret)
        } else {
            self.sink.error(format!("unknown function `{}`", callee), Some(span));
            return None;
        };

        if args.len() != params.len() {
            self.sink.error(
                format!("function `{}` takes {} arguments, {} given", callee, params.len(), args.len()),
                Some(span),
            );
            return None;
        }
        let mut values = Vec::with_capacity(args.len());
        for (&arg, &param) in args.iter().zip(params.iter()) {
            let arg_span = self.env.store.expr_span(arg);
            let rv = self.lower_expr(arg)?;
            values.push(self.coerce_to(&rv, param, arg_span, &format!("argument of `{}`", callee))?);
        }
        let inst = self.call_local(local, &values);
        if ret == DataType::Void {
            Some(RValue {
                ty: VTy::Base(DataType::Void),
                repr: Repr::Void,
            })
        } else {
            let value = self.b.inst_results(inst)[0];
            Some(RValue::base(ret, value))
        }
    }

    fn lower_construct(&mut self, ty: DataType, args: &[ExprId], span: Span) -> Option<RValue> {
        let lanes = match ty.lanes() {
            Some(lanes) => lanes as usize,
            None => {
                self.sink.error(format!("`{}` is not constructible", ty), Some(span));
                return None;
            }
        };
        if args.len() != 1 && args.len() != lanes {
            self.sink.error(
                format!("`{}` constructor takes 1 or {} arguments, {} given", ty, lanes, args.len()),
                Some(span),
            );
            return None;
        }
        let mut values = Vec::with_capacity(args.len());
        for &arg in args {
            let arg_span = self.env.store.expr_span(arg);
            let rv = self.lower_expr(arg)?;
            values.push(self.coerce_to(&rv, DataType::Float, arg_span, "constructor argument")?);
        }
        let slot = self.create_slot(ty.size(), ty.align());
        for lane in 0..lanes {
            let value = if values.len() == 1 { values[0] } else { values[lane] };
            self.b.ins().stack_store(value, slot, (lane * 4) as i32);
        }
        let addr = self.slot_addr(slot);
        Some(RValue::addr(VTy::Base(ty), addr))
    }

    fn lower_field(&mut self, base: &RValue, field: &str, span: Span) -> Option<RValue> {
        let (offset, field_ty) = self.field_offset(&base.ty.clone(), field, span)?;
        let addr = self.addr_of(base, span)?;
        match field_ty {
            VTy::Base(ty) if !ty.is_aggregate() => {
                let cl_ty = ir::scalar_type(ty).expect("scalar type");
                let value = self.b.ins().load(cl_ty, MemFlags::trusted(), addr, offset as i32);
                Some(RValue::base(ty, value))
            }
            ty => {
                let field_addr = if offset == 0 {
                    addr
                } else {
                    self.b.ins().iadd_imm(addr, offset as i64)
                };
                Some(RValue::addr(ty, field_addr))
            }
        }
    }
}

fn op_str(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
        BinaryOp::Eq => "==",
        BinaryOp::Ne => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::And => "&&",
        BinaryOp::Or => "||",
    }
}
