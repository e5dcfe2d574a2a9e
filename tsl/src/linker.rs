//! Shader-group linking.
//!
//! Lowers a group template into a wrapper module: one external prototype per
//! distinct unit template, plus a `<group>_shader_wrapper` function that
//! routes arguments between unit calls. Units are emitted depth-first from
//! the root, dependencies before dependents; each unit's `out` arguments get
//! wrapper stack slots (or the wrapper's own out pointers when exposed) that
//! downstream units read their inputs from.

use crate::{
    error::{Error, Result},
    ir::{self, IrModule},
    template::{ShaderArgument, ShaderGroupTemplate, ShaderUnitTemplate},
    types::{ArgDirection, DataType, ShaderValue},
};
use cranelift_codegen::ir::{
    types, ExtFuncData, ExternalName, FuncRef, Function, InstBuilder, MemFlags, StackSlotData, StackSlotKind,
    UserExternalName, UserFuncName, Value,
};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

/// Lowers `group` into a unit template holding the wrapper module. The group
/// itself is not modified; the caller stores the result on it.
pub(crate) fn lower_group(group: &ShaderGroupTemplate) -> Result<ShaderUnitTemplate> {
    if group.units.is_empty() {
        return Err(Error::InvalidInput);
    }
    let root = group.root.clone().ok_or(Error::ShaderGroupWithoutRoot)?;
    if !group.units.contains_key(&root) {
        return Err(Error::ShaderGroupWithoutRoot);
    }

    let wrapper_args = build_wrapper_arguments(group)?;

    // prototypes of every referenced unit; a template instantiated under
    // several names shares one prototype
    let mut module = IrModule::new(group.name());
    let mut unit_locals: HashMap<SmolStr, u32> = HashMap::new();
    let mut dependencies: IndexMap<SmolStr, Arc<IrModule>> = IndexMap::new();
    for (instance, template) in &group.units {
        let unit_root = template.root_function.clone().ok_or(Error::InvalidShaderGroupTemplate)?;
        let local = module.declare(unit_root, ir::unit_signature(template.exposed_arguments()));
        unit_locals.insert(instance.clone(), local);

        if let Some(unit_module) = &template.module {
            dependencies
                .entry(SmolStr::new(unit_module.name()))
                .or_insert_with(|| unit_module.clone());
        }
        for dep in &template.dependencies {
            dependencies.entry(SmolStr::new(dep.name())).or_insert_with(|| dep.clone());
        }
    }

    let wrapper_symbol = SmolStr::new(format!("{}_shader_wrapper", group.name()));
    let wrapper_sig = ir::unit_signature(&wrapper_args);
    let wrapper_local = module.declare(wrapper_symbol.clone(), wrapper_sig.clone());

    let mut fbc = FunctionBuilderContext::new();
    let mut func = Function::with_name_signature(UserFuncName::user(0, wrapper_local), wrapper_sig);
    {
        let mut b = FunctionBuilder::new(&mut func, &mut fbc);
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let params: Vec<Value> = b.block_params(entry).to_vec();
        // the signature always carries the trailing context pointer
        let global_ptr = params[params.len() - 1];

        let mut emitter = GroupEmitter {
            group,
            module: &module,
            unit_locals: &unit_locals,
            b,
            params,
            global_ptr,
            out_locations: HashMap::new(),
            state: HashMap::new(),
            func_refs: HashMap::new(),
        };
        emitter.emit_instance(&root)?;

        // the root must reach every instance that feeds an exposed output
        for instance in group.exposed_outputs.keys() {
            if !matches!(emitter.state.get(instance), Some(VisitState::Done)) {
                return Err(Error::InvalidShaderGroupTemplate);
            }
        }

        emitter.b.ins().return_(&[]);
        emitter.b.seal_all_blocks();
        emitter.b.finalize();
    }
    module.define(wrapper_local, func);

    debug!(
        group = group.name(),
        units = group.units.len(),
        arguments = wrapper_args.len(),
        "linked shader group"
    );

    let mut lowered = ShaderUnitTemplate::new(group.name());
    lowered.module = Some(Arc::new(module));
    lowered.root_function = Some(wrapper_symbol);
    lowered.exposed_args = wrapper_args;
    lowered.dependencies = dependencies.into_values().collect();
    Ok(lowered)
}

/// Builds the wrapper's exposed-argument list from the group's input/output
/// exposure tables. Indices form one joint list; holes and conflicting
/// claims are rejected.
fn build_wrapper_arguments(group: &ShaderGroupTemplate) -> Result<Vec<ShaderArgument>> {
    let mut slots: Vec<Option<ShaderArgument>> = Vec::new();

    let mut place = |slots: &mut Vec<Option<ShaderArgument>>, index: usize, arg: ShaderArgument| -> Result<()> {
        if slots.len() <= index {
            slots.resize(index + 1, None);
        }
        match &slots[index] {
            None => {
                slots[index] = Some(arg);
                Ok(())
            }
            Some(existing) => {
                if existing.ty != arg.ty {
                    Err(Error::InvalidArgType)
                } else if existing.direction == ArgDirection::In && arg.direction == ArgDirection::In {
                    // one wrapper input may feed several unit inputs
                    Ok(())
                } else {
                    Err(Error::InvalidShaderGroupTemplate)
                }
            }
        }
    };

    for (exposures, direction) in [
        (&group.exposed_inputs, ArgDirection::In),
        (&group.exposed_outputs, ArgDirection::Out),
    ] {
        for (instance, args) in exposures {
            let template = group
                .units
                .get(instance)
                .ok_or_else(|| Error::UndefinedShaderUnit(instance.clone()))?;
            for (arg_name, &index) in args {
                let arg = template.find_argument(arg_name).ok_or(Error::InvalidInput)?;
                if arg.direction != direction || arg.ty == DataType::Void {
                    return Err(Error::InvalidArgType);
                }
                place(
                    &mut slots,
                    index,
                    ShaderArgument {
                        name: SmolStr::new(format!("{}_{}", instance, arg_name)),
                        ty: arg.ty,
                        direction,
                        default: None,
                    },
                )?;
            }
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.ok_or(Error::InvalidShaderGroupTemplate))
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Being,
    Done,
}

struct GroupEmitter<'a, 'b> {
    group: &'a ShaderGroupTemplate,
    module: &'a IrModule,
    unit_locals: &'a HashMap<SmolStr, u32>,
    b: FunctionBuilder<'b>,
    params: Vec<Value>,
    global_ptr: Value,
    /// (instance, out argument) -> address holding the produced value
    out_locations: HashMap<(SmolStr, SmolStr), Value>,
    state: HashMap<SmolStr, VisitState>,
    func_refs: HashMap<u32, FuncRef>,
}

impl<'a, 'b> GroupEmitter<'a, 'b> {
    fn emit_instance(&mut self, instance: &SmolStr) -> Result<()> {
        match self.state.get(instance) {
            Some(VisitState::Being) => return Err(Error::ShaderGroupWithCycles),
            Some(VisitState::Done) => return Ok(()),
            None => {}
        }
        self.state.insert(instance.clone(), VisitState::Being);

        let template = self
            .group
            .units
            .get(instance)
            .cloned()
            .ok_or_else(|| Error::UndefinedShaderUnit(instance.clone()))?;
        let connections = self.group.connections.get(instance).cloned().unwrap_or_default();

        // dependencies first
        for arg in template.exposed_arguments() {
            if arg.direction == ArgDirection::In {
                if let Some((src_instance, _)) = connections.get(&arg.name) {
                    self.emit_instance(src_instance)?;
                }
            }
        }

        let mut call_args = Vec::with_capacity(template.exposed_arguments().len() + 1);
        for arg in template.exposed_arguments() {
            let value = match arg.direction {
                ArgDirection::In => self.input_value(instance, arg, &connections)?,
                ArgDirection::Out => self.output_location(instance, arg),
            };
            call_args.push(value);
        }
        call_args.push(self.global_ptr);

        let local = self.unit_locals[instance];
        self.call_local(local, &call_args);

        self.state.insert(instance.clone(), VisitState::Done);
        Ok(())
    }

    /// Resolves an `in` argument: connection, then exposed group input, then
    /// group default, then the argument's own declared default.
    fn input_value(
        &mut self,
        instance: &SmolStr,
        arg: &ShaderArgument,
        connections: &IndexMap<SmolStr, (SmolStr, SmolStr)>,
    ) -> Result<Value> {
        if let Some((src_instance, src_arg)) = connections.get(&arg.name) {
            let src_template = self
                .group
                .units
                .get(src_instance)
                .ok_or_else(|| Error::UndefinedShaderUnit(src_instance.clone()))?;
            let src = src_template.find_argument(src_arg).ok_or(Error::InvalidInput)?;
            if src.direction != ArgDirection::Out {
                return Err(Error::InvalidInput);
            }
            if src.ty != arg.ty {
                return Err(Error::InvalidArgType);
            }
            let addr = *self
                .out_locations
                .get(&(src_instance.clone(), src_arg.clone()))
                .ok_or(Error::InvalidShaderGroupTemplate)?;
            return Ok(self.load_argument(arg.ty, addr));
        }

        if let Some(&index) = self
            .group
            .exposed_inputs
            .get(instance)
            .and_then(|args| args.get(&arg.name))
        {
            return Ok(self.params[index]);
        }

        let default = self
            .group
            .input_defaults
            .get(instance)
            .and_then(|args| args.get(&arg.name))
            .copied()
            .or(arg.default);
        if let Some(value) = default {
            if value.data_type() != arg.ty {
                return Err(Error::InvalidArgType);
            }
            return Ok(self.materialize_default(&value));
        }

        Err(Error::ArgumentWithoutInitialization {
            group: SmolStr::new(self.group.name()),
            instance: instance.clone(),
            argument: arg.name.clone(),
        })
    }

    /// The address a unit writes an `out` argument to: the wrapper's own out
    /// pointer when exposed, a fresh stack slot otherwise. Recorded so later
    /// instances can read it.
    fn output_location(&mut self, instance: &SmolStr, arg: &ShaderArgument) -> Value {
        let addr = if let Some(&index) = self
            .group
            .exposed_outputs
            .get(instance)
            .and_then(|args| args.get(&arg.name))
        {
            self.params[index]
        } else {
            let slot = self.create_slot(arg.ty.size(), arg.ty.align());
            self.b.ins().stack_addr(ir::pointer_type(), slot, 0)
        };
        self.out_locations.insert((instance.clone(), arg.name.clone()), addr);
        addr
    }

    /// Reads a connected value for an `in` argument: scalars by value,
    /// aggregates by address.
    fn load_argument(&mut self, ty: DataType, addr: Value) -> Value {
        match ir::scalar_type(ty) {
            Some(cl_ty) => self.b.ins().load(cl_ty, MemFlags::trusted(), addr, 0),
            None => addr,
        }
    }

    fn materialize_default(&mut self, value: &ShaderValue) -> Value {
        if let Some(lanes) = value.lanes() {
            let ty = value.data_type();
            let slot = self.create_slot(ty.size(), ty.align());
            for (lane, v) in lanes.iter().enumerate() {
                let v = self.b.ins().f32const(*v);
                self.b.ins().stack_store(v, slot, (lane * 4) as i32);
            }
            self.b.ins().stack_addr(ir::pointer_type(), slot, 0)
        } else {
            match *value {
                ShaderValue::Int(v) => self.b.ins().iconst(types::I32, v as i64),
                ShaderValue::Float(v) => self.b.ins().f32const(v),
                ShaderValue::Double(v) => self.b.ins().f64const(v),
                ShaderValue::Bool(v) => self.b.ins().iconst(types::I8, v as i64),
                _ => unreachable!("composite handled above"),
            }
        }
    }

    fn create_slot(&mut self, size: u32, align: u32) -> cranelift_codegen::ir::StackSlot {
        let shift = align.trailing_zeros() as u8;
        self.b
            .create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size.max(1), shift))
    }

    fn call_local(&mut self, local: u32, args: &[Value]) {
        let func_ref = if let Some(&func_ref) = self.func_refs.get(&local) {
            func_ref
        } else {
            let signature = self.module.symbol(local).signature.clone();
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
        };
        self.b.ins().call(func_ref, args);
    }
}
