//! Shader unit and shader group templates.
//!
//! Templates are the stable, logically immutable assets of the system: a unit
//! template is produced once by a compile and may back any number of
//! instances; a group template wires unit instances into a DAG and, once
//! linked, owns a lowered wrapper template of its own.

use crate::{
    ast::{AstStore, FunctionId, NodeHandle},
    error::{Error, Result},
    ir::IrModule,
    types::{ArgDirection, DataType, ShaderValue},
};
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::sync::Arc;

/// An exposed parameter of a shader unit.
#[derive(Clone, Debug)]
pub struct ShaderArgument {
    pub name: SmolStr,
    pub ty: DataType,
    pub direction: ArgDirection,
    pub default: Option<ShaderValue>,
}

/// The parsed AST retained by a template. Shader groups re-declare unit
/// signatures from it after the compile region is gone.
pub(crate) struct RetainedAst {
    pub store: AstStore,
    pub root: NodeHandle<FunctionId>,
}

/// The compiled form of one shader source string.
pub struct ShaderUnitTemplate {
    name: SmolStr,
    pub(crate) module: Option<Arc<IrModule>>,
    pub(crate) root_function: Option<SmolStr>,
    pub(crate) exposed_args: Vec<ShaderArgument>,
    pub(crate) ast: Option<RetainedAst>,
    pub(crate) dependencies: Vec<Arc<IrModule>>,
    allow_optimization: bool,
    allow_verification: bool,
    verbose_parser: bool,
}

impl ShaderUnitTemplate {
    pub(crate) fn new(name: impl Into<SmolStr>) -> ShaderUnitTemplate {
        ShaderUnitTemplate {
            name: name.into(),
            module: None,
            root_function: None,
            exposed_args: vec![],
            ast: None,
            dependencies: vec![],
            allow_optimization: true,
            allow_verification: true,
            verbose_parser: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exposed_arguments(&self) -> &[ShaderArgument] {
        &self.exposed_args
    }

    pub(crate) fn find_argument(&self, name: &str) -> Option<&ShaderArgument> {
        self.exposed_args.iter().find(|arg| arg.name == name)
    }

    /// Symbol of the compiled root function, present after a successful
    /// compile.
    pub fn root_function_name(&self) -> Option<&str> {
        self.root_function.as_deref()
    }

    pub fn is_compiled(&self) -> bool {
        self.module.is_some() && self.root_function.is_some()
    }

    pub fn allow_optimization(&self) -> bool {
        self.allow_optimization
    }

    pub fn set_allow_optimization(&mut self, allow: bool) {
        self.allow_optimization = allow;
    }

    pub fn allow_verification(&self) -> bool {
        self.allow_verification
    }

    pub fn set_allow_verification(&mut self, allow: bool) {
        self.allow_verification = allow;
    }

    pub fn verbose_parser(&self) -> bool {
        self.verbose_parser
    }

    pub fn set_verbose_parser(&mut self, verbose: bool) {
        self.verbose_parser = verbose;
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Shader groups
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) type ConnectionMap = IndexMap<SmolStr, IndexMap<SmolStr, (SmolStr, SmolStr)>>;
pub(crate) type ExposureMap = IndexMap<SmolStr, IndexMap<SmolStr, usize>>;

/// A DAG of shader-unit instances, lowered by the linker to a single wrapper
/// function.
pub struct ShaderGroupTemplate {
    name: SmolStr,
    pub(crate) units: IndexMap<SmolStr, Arc<ShaderUnitTemplate>>,
    /// dst instance -> dst argument -> (src instance, src argument)
    pub(crate) connections: ConnectionMap,
    /// instance -> argument -> literal default
    pub(crate) input_defaults: IndexMap<SmolStr, IndexMap<SmolStr, ShaderValue>>,
    /// instance -> argument -> group argument index
    pub(crate) exposed_inputs: ExposureMap,
    pub(crate) exposed_outputs: ExposureMap,
    pub(crate) root: Option<SmolStr>,
    pub(crate) lowered: Option<Arc<ShaderUnitTemplate>>,
}

impl ShaderGroupTemplate {
    pub(crate) fn new(name: impl Into<SmolStr>) -> ShaderGroupTemplate {
        ShaderGroupTemplate {
            name: name.into(),
            units: IndexMap::new(),
            connections: IndexMap::new(),
            input_defaults: IndexMap::new(),
            exposed_inputs: IndexMap::new(),
            exposed_outputs: IndexMap::new(),
            root: None,
            lowered: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a unit instance. A template may be instantiated under several
    /// names; each name is an independent node in the DAG.
    pub fn add_unit(&mut self, instance_name: impl Into<SmolStr>, template: &Arc<ShaderUnitTemplate>) -> Result<()> {
        if !template.is_compiled() {
            return Err(Error::InvalidInput);
        }
        let instance_name = instance_name.into();
        if self.units.contains_key(&instance_name) {
            return Err(Error::InvalidInput);
        }
        self.units.insert(instance_name, template.clone());
        Ok(())
    }

    /// Routes `src_inst.src_arg` (an `out`) into `dst_inst.dst_arg` (an
    /// `in`). Validated when the group is resolved.
    pub fn connect(
        &mut self,
        src_inst: impl Into<SmolStr>,
        src_arg: impl Into<SmolStr>,
        dst_inst: impl Into<SmolStr>,
        dst_arg: impl Into<SmolStr>,
    ) {
        self.connections
            .entry(dst_inst.into())
            .or_default()
            .insert(dst_arg.into(), (src_inst.into(), src_arg.into()));
    }

    /// Exposes a unit input as group argument `index`.
    pub fn expose_input(&mut self, instance: impl Into<SmolStr>, arg: impl Into<SmolStr>, index: usize) {
        self.exposed_inputs
            .entry(instance.into())
            .or_default()
            .insert(arg.into(), index);
    }

    /// Exposes a unit output as group argument `index`.
    pub fn expose_output(&mut self, instance: impl Into<SmolStr>, arg: impl Into<SmolStr>, index: usize) {
        self.exposed_outputs
            .entry(instance.into())
            .or_default()
            .insert(arg.into(), index);
    }

    /// Supplies a literal default for an unconnected input.
    pub fn set_default(&mut self, instance: impl Into<SmolStr>, arg: impl Into<SmolStr>, value: ShaderValue) {
        self.input_defaults
            .entry(instance.into())
            .or_default()
            .insert(arg.into(), value);
    }

    pub fn set_root(&mut self, instance: impl Into<SmolStr>) {
        self.root = Some(instance.into());
    }

    /// The lowered wrapper template, present after a successful group
    /// resolve; feed it to the instance resolver.
    pub fn as_unit_template(&self) -> Option<&Arc<ShaderUnitTemplate>> {
        self.lowered.as_ref()
    }
}
