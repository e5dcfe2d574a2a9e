//! The per-thread compile driver.
//!
//! One driver instance turns one shader source string into a populated
//! [`ShaderUnitTemplate`]: it opens a compile region, drives the parser
//! (receiving constructs through the [`ParserCallbacks`] it implements),
//! checks touched closures against the registry, runs the code generator and
//! transfers the AST store into the template. Drivers hold no cross-compile
//! state besides their string intern pool and are recycled through the
//! shading context's pool.

use crate::{
    ast::{self, CompileRegion, FunctionId, GlobalId, NodeHandle, StructId, TypeSpec},
    closure::ClosureRegistry,
    codegen::{self, CodegenInput},
    error::{DiagnosticSink, Error, Result},
    global::GlobalModule,
    parser::{self, ParserCallbacks},
    template::{RetainedAst, ShaderUnitTemplate},
};
use indexmap::IndexSet;
use smol_str::SmolStr;
use std::sync::Arc;
use tracing::debug;

pub struct ShaderUnitCompiler {
    functions: Vec<FunctionId>,
    structures: Vec<StructId>,
    globals: Vec<GlobalId>,
    ast_root: Option<(FunctionId, NodeHandle<FunctionId>)>,
    extra_shader_entries: usize,
    closures_touched: IndexSet<SmolStr>,
    interner: IndexSet<SmolStr>,
    type_cache: Option<TypeSpec>,
}

impl ShaderUnitCompiler {
    pub(crate) fn new() -> ShaderUnitCompiler {
        ShaderUnitCompiler {
            functions: vec![],
            structures: vec![],
            globals: vec![],
            ast_root: None,
            extra_shader_entries: 0,
            closures_touched: IndexSet::new(),
            interner: IndexSet::new(),
            type_cache: None,
        }
    }

    fn reset(&mut self) {
        self.functions.clear();
        self.structures.clear();
        self.globals.clear();
        self.ast_root = None;
        self.extra_shader_entries = 0;
        self.closures_touched.clear();
        self.type_cache = None;
        // the intern pool deliberately survives across compiles
    }

    /// Compiles `source` into `template`. The template is only written on
    /// success; any failure leaves it untouched.
    pub(crate) fn compile(
        &mut self,
        registry: &ClosureRegistry,
        globals: &GlobalModule,
        template: &mut ShaderUnitTemplate,
        source: &str,
    ) -> Result<()> {
        self.reset();

        let region = CompileRegion::enter();
        if let Err(sink) = parser::parse(source, self) {
            if template.verbose_parser() {
                sink.emit_stderr(template.name(), source);
            }
            return Err(Error::ParseFailed(sink.render(template.name(), source)));
        }
        // the parser is done; own the AST outright
        let store = region.detach();

        let Some((root_id, root_handle)) = self.ast_root else {
            return Err(Error::CodegenFailed(format!(
                "shader source `{}` defines no shader entry",
                template.name()
            )));
        };
        if self.extra_shader_entries > 0 {
            return Err(Error::CodegenFailed(format!(
                "shader source `{}` defines more than one shader entry",
                template.name()
            )));
        }
        for name in &self.closures_touched {
            if registry.schema(name).is_none() {
                return Err(Error::UnregisteredClosureTouched(name.clone()));
            }
        }

        let mut sink = DiagnosticSink::new();
        let input = CodegenInput {
            store: &store,
            module_name: template.name(),
            registry,
            globals,
            structs: &self.structures,
            global_params: &self.globals,
            functions: &self.functions,
            root: root_id,
            touched_closures: &self.closures_touched,
        };
        let Some(lowered) = codegen::lower_unit(&input, &mut sink) else {
            if template.verbose_parser() {
                sink.emit_stderr(template.name(), source);
            }
            return Err(Error::CodegenFailed(sink.render(template.name(), source)));
        };

        debug!(
            template = template.name(),
            arguments = lowered.exposed_args.len(),
            closures = self.closures_touched.len(),
            "compiled shader unit"
        );

        template.module = Some(Arc::new(lowered.module));
        template.root_function = Some(lowered.root_symbol);
        template.exposed_args = lowered.exposed_args;
        template.dependencies = vec![registry.closure_module()];
        template.ast = Some(RetainedAst {
            store,
            root: root_handle,
        });
        Ok(())
    }
}

impl ParserCallbacks for ShaderUnitCompiler {
    fn push_function(&mut self, function: FunctionId, is_shader: bool) {
        if is_shader {
            if self.ast_root.is_some() {
                self.extra_shader_entries += 1;
            } else {
                self.ast_root = Some((function, ast::shared_handle(function)));
            }
        } else {
            self.functions.push(function);
        }
    }

    fn push_structure(&mut self, structure: StructId) {
        self.structures.push(structure);
    }

    fn push_global_parameter(&mut self, global: GlobalId) {
        self.globals.push(global);
    }

    fn closure_touched(&mut self, name: &str) {
        self.closures_touched.insert(SmolStr::new(name));
    }

    fn cache_data_type(&mut self, ty: TypeSpec) {
        self.type_cache = Some(ty);
    }

    fn data_type_cache(&mut self) -> Option<TypeSpec> {
        self.type_cache.clone()
    }

    fn claim_permanent_address(&mut self, s: &str) -> SmolStr {
        if let Some(existing) = self.interner.get(s) {
            existing.clone()
        } else {
            let interned = SmolStr::new(s);
            self.interner.insert(interned.clone());
            interned
        }
    }
}
