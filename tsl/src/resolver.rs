//! Instance resolution: template module -> executable function pointer.
//!
//! Every resolve builds a private execution engine: the template's module and
//! all its dependency modules are cloned into it (templates are never
//! consumed), call-site symbol indices are remapped to engine function ids,
//! imported symbols are bound to host-registered addresses (falling back to
//! in-process lookup), and the finalized root address is returned. Failures
//! never leave a half-built instance observable.

use crate::{
    error::{Error, Result},
    ir::{self, IrModule},
    template::ShaderUnitTemplate,
};
use cranelift_codegen::{
    settings::{self, Configurable, Flags},
    verifier::verify_function,
    Context,
};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, FuncId, Linkage, Module};
use smol_str::SmolStr;
use std::collections::HashSet;
use tracing::{debug, error};

/// A resolved, JIT-compiled shader. Owns the execution engine (which owns
/// the compiled code) and the raw entry pointer.
pub struct ShaderInstance {
    engine: Option<JITModule>,
    entry: *const u8,
    root: SmolStr,
}

impl ShaderInstance {
    /// The native entry point. Callable as long as this instance is alive;
    /// the signature follows the template's exposed-argument list plus the
    /// trailing `*mut TslGlobal`.
    pub fn function_pointer(&self) -> *const u8 {
        self.entry
    }

    pub fn root_function_name(&self) -> &str {
        &self.root
    }
}

impl Drop for ShaderInstance {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            // all code pointers derived from this instance die with it
            unsafe { engine.free_memory() };
        }
    }
}

pub(crate) fn resolve(template: &ShaderUnitTemplate, host_symbols: &[(SmolStr, usize)]) -> Result<ShaderInstance> {
    let module = template.module.as_ref().ok_or(Error::InvalidShaderGroupTemplate)?;
    let root = template
        .root_function
        .clone()
        .ok_or(Error::InvalidShaderGroupTemplate)?;

    let mut flag_builder = settings::builder();
    for (flag, value) in [
        ("use_colocated_libcalls", "false"),
        ("is_pic", "false"),
        ("opt_level", if template.allow_optimization() { "speed" } else { "none" }),
        (
            "enable_verifier",
            if template.allow_verification() { "true" } else { "false" },
        ),
    ] {
        flag_builder
            .set(flag, value)
            .map_err(|e| Error::JitBackend(e.to_string()))?;
    }
    let flags = Flags::new(flag_builder);
    let isa = cranelift_native::builder()
        .map_err(|e| Error::JitBackend(e.to_string()))?
        .finish(flags.clone())
        .map_err(|e| Error::JitBackend(e.to_string()))?;

    let mut builder = JITBuilder::with_isa(isa, default_libcall_names());
    for (name, address) in host_symbols {
        builder.symbol(name.as_str(), *address as *const u8);
    }
    let mut engine = JITModule::new(builder);

    // the template module plus its dependency modules, deduplicated
    let mut modules: Vec<&IrModule> = vec![module.as_ref()];
    let mut seen: HashSet<&str> = HashSet::new();
    seen.insert(module.name());
    for dep in &template.dependencies {
        if seen.insert(dep.name()) {
            modules.push(dep.as_ref());
        }
    }

    match install(&mut engine, &modules, &flags, template.allow_verification(), &root) {
        Ok(entry) => {
            debug!(
                template = template.name(),
                root = %root,
                modules = modules.len(),
                "resolved shader instance"
            );
            Ok(ShaderInstance {
                engine: Some(engine),
                entry,
                root,
            })
        }
        Err(err) => {
            // tear the half-built engine down before surfacing the fault
            unsafe { engine.free_memory() };
            Err(err)
        }
    }
}

fn install(
    engine: &mut JITModule,
    modules: &[&IrModule],
    flags: &Flags,
    verify: bool,
    root: &str,
) -> Result<*const u8> {
    // declare every symbol of every module; names shared across modules
    // (imports of another module's exports) merge into one engine id
    let mut id_maps: Vec<Vec<FuncId>> = Vec::with_capacity(modules.len());
    for module in modules {
        let mut ids = Vec::with_capacity(module.len());
        for symbol in module.symbols() {
            let linkage = if symbol.is_defined() {
                Linkage::Export
            } else {
                Linkage::Import
            };
            let id = engine
                .declare_function(&symbol.name, linkage, &symbol.signature)
                .map_err(|e| Error::JitBackend(e.to_string()))?;
            ids.push(id);
        }
        id_maps.push(ids);
    }

    let mut root_id = None;
    for (module, ids) in modules.iter().zip(&id_maps) {
        for (local, symbol) in module.symbols().enumerate() {
            let Some(body) = &symbol.def else { continue };
            let mut body = body.clone();
            ir::remap_function_refs(&mut body, ids);
            if verify {
                verify_function(&body, flags).map_err(|errors| {
                    error!(function = %symbol.name, %errors, "function verification failed");
                    Error::FunctionVerificationFailed
                })?;
            }
            let mut ctx = Context::for_function(body);
            engine
                .define_function(ids[local], &mut ctx)
                .map_err(|e| Error::JitBackend(e.to_string()))?;
            if symbol.name == root {
                root_id = Some(ids[local]);
            }
        }
    }
    let root_id = root_id.ok_or(Error::InvalidShaderGroupTemplate)?;

    engine
        .finalize_definitions()
        .map_err(|e| Error::JitBackend(e.to_string()))?;
    Ok(engine.get_finalized_function(root_id))
}
