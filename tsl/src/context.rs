//! The process-wide shading context.

use crate::{
    closure::{ClosureField, ClosureId, ClosureRegistry},
    compiler::ShaderUnitCompiler,
    error::{Error, Result},
    global::GlobalModule,
    linker,
    resolver::{self, ShaderInstance},
    template::{ShaderGroupTemplate, ShaderUnitTemplate},
};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;
use std::sync::Arc;

/// Façade over the whole engine: owns the closure registry, the global
/// module and a pool of compile drivers, and hands out templates and
/// instances. One context is shared by any number of threads.
pub struct ShadingContext {
    registry: Arc<ClosureRegistry>,
    globals: Arc<GlobalModule>,
    host_symbols: RwLock<IndexMap<SmolStr, usize>>,
    drivers: Mutex<Vec<ShaderUnitCompiler>>,
}

impl ShadingContext {
    pub fn new() -> ShadingContext {
        ShadingContext {
            registry: Arc::new(ClosureRegistry::new()),
            globals: Arc::new(GlobalModule::new()),
            host_symbols: RwLock::new(IndexMap::new()),
            drivers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a closure type; returns its id. Registering the same name
    /// twice returns the first id.
    pub fn register_closure(&self, name: &str, fields: &[ClosureField], size: u32) -> Result<ClosureId> {
        self.registry.register(name, fields, size)
    }

    /// Installs the address of a host-provided symbol (closure constructors,
    /// the closure allocator, extra runtime helpers). Symbols not registered
    /// here are resolved against the running process.
    pub fn register_host_symbol(&self, name: &str, address: *const u8) {
        self.host_symbols.write().insert(SmolStr::new(name), address as usize);
    }

    pub fn closure_registry(&self) -> &ClosureRegistry {
        &self.registry
    }

    /// Creates an empty unit template; fill it with [`Self::compile_shader_unit`].
    /// Template names become symbol prefixes and must be unique per context.
    pub fn create_shader_unit_template(&self, name: &str) -> ShaderUnitTemplate {
        ShaderUnitTemplate::new(name)
    }

    /// Checks a compile driver out of the pool.
    pub fn begin_shader_unit_compile(&self) -> ShaderUnitCompiler {
        self.drivers.lock().pop().unwrap_or_else(ShaderUnitCompiler::new)
    }

    /// Returns a driver to the pool for reuse.
    pub fn finish_shader_unit_compile(&self, driver: ShaderUnitCompiler) {
        self.drivers.lock().push(driver);
    }

    /// Compiles `source` into `template`. Runs entirely on the calling
    /// thread; the template is only written on success.
    pub fn compile_shader_unit(
        &self,
        driver: &mut ShaderUnitCompiler,
        template: &mut ShaderUnitTemplate,
        source: &str,
    ) -> Result<()> {
        driver.compile(&self.registry, &self.globals, template, source)
    }

    pub fn create_shader_group_template(&self, name: &str) -> ShaderGroupTemplate {
        ShaderGroupTemplate::new(name)
    }

    /// Links a shader group: topologically orders its units and generates
    /// the wrapper module, stored on the group.
    pub fn resolve_shader_group(&self, group: &mut ShaderGroupTemplate) -> Result<()> {
        let lowered = linker::lower_group(group)?;
        group.lowered = Some(Arc::new(lowered));
        Ok(())
    }

    /// JIT-compiles a template (a compiled unit or a linked group's wrapper)
    /// into a callable instance.
    pub fn resolve_shader_instance(&self, template: &ShaderUnitTemplate) -> Result<ShaderInstance> {
        if !template.is_compiled() {
            return Err(Error::InvalidInput);
        }
        let symbols: Vec<(SmolStr, usize)> = self
            .host_symbols
            .read()
            .iter()
            .map(|(name, &addr)| (name.clone(), addr))
            .collect();
        resolver::resolve(template, &symbols)
    }
}

impl Default for ShadingContext {
    fn default() -> Self {
        ShadingContext::new()
    }
}
