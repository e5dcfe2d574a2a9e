//! Tiny Shading Language
//!
//! A small, strongly-typed, C-like shading language compiled at runtime to
//! native machine code. The crate covers the whole pipeline: parsing and
//! type-checking shader source into an AST, lowering it to an IR module
//! inside a [`ShaderUnitTemplate`], composing independently compiled units
//! into a [`ShaderGroupTemplate`] DAG lowered to a single wrapper function,
//! and JIT-resolving templates into callable [`ShaderInstance`]s.
//!
//! ```no_run
//! use tsl::ShadingContext;
//!
//! let ctx = ShadingContext::new();
//! let mut driver = ctx.begin_shader_unit_compile();
//! let mut template = ctx.create_shader_unit_template("example");
//! ctx.compile_shader_unit(&mut driver, &mut template, "shader entry(out float o){ o = 3.5; }")?;
//! let template = std::sync::Arc::new(template);
//! let instance = ctx.resolve_shader_instance(&template)?;
//! let entry = instance.function_pointer();
//! # let _ = entry;
//! # Ok::<(), tsl::Error>(())
//! ```

pub mod ast;
pub mod closure;
mod codegen;
mod compiler;
mod context;
mod error;
mod global;
mod ir;
mod lexer;
mod linker;
mod parser;
mod resolver;
mod template;
mod types;

pub use closure::{
    ClosureField, ClosureId, ClosureRegistry, ClosureSchema, ClosureTreeNodeAdd, ClosureTreeNodeBase,
    ClosureTreeNodeMul, CLOSURE_ADD, CLOSURE_ALLOCATOR_SYMBOL, CLOSURE_INVALID, CLOSURE_MUL,
};
pub use compiler::ShaderUnitCompiler;
pub use context::ShadingContext;
pub use error::{Error, Result};
pub use global::{GlobalModule, TslGlobal};
pub use lexer::Token;
pub use parser::ParserCallbacks;
pub use resolver::ShaderInstance;
pub use template::{ShaderArgument, ShaderGroupTemplate, ShaderUnitTemplate};
pub use types::{ArgDirection, DataType, ShaderValue};
