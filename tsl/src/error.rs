//! Error taxonomy and the diagnostic sink used during compilation.

use crate::ast::Span;
use codespan_reporting::{
    diagnostic::{Diagnostic, Label},
    files::SimpleFile,
    term,
    term::termcolor::{Buffer, ColorChoice, StandardStream},
};
use smol_str::SmolStr;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Faults surfaced by the public compile / link / resolve operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The parser rejected the shader source.
    #[error("failed to parse shader source:\n{0}")]
    ParseFailed(String),
    /// Closure registration with malformed field types or a zero size.
    #[error("invalid closure schema")]
    InvalidClosureSchema,
    /// The shader references a closure that was never registered.
    #[error("shader touches unregistered closure `{0}`")]
    UnregisteredClosureTouched(SmolStr),
    /// Semantic error during lowering; carries the rendered diagnostics.
    #[error("shader code generation failed:\n{0}")]
    CodegenFailed(String),
    /// Null/empty template or group passed to an operation.
    #[error("invalid input")]
    InvalidInput,
    /// The template lacks a module or root function, or the group exposure
    /// table is inconsistent.
    #[error("invalid shader group template")]
    InvalidShaderGroupTemplate,
    /// The group has no root set, or the root is not among its units.
    #[error("shader group has no root shader unit")]
    ShaderGroupWithoutRoot,
    /// The unit connection graph contains a cycle.
    #[error("shader group contains cycles")]
    ShaderGroupWithCycles,
    /// A connection or exposure references an instance not in the group.
    #[error("undefined shader unit `{0}`")]
    UndefinedShaderUnit(SmolStr),
    /// An input argument is neither connected, exposed nor defaulted.
    #[error("argument `{argument}` of unit `{instance}` in group `{group}` has no initialization")]
    ArgumentWithoutInitialization {
        group: SmolStr,
        instance: SmolStr,
        argument: SmolStr,
    },
    /// A connection or exposure uses an unsupported or mismatched type.
    #[error("invalid argument type")]
    InvalidArgType,
    /// The IR verifier rejected a generated function.
    #[error("function verification failed")]
    FunctionVerificationFailed,
    /// Unrecoverable fault while building the execution engine.
    #[error("jit backend error: {0}")]
    JitBackend(String),
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Diagnostic sink
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
struct SinkEntry {
    message: String,
    span: Option<Span>,
}

/// Accumulates source-located error messages during parsing and lowering.
/// The whole batch is collapsed into one [`Error`] by the driver.
#[derive(Debug, Default)]
pub(crate) struct DiagnosticSink {
    entries: Vec<SinkEntry>,
}

impl DiagnosticSink {
    pub fn new() -> DiagnosticSink {
        DiagnosticSink { entries: vec![] }
    }

    pub fn error(&mut self, message: impl Into<String>, span: Option<Span>) {
        self.entries.push(SinkEntry {
            message: message.into(),
            span,
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.entries.is_empty()
    }

    fn diagnostics(&self) -> impl Iterator<Item = Diagnostic<()>> + '_ {
        self.entries.iter().map(|entry| {
            let mut diag = Diagnostic::error().with_message(&entry.message);
            if let Some(span) = entry.span {
                diag = diag.with_labels(vec![Label::primary((), span.range())]);
            }
            diag
        })
    }

    /// Renders all diagnostics into a plain string, for error payloads.
    pub fn render(&self, file_name: &str, source: &str) -> String {
        let file = SimpleFile::new(file_name, source);
        let config = term::Config::default();
        let mut buffer = Buffer::no_color();
        for diag in self.diagnostics() {
            // rendering into a memory buffer cannot fail
            let _ = term::emit(&mut buffer, &config, &file, &diag);
        }
        String::from_utf8_lossy(buffer.as_slice()).into_owned()
    }

    /// Prints all diagnostics to stderr, used with `verbose_parser`.
    pub fn emit_stderr(&self, file_name: &str, source: &str) {
        let file = SimpleFile::new(file_name, source);
        let config = term::Config::default();
        let mut writer = StandardStream::stderr(ColorChoice::Auto);
        for diag in self.diagnostics() {
            let _ = term::emit(&mut writer, &config, &file, &diag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_with_location() {
        let source = "shader entry() { bogus; }";
        let mut sink = DiagnosticSink::new();
        sink.error("unknown symbol `bogus`", Some(Span::new(17..22)));
        let rendered = sink.render("test.tsl", source);
        assert!(rendered.contains("unknown symbol"));
        assert!(rendered.contains("test.tsl"));
    }
}
