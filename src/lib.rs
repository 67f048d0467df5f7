//! Overture — a compiler for a textual orchestra language.
//!
//! Source text passes through a fixed pipeline: preprocessing, parsing,
//! semantic verification, dependency analysis (multi-threaded targets
//! only), expression expansion, optimization, and instruction graph
//! emission. Each stage owns the tree and hands it to the next; any
//! failure aborts the whole compilation and leaves nothing half-built.

pub mod analyze;
pub mod config;
pub mod error;
pub mod graph;
pub mod opcode;
pub mod preprocess;
pub mod sema;
pub mod syntax;
pub mod transform;

use tracing::debug;

pub use config::CompileConfig;
pub use error::{CompileError, ErrorKind};
pub use graph::InstructionGraph;
pub use preprocess::macros::MacroTable;

use analyze::DependencyRecord;
use opcode::OpcodeTable;
use syntax::lexer::Lexer;
use syntax::parser::Parser;
use syntax::symbol::SymbolTable;

/// Result of a successful compilation.
#[derive(Debug)]
pub struct CompiledOrchestra {
    pub graph: InstructionGraph,
    /// Per-instrument global access summary. Empty for single-threaded
    /// targets, where the analysis pass does not run.
    pub records: Vec<DependencyRecord>,
}

/// A compilation session: configuration plus the opcode library to
/// resolve calls against.
pub struct Compiler {
    config: CompileConfig,
    library: OpcodeTable,
}

impl Compiler {
    pub fn new(config: CompileConfig) -> Self {
        Self::with_library(config, OpcodeTable::builtin())
    }

    pub fn with_library(config: CompileConfig, library: OpcodeTable) -> Self {
        Self { config, library }
    }

    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    pub fn library(&self) -> &OpcodeTable {
        &self.library
    }

    /// Compile with the default macro table (math constants only).
    pub fn compile(&self, source: &str) -> Result<CompiledOrchestra, CompileError> {
        self.compile_with_macros(source, MacroTable::with_builtins())
    }

    /// Compile with caller-provided macro definitions (command-line
    /// `-D` style seeding).
    pub fn compile_with_macros(
        &self,
        source: &str,
        mut macros: MacroTable,
    ) -> Result<CompiledOrchestra, CompileError> {
        let expanded = preprocess::preprocess(source, &mut macros)?;
        if self.config.debug {
            debug!(text = %expanded, "after preprocessing");
        }

        let tokens = Lexer::new(&expanded).tokenize()?;
        let mut symbols = SymbolTable::new();
        let program = Parser::new(tokens).parse(&mut symbols)?;
        let program = sema::verify(program, &mut symbols, &self.library)?;
        if self.config.debug {
            debug!(tree = ?program, "after verification");
        }

        // Lock insertion runs on the unexpanded tree, where a statement
        // still corresponds to one source operation. Weights run after
        // expansion so they count elementary calls.
        let (program, records) = if self.config.multi_threaded() {
            analyze::insert_locks(program, &self.library)
        } else {
            (program, Vec::new())
        };

        let program = transform::expand(program, &self.library);
        let program = if self.config.multi_threaded() {
            analyze::weight::calculate(program, &self.library)
        } else {
            program
        };
        let program = transform::optimize(program);
        if self.config.debug {
            debug!(tree = ?program, "after expansion and optimization");
        }

        let graph = graph::compile(&program, &symbols)?;
        debug!(
            instruments = graph.instruments.len(),
            globals = graph.global_count,
            locks = graph.locks.len(),
            "compilation finished"
        );
        Ok(CompiledOrchestra { graph, records })
    }
}
