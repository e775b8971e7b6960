//! stackscheme - Scheme subset on a bytecode stack machine
//!
//! This crate compiles a subset of Scheme from source text into a compact
//! bytecode and executes that bytecode on a stack-based virtual machine with
//! first-class closures and continuations.
//!
//! ## Pipeline
//!
//! ```scheme
//! ;; source text
//! ((lambda (x) (* x x)) 5)
//! ```
//!
//! 1. `scanner`: source text -> token stream, with an `is_final` marker on
//!    the first token of the last expression of every expression sequence.
//! 2. `compiler`: single pass over the tokens -> linear bytecode plus a
//!    deduplicated constant pool. Lambda bodies compile into independent
//!    code blocks that are concatenated behind the top-level prologue.
//! 3. `vm`: fetch-decode-execute over the bytecode, leaving the program's
//!    final value on the value stack.
//!
//! ## Continuation arity ("coarity")
//!
//! The compiler decides at compile time whether each expression must deliver
//! exactly one value (`one`) or may deliver any number of values that will
//! all be discarded (`any`), and emits toggle instructions only on
//! transitions. At runtime the value-producing instructions consult the
//! mode, which is how expression sequences drop every value but the last
//! without dedicated pop instructions.
//!
//! ## Strictness
//!
//! All errors are fatal: scanning, compilation and execution abort with a
//! diagnostic and no recovery. The CLI front-end prints the diagnostic and
//! exits non-zero.

use std::fmt;

/// Hard cap on constant-pool entries; a constant index must fit in one byte.
pub const MAX_CONSTANTS: usize = 256;

/// Hard cap on stack variables, shared variables and lambda formals per
/// lambda; variable ids must fit in one byte.
pub const MAX_VARIABLES: usize = 255;

/// Categorizes the different kinds of scan failures.
#[derive(Debug, PartialEq, Clone)]
pub enum ScanErrorKind {
    /// Input ended inside a string literal
    UnterminatedString,
    /// Input ended inside a token that requires more characters (e.g. `#\`)
    UnexpectedEof,
    /// A character that cannot start or continue any token
    InvalidCharacter,
    /// More `)` than `(`, or unclosed `(` at end of input
    UnbalancedParens,
    /// A `(` immediately followed by `)` - no expression sequence to mark
    EmptyExpressionSequence,
}

/// A structured error describing a scan failure.
#[derive(Debug, PartialEq, Clone)]
pub struct ScanError {
    pub kind: ScanErrorKind,
    pub message: String,
    /// Snippet of the input around the failure (max 100 chars)
    pub context: Option<String>,
    /// The offending character or token, if identifiable
    pub found: Option<String>,
}

impl ScanError {
    /// Create a ScanError with a kind and message but no context
    pub fn from_message(kind: ScanErrorKind, message: impl Into<String>) -> Self {
        ScanError {
            kind,
            message: message.into(),
            context: None,
            found: None,
        }
    }

    /// Create a ScanError with context extracted from the input at an offset
    pub fn with_context(
        kind: ScanErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
    ) -> Self {
        Self::with_context_and_found(kind, message, input, error_offset, None)
    }

    /// Create a ScanError with context and the offending token
    pub fn with_context_and_found(
        kind: ScanErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
        found: Option<String>,
    ) -> Self {
        const MAX_CONTEXT: usize = 100;

        // Show some context before the error as well
        let context_start = error_offset.saturating_sub(20);

        let context_str: String = input
            .chars()
            .skip(context_start)
            .take(MAX_CONTEXT)
            .collect();

        let mut display_context = String::new();
        if context_start > 0 {
            display_context.push_str("[...]");
        }
        display_context.push_str(&context_str);
        if context_start + context_str.len() < input.len() {
            display_context.push_str("[...]");
        }

        // Newlines would garble the one-line diagnostic
        let display_context = display_context.replace('\n', "\\n").replace('\r', "");

        ScanError {
            kind,
            message: message.into(),
            context: Some(display_context),
            found,
        }
    }
}

/// Error types for the whole pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    ScanError(ScanError),
    CompileError(String),
    UnknownIdentifier(String),
    /// An implementation limit was exceeded (constant pool, variable ids,
    /// argument counts, jump spans)
    CapacityError(String),
    TypeError(String),
    ArityError {
        expected: usize,
        got: usize,
        procedure: Option<String>,
    },
    EvalError(String),
}

impl Error {
    /// Create an ArityError without naming the procedure
    pub fn arity_error(expected: usize, got: usize) -> Self {
        Error::ArityError {
            expected,
            got,
            procedure: None,
        }
    }

    /// Create an ArityError naming the procedure
    pub fn arity_error_in(procedure: impl Into<String>, expected: usize, got: usize) -> Self {
        Error::ArityError {
            expected,
            got,
            procedure: Some(procedure.into()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ScanError(e) => {
                write!(f, "ScanError: {}", e.message)?;
                if let Some(found) = &e.found {
                    write!(f, "\nFound: {found}")?;
                }
                if let Some(context) = &e.context {
                    write!(f, "\nContext: {context}")?;
                }
                Ok(())
            }
            Error::CompileError(msg) => write!(f, "CompileError: {msg}"),
            Error::UnknownIdentifier(name) => write!(f, "Unknown identifier: {name}"),
            Error::CapacityError(msg) => write!(f, "CapacityError: {msg}"),
            Error::TypeError(msg) => write!(f, "Type error: {msg}"),
            Error::ArityError {
                expected,
                got,
                procedure,
            } => match procedure {
                Some(name) => write!(
                    f,
                    "ArityError: procedure {name}: expected {expected} arguments, got {got}"
                ),
                None => write!(
                    f,
                    "ArityError: procedure expected {expected} arguments but got {got}"
                ),
            },
            Error::EvalError(msg) => write!(f, "EvaluationError: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod scanner;
pub mod value;
pub mod vm;

/// Compile a source string all the way to an executable program.
///
/// Convenience wrapper for the common scan-then-compile sequence used by the
/// CLI, the REPL and most tests.
pub fn compile_source(source: &str) -> Result<bytecode::Program, Error> {
    let tokens = scanner::scan(source)?;
    compiler::compile(&tokens)
}
