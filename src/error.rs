//! Error types for the oxidos environment

use thiserror::Error;

/// Errors produced by the compile-and-execute pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // Lexical errors
    /// Unexpected character in the source text
    #[error("Lexical error at line {line}, column {col}: {message}")]
    LexError {
        /// Line number where the error occurred
        line: usize,
        /// Column number where the error occurred
        col: usize,
        /// Error description
        message: String,
    },

    // Syntax errors
    /// Malformed construct encountered during parsing
    #[error("Syntax error at line {line}, column {col}: {message}")]
    SyntaxError {
        /// Line number where the error occurred
        line: usize,
        /// Column number where the error occurred
        col: usize,
        /// Error description
        message: String,
    },

    /// Unexpected end of the translation unit
    #[error("Unexpected end of file")]
    UnexpectedEof,

    // Semantic errors (code generation)
    /// Reference to an identifier with no visible declaration
    #[error("Undeclared identifier `{name}` at line {line}, column {col}")]
    Undeclared {
        /// Identifier name
        name: String,
        /// Line of the reference
        line: usize,
        /// Column of the reference
        col: usize,
    },

    /// Redeclaration of a name already bound in the same scope
    #[error("Duplicate declaration of `{name}` at line {line}, column {col}")]
    DuplicateDeclaration {
        /// Identifier name
        name: String,
        /// Line of the redeclaration
        line: usize,
        /// Column of the redeclaration
        col: usize,
    },

    /// Operand types do not fit the operation
    #[error("Type mismatch at line {line}, column {col}: {message}")]
    TypeMismatch {
        /// Line of the offending expression
        line: usize,
        /// Column of the offending expression
        col: usize,
        /// What went wrong
        message: String,
    },

    /// An address was required but the expression has no storage
    #[error("Lvalue required at line {line}, column {col}: {message}")]
    LvalueRequired {
        /// Line of the offending expression
        line: usize,
        /// Column of the offending expression
        col: usize,
        /// What was attempted
        message: String,
    },

    /// `break` or `continue` outside any loop
    #[error("`{keyword}` outside of a loop at line {line}, column {col}")]
    ControlOutsideLoop {
        /// The offending keyword
        keyword: String,
        /// Line of the statement
        line: usize,
        /// Column of the statement
        col: usize,
    },

    /// General semantic error with a source position
    #[error("Semantic error at line {line}, column {col}: {message}")]
    Semantic {
        /// Line of the construct
        line: usize,
        /// Column of the construct
        col: usize,
        /// Error description
        message: String,
    },

    // Link errors
    /// Include target could not be read from the file system
    #[error("Include not found: {path}")]
    IncludeNotFound {
        /// The unresolved include path
        path: String,
    },

    /// A translation unit includes itself
    #[error("Self include: {path}")]
    SelfInclude {
        /// The offending path
        path: String,
    },

    /// The include graph contains a cycle
    #[error("Include cycle involving {path}")]
    IncludeCycle {
        /// One path on the cycle
        path: String,
    },

    // Runtime faults
    /// Access to a virtual address with no present mapping
    #[error("Page fault in pid {pid} at {addr:#010x}")]
    PageFault {
        /// Faulting process
        pid: u32,
        /// Faulting virtual address
        addr: u32,
    },

    /// Fetched word does not decode to an instruction
    #[error("Invalid instruction {word:#010x} in pid {pid} at {pc:#010x}")]
    InvalidInstruction {
        /// Faulting process
        pid: u32,
        /// Program counter of the fetch
        pc: u32,
        /// The undecodable word
        word: u32,
    },

    /// Stack pointer left the stack segment
    #[error("Stack overflow in pid {pid}")]
    StackOverflow {
        /// Faulting process
        pid: u32,
    },

    /// Integer division or modulo by zero
    #[error("Division by zero in pid {pid} at {pc:#010x}")]
    DivideByZero {
        /// Faulting process
        pid: u32,
        /// Program counter of the instruction
        pc: u32,
    },

    /// Operation on a handle the process does not own
    #[error("Bad handle {handle} in pid {pid}")]
    BadHandle {
        /// Faulting process
        pid: u32,
        /// The handle value
        handle: i64,
    },

    /// File system refused the operation
    #[error("Permission denied: {path}")]
    PermissionDenied {
        /// Path of the refused node
        path: String,
    },

    /// Path does not name a node
    #[error("No such file or directory: {path}")]
    FileNotFound {
        /// The unresolved path
        path: String,
    },

    /// Physical frame pool or a fixed table is exhausted
    #[error("Out of memory: {what}")]
    OutOfMemory {
        /// Which resource ran out
        what: String,
    },

    /// Process table has no free slot
    #[error("Process table exhausted")]
    ProcessTableFull,

    /// Operation on a pid with no live context
    #[error("No such process: {pid}")]
    NoSuchProcess {
        /// The unknown pid
        pid: u32,
    },
}

/// Classifies errors by pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStage {
    /// Lexing, parsing, or code generation
    Compile,
    /// Include resolution and concatenation
    Link,
    /// Execution inside the virtual machine
    Runtime,
}

impl Error {
    /// Shorthand for a semantic diagnostic at a source position
    pub fn semantic(line: usize, col: usize, msg: impl Into<String>) -> Self {
        Error::Semantic {
            line,
            col,
            message: msg.into(),
        }
    }

    /// Which pipeline stage produced this error
    pub fn stage(&self) -> ErrorStage {
        match self {
            Error::IncludeNotFound { .. }
            | Error::SelfInclude { .. }
            | Error::IncludeCycle { .. } => ErrorStage::Link,

            Error::PageFault { .. }
            | Error::InvalidInstruction { .. }
            | Error::StackOverflow { .. }
            | Error::DivideByZero { .. }
            | Error::BadHandle { .. }
            | Error::PermissionDenied { .. }
            | Error::FileNotFound { .. }
            | Error::OutOfMemory { .. }
            | Error::ProcessTableFull
            | Error::NoSuchProcess { .. } => ErrorStage::Runtime,

            _ => ErrorStage::Compile,
        }
    }
}

/// Result type for oxidos operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_classification() {
        let e = Error::IncludeCycle {
            path: "/include/a".into(),
        };
        assert_eq!(e.stage(), ErrorStage::Link);

        let e = Error::PageFault {
            pid: 1,
            addr: 0xF000_0000,
        };
        assert_eq!(e.stage(), ErrorStage::Runtime);

        let e = Error::semantic(3, 7, "bad cast");
        assert_eq!(e.stage(), ErrorStage::Compile);
    }

    #[test]
    fn test_display_carries_position() {
        let e = Error::Undeclared {
            name: "foo".into(),
            line: 12,
            col: 4,
        };
        let msg = e.to_string();
        assert!(msg.contains("foo"));
        assert!(msg.contains("12"));
    }
}
