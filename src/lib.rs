//! # oxidos — a toy operating environment
//!
//! A self-contained environment that compiles a C-like source language
//! to a custom bytecode and executes it on a virtual machine with
//! paged virtual memory, cooperative multitasking, a virtual file
//! system, and a character-cell display.
//!
//! ## Architecture
//!
//! ```text
//! source text → linker (VFS) → scanner → parser → codegen → Image
//!                                                              │
//!            console ◄── syscalls ◄── interpreter ◄── process load
//!                                         │
//!                              two-level paging ◄── frame pool
//! ```
//!
//! ## Quick start
//!
//! Write a program into the virtual file system, start it, and tick
//! the scheduler until it exits:
//!
//! ```rust
//! use oxidos::Machine;
//!
//! # fn main() -> oxidos::Result<()> {
//! let mut machine = Machine::new();
//! machine.write_file(
//!     "/bin/answer",
//!     b"#include \"io\"\nint main() { put_int(2 + 3 * 4); return 0; }",
//! )?;
//! let pid = machine.exec("/bin/answer", &[])?;
//! machine.run(100);
//! assert_eq!(machine.console().screen_text(), "14");
//! assert_eq!(machine.reap(pid), Some(0));
//! # Ok(())
//! # }
//! ```
//!
//! The compile pipeline is usable on its own:
//!
//! ```rust
//! use oxidos::compiler;
//!
//! let image = compiler::compile("int main() { return 42; }").unwrap();
//! assert!(!image.text.is_empty());
//! ```

pub mod compiler;
pub mod console;
pub mod error;
pub mod host;
pub mod lexer;
pub mod parser;
pub mod vfs;
pub mod vm;

pub use compiler::{Codegen, Image, Linker, Opcode};
pub use console::Console;
pub use error::{Error, ErrorStage, Result};
pub use host::{Clock, ManualClock, SystemClock};
pub use lexer::{Scanner, Token, TokenKind};
pub use parser::Parser;
pub use vfs::Vfs;
pub use vm::{CtxState, Machine};
