//! A small Lisp with a tiered execution strategy: every function starts on
//! a tree-walking interpreter, and functions that get hot on purely numeric
//! call sites are compiled to native code through Cranelift. Values are
//! NaN-boxed 64-bit words over a refcounted heap; the interpreter remains
//! the semantic source of truth, with native code deoptimizing back to it
//! through a NaN sentinel.

pub mod env;
pub mod error;
pub mod eval;
pub mod intrinsics;
pub mod jit;
pub mod reader;
pub mod repl;
pub mod require;
pub mod state;
pub mod value;

pub use error::{Error, ErrorKind, Result, SourceLoc};
pub use state::State;
pub use value::{Type, Value};
