//! Error kinds, source locations and the caret-style diagnostic renderer.
//!
//! Every failure carries an [`ErrorKind`], an optional primary location and
//! a call chain collected as the error unwinds through function calls and
//! macro expansions.

use std::io::Write;

use thiserror::Error;

use crate::state::State;

#[derive(Debug, Clone, Error)]
pub enum ErrorKind {
    #[error("unexpected )")]
    UnexpectedClose,

    #[error("unexpected EOF while reading list")]
    UnterminatedList,

    #[error("unexpected EOF while reading string")]
    UnterminatedString,

    #[error("unexpected EOF after . in list")]
    EofAfterDot,

    #[error("expected ) after dotted-tail")]
    UnclosedDottedTail,

    #[error("unbound symbol: {0}")]
    UnboundSymbol(String),

    #[error("attempt to call nil")]
    CallNil,

    #[error("not a function")]
    NotCallable,

    #[error("bind expects a symbol")]
    BindNonSymbol,

    #[error("{0} requires exactly two arguments")]
    RequiresTwoArgs(&'static str),

    #[error("{0}: expected number, got {1}")]
    ExpectedNumber(&'static str, &'static str),

    #[error("division by zero")]
    DivisionByZero,

    #[error("{0} expects a pair")]
    ExpectedPair(&'static str),

    #[error("{0} requires a string")]
    RequiresString(&'static str),

    #[error("apply requires a function")]
    ApplyWithoutFunction,

    #[error("could not open file: {name} (tried: {tried})")]
    ModuleNotFound { name: String, tried: String },

    #[error("{0}")]
    User(String),
}

/// A point in some source text, optionally labeled for call-chain display
/// (`fn`, `macro <name>`, `macro-def`).
#[derive(Debug, Clone, Default)]
pub struct SourceLoc {
    pub file: String,
    pub line: usize,
    pub col: usize,
    pub label: String,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub loc: Option<SourceLoc>,
    pub chain: Vec<SourceLoc>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Error {
        Error {
            kind,
            loc: None,
            chain: Vec::new(),
        }
    }

    pub fn at(kind: ErrorKind, loc: SourceLoc) -> Error {
        Error {
            kind,
            loc: Some(loc),
            chain: Vec::new(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind.fmt(f)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

fn use_color() -> bool {
    std::env::var_os("NANLISP_COLOR").is_some()
        || unsafe { libc::isatty(libc::STDERR_FILENO) } == 1
}

const RED: &str = "\x1b[1;31m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn caret_pad(line: &str, col: usize) -> String {
    let col_index = col.saturating_sub(1);
    line.chars()
        .chain(std::iter::repeat(' '))
        .take(col_index)
        .map(|c| if c == '\t' { '\t' } else { ' ' })
        .collect()
}

fn print_with_loc(state: &State, loc: &SourceLoc, msg: &str, color: bool) {
    let mut err = std::io::stderr().lock();
    if color {
        let _ = write!(err, "{RED}");
    }
    let _ = writeln!(err, "error: {}:{}:{}: {}", loc.file, loc.line, loc.col, msg);
    if color {
        let _ = write!(err, "{RESET}");
    }
    if let Some(line) = state.source_line(&loc.file, loc.line) {
        if color {
            let _ = writeln!(err, "{BOLD}{line}{RESET}");
        } else {
            let _ = writeln!(err, "{line}");
        }
        let pad = caret_pad(&line, loc.col);
        if color {
            let _ = writeln!(err, "{pad}{RED}^{RESET}");
        } else {
            let _ = writeln!(err, "{pad}^");
        }
    }
}

fn print_call_chain(state: &State, chain: &[SourceLoc]) {
    if chain.is_empty() {
        return;
    }
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "Call chain:");
    for entry in chain {
        if entry.label.is_empty() {
            let _ = writeln!(err, "  at {}:{}:{}", entry.file, entry.line, entry.col);
        } else {
            let _ = writeln!(
                err,
                "  at {} {}:{}:{}",
                entry.label, entry.file, entry.line, entry.col
            );
        }
        if let Some(line) = state.source_line(&entry.file, entry.line) {
            let _ = writeln!(err, "    {line}");
            let _ = writeln!(err, "    {}^", caret_pad(&line, entry.col));
        }
    }
}

/// Render an error to stderr: primary location with source echo and caret,
/// then the call chain. Errors with no recorded location fall back to the
/// expression the evaluator was working on when the failure surfaced.
pub fn report(state: &State, err: &Error) {
    let color = use_color();
    let msg = err.kind.to_string();

    if let Some(loc) = &err.loc {
        print_with_loc(state, loc, &msg, color);
        print_call_chain(state, &err.chain);
        return;
    }

    if let Some(loc) = state.source_loc_of(&state.current_expr) {
        print_with_loc(state, &loc, &msg, color);
        if !err.chain.is_empty() {
            print_call_chain(state, &err.chain);
        } else if let Some(chain) = state.call_chain_of(&state.current_expr) {
            print_call_chain(state, &chain);
        }
    } else {
        eprintln!("error: {msg}");
    }
}
