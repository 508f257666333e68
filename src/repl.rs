//! The interactive read-eval-print loop, with line history persisted under
//! the user's home directory.

use std::path::PathBuf;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::error;
use crate::state::State;

fn history_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".nanlisp_history"))
}

pub fn run(state: &mut State) {
    let Ok(mut rl) = DefaultEditor::new() else {
        eprintln!("nanlisp: cannot start the line editor");
        return;
    };
    let history = history_path();
    if let Some(path) = &history {
        let _ = rl.load_history(path);
    }

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line.as_str());
                match state.parse(&line, "(repl)") {
                    Ok(form) => {
                        if form.is_nil() {
                            continue;
                        }
                        let global = state.global;
                        match state.eval(&form, global) {
                            Ok(v) => println!("{}", v.render()),
                            Err(err) => error::report(state, &err),
                        }
                    }
                    Err(err) => error::report(state, &err),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("error: {err}");
                break;
            }
        }
    }

    if let Some(path) = &history {
        let _ = rl.save_history(path);
    }
}
