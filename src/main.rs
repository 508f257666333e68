use std::path::PathBuf;

use clap::Parser;

use nanlisp::{error, repl, value, State};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// Script to run; the REPL starts when omitted.
    script: Option<PathBuf>,
}

fn run_script(state: &mut State, path: &PathBuf) -> i32 {
    let Ok(src) = std::fs::read_to_string(path) else {
        eprintln!("could not open file: {}", path.display());
        return 1;
    };
    let name = path.to_string_lossy().into_owned();
    let forms = match state.parse_all(&src, &name) {
        Ok(forms) => forms,
        Err(err) => {
            error::report(state, &err);
            return 1;
        }
    };
    let global = state.global;
    match state.do_list(&forms, global) {
        Ok(v) => {
            println!("{}", v.render());
            0
        }
        Err(err) => {
            error::report(state, &err);
            1
        }
    }
}

fn main() {
    if !value::pointers_fit_payload() {
        eprintln!(
            "nanlisp: unsupported platform: heap pointers do not fit in 48 bits, \
             which the NaN-boxed value representation requires."
        );
        std::process::exit(1);
    }

    let options = Options::parse();

    let mut state = State::new();
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let argv_list = state.make_string_list(&argv);
    state.bind_global("argv", argv_list);

    let code = match &options.script {
        Some(path) => run_script(&mut state, path),
        None => {
            repl::run(&mut state);
            0
        }
    };
    drop(state);
    std::process::exit(code);
}
