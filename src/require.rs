//! The `require` loader: resolves a module name against caller-relative
//! candidates, caches results under canonical paths, and breaks require
//! cycles by pre-marking a module as "loading" with nil.

use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind, Result};
use crate::state::State;
use crate::value::Value;

fn candidate_paths(s: &State, name: &str) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if !name.starts_with('/') {
        // Prefer the directory of the file the call site lives in.
        if let Some(loc) = s.source_loc_of(&s.current_expr) {
            if !loc.file.is_empty() {
                let dir = Path::new(&loc.file).parent();
                if let Some(dir) = dir {
                    if !dir.as_os_str().is_empty() {
                        candidates.push(dir.join(name));
                    }
                }
            }
        }
    }
    candidates.push(PathBuf::from(name));
    candidates
}

pub(crate) fn builtin_require(s: &mut State, args: &Value) -> Result<Value> {
    let arg = args.car();
    let Some(name) = arg.string_value().map(str::to_string) else {
        return Err(Error::new(ErrorKind::RequiresString("require")));
    };

    let mut tried: Vec<String> = Vec::new();
    for cand in candidate_paths(s, &name) {
        let key = match std::fs::canonicalize(&cand) {
            Ok(p) => p.to_string_lossy().into_owned(),
            Err(_) => cand.to_string_lossy().into_owned(),
        };
        // A cache hit returns the stored value even when it is nil: nil is
        // the "loading" marker that stops require cycles from recursing.
        if let Some(v) = s.loaded_modules.get(&key) {
            return Ok(v.clone());
        }
        let Ok(src) = std::fs::read_to_string(&cand) else {
            tried.push(key);
            continue;
        };
        s.loaded_modules.insert(key.clone(), Value::nil());
        let forms = s.parse_all(&src, &key)?;
        let global = s.global;
        let res = s.do_list(&forms, global)?;
        s.loaded_modules.insert(key, res.clone());
        return Ok(res);
    }

    Err(Error::new(ErrorKind::ModuleNotFound {
        name,
        tried: tried.join(", "),
    }))
}
