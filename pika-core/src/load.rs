//! File loading and the module system (`load` / `require` / `provide`).
//!
//! A relative filespec `name` resolves to `<sibling>/name.lisp` first (the
//! directory of the file currently being loaded, or the working directory
//! at top level), then `<libdir>/name.lisp`.  Absolute paths are honored
//! verbatim.  The loader keeps the machine's current-directory context
//! across nested loads and restores it on every exit path.

use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{LispError, LispResult};
use crate::eval::Machine;
use crate::value::Value;

/// The string behind a filespec or module-name form: a string or symbol.
pub fn module_name(v: &Value) -> Result<String, LispError> {
    match v {
        Value::Str(s) => Ok((**s).clone()),
        Value::Symbol(sym) => Ok(sym.name().to_string()),
        other => Err(LispError::type_error("string or symbol", other)),
    }
}

fn with_lisp_suffix(name: &str) -> String {
    if name.ends_with(".lisp") {
        name.to_string()
    } else {
        format!("{}.lisp", name)
    }
}

/// Resolve a filespec against the sibling directory and the library
/// directory.
pub fn resolve(m: &Machine, name: &str) -> Result<PathBuf, LispError> {
    let raw = Path::new(name);
    if raw.is_absolute() {
        if raw.exists() {
            return Ok(raw.to_path_buf());
        }
        return Err(LispError::io(format!("cannot find '{}'", name)));
    }
    let file = with_lisp_suffix(name);
    let mut candidates = Vec::new();
    match &m.current_dir {
        Some(dir) => candidates.push(dir.join(&file)),
        None => candidates.push(PathBuf::from(&file)),
    }
    if let Some(lib) = &m.lib_dir {
        candidates.push(lib.join(&file));
    }
    for candidate in &candidates {
        if candidate.exists() {
            return Ok(candidate.clone());
        }
    }
    Err(LispError::io(format!(
        "cannot find '{}' (tried {})",
        name,
        candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

/// Read every form from `path` (without evaluating).  Used by the code
/// generator to inline loaded files.
pub fn read_file_forms(m: &mut Machine, path: &Path) -> Result<Vec<Value>, LispError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| LispError::io(format!("cannot read '{}': {}", path.display(), e)))?;
    let mut src = crate::reader::StrSource::new(&content);
    let mut reader = crate::reader::Reader::new(&mut src, &mut m.st)
        .with_file(path.display().to_string());
    let mut forms = Vec::new();
    while let Some(form) = reader.read()? {
        forms.push(form);
    }
    Ok(forms)
}

/// `load`: read and evaluate every form from the referenced file; the
/// value is the last form's value.
pub fn load(m: &mut Machine, filespec: &Value) -> LispResult {
    let name = module_name(filespec)?;
    let path = resolve(m, &name)?;
    load_path(m, &path)
}

pub fn load_path(m: &mut Machine, path: &Path) -> LispResult {
    debug!("load {}", path.display());
    let forms = read_file_forms(m, path)?;
    let saved_dir = m.current_dir.take();
    m.current_dir = path.parent().map(Path::to_path_buf);
    let result = (|| {
        let mut last = Value::Nil;
        for form in &forms {
            last = m.eval_top(form)?;
        }
        Ok(last)
    })();
    m.current_dir = saved_dir;
    result
}

/// `require`: load unless the module is already present; after loading,
/// the file must have called `provide`.
pub fn require(m: &mut Machine, name_form: &Value, filespec: Option<&Value>) -> LispResult {
    let name = module_name(name_form)?;
    if m.has_module(&name) {
        return Ok(Value::Nil);
    }
    let spec = match filespec {
        Some(v) => module_name(v)?,
        None => name.clone(),
    };
    let path = resolve(m, &spec)?;
    load_path(m, &path)?;
    if !m.has_module(&name) {
        return Err(LispError::malformed(
            "require",
            format!("'{}' was loaded but did not provide '{}'", spec, name),
        ));
    }
    Ok(Value::Nil)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(tag: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("pika-{}-{}", tag, unique));
        fs::create_dir_all(&dir).expect("create temp fixture dir");
        dir
    }

    fn machine() -> Machine {
        Machine::with_output(Box::new(Vec::new()))
    }

    #[test]
    fn load_evaluates_and_returns_last() {
        let dir = temp_dir("load");
        fs::write(dir.join("lib.lisp"), "(define x 10)\n(+ x 1)").unwrap();

        let mut m = machine();
        m.current_dir = Some(dir.clone());
        let v = m.interpret_expression("(load \"lib\")").unwrap();
        assert_eq!(v.as_f64(), Some(11.0));
        assert_eq!(m.global_value("x").unwrap().as_long(), Some(10));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_resolves_siblings_of_the_loading_file() {
        let dir = temp_dir("sibling");
        fs::write(dir.join("a.lisp"), "(load \"b\") (define from-a 1)").unwrap();
        fs::write(dir.join("b.lisp"), "(define from-b 2)").unwrap();

        let mut m = machine();
        let path = dir.join("a.lisp");
        load_path(&mut m, &path).unwrap();
        assert_eq!(m.global_value("from-a").unwrap().as_long(), Some(1));
        assert_eq!(m.global_value("from-b").unwrap().as_long(), Some(2));
        // Context restored after the load.
        assert!(m.current_dir.is_none());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn lib_dir_is_consulted_after_sibling() {
        let sibling = temp_dir("sib2");
        let lib = temp_dir("lib2");
        fs::write(lib.join("util.lisp"), "(define from-lib 3)").unwrap();

        let mut m = machine();
        m.current_dir = Some(sibling.clone());
        m.lib_dir = Some(lib.clone());
        m.interpret_expression("(load util)").unwrap();
        assert_eq!(m.global_value("from-lib").unwrap().as_long(), Some(3));

        let _ = fs::remove_dir_all(&sibling);
        let _ = fs::remove_dir_all(&lib);
    }

    #[test]
    fn missing_file_is_io_error() {
        let mut m = machine();
        let err = m
            .interpret_expression("(load \"definitely-missing-pika-file\")")
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Io);
    }

    #[test]
    fn require_checks_provide() {
        let dir = temp_dir("require");
        fs::write(dir.join("good.lisp"), "(define g 1) (provide good)").unwrap();
        fs::write(dir.join("bad.lisp"), "(define b 2)").unwrap();

        let mut m = machine();
        m.current_dir = Some(dir.clone());
        m.interpret_expression("(require good)").unwrap();
        assert!(m.has_module("good"));
        // A second require does not reload.
        fs::remove_file(dir.join("good.lisp")).unwrap();
        m.interpret_expression("(require good)").unwrap();

        let err = m.interpret_expression("(require bad)").unwrap_err();
        assert!(err.message.contains("did not provide"), "{}", err);

        let _ = fs::remove_dir_all(&dir);
    }
}
