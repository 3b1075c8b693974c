//! The pika command line: REPL, script runner, and ahead-of-time
//! compiler driver.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use log::debug;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use pika_core::codegen::{self, rustc::HostCompiler};
use pika_core::reader::IoSource;
use pika_core::symbol::SpecialForm;
use pika_core::value::list_car;
use pika_core::{load, print_value, read_all, LispError, Machine, SymbolTable, Value};

const USAGE: &str = "\
Usage: pika [OPTIONS] [FILE…] [-- ARGS…]

Options:
  --eval EXPR     Evaluate EXPR and print the result
  --gen FILE      Emit generated Rust source for FILE
  --build FILE    Compile FILE to a native binary
  -o PATH         Output path for --gen / --build
  --lib DIR       Library directory for load/require
  --result        Print the last value after running files
  --help, -h      Show this help

With no files and a terminal on stdin, an interactive session starts
(:q quits, :r recompiles and reruns the last line natively); piped
stdin is read-eval-print.  Arguments after -- populate
*command-line-argument-list*.
";

struct Options {
    files: Vec<String>,
    eval: Vec<String>,
    gen: Option<String>,
    build: Option<String>,
    out: Option<PathBuf>,
    lib_dir: Option<PathBuf>,
    show_result: bool,
    script_args: Vec<String>,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        files: Vec::new(),
        eval: Vec::new(),
        gen: None,
        build: None,
        out: None,
        lib_dir: None,
        show_result: false,
        script_args: Vec::new(),
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--eval" => {
                i += 1;
                let expr = args.get(i).ok_or("--eval requires an expression")?;
                options.eval.push(expr.clone());
            }
            "--gen" => {
                i += 1;
                let file = args.get(i).ok_or("--gen requires a file")?;
                options.gen = Some(file.clone());
            }
            "--build" => {
                i += 1;
                let file = args.get(i).ok_or("--build requires a file")?;
                options.build = Some(file.clone());
            }
            "-o" => {
                i += 1;
                let path = args.get(i).ok_or("-o requires a path")?;
                options.out = Some(PathBuf::from(path));
            }
            "--lib" => {
                i += 1;
                let dir = args.get(i).ok_or("--lib requires a directory")?;
                options.lib_dir = Some(PathBuf::from(dir));
            }
            "--result" => options.show_result = true,
            "--help" | "-h" => return Err(USAGE.to_string()),
            "--" => {
                options.script_args = args[i + 1..].to_vec();
                break;
            }
            other if other.starts_with('-') => {
                return Err(format!("unknown option: {}\n{}", other, USAGE));
            }
            file => options.files.push(file.to_string()),
        }
        i += 1;
    }
    Ok(options)
}

fn main() -> ExitCode {
    env_logger::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{}", message);
            return ExitCode::FAILURE;
        }
    };

    if let Some(file) = &options.gen {
        return generate(file, options.out.as_deref(), options.lib_dir.as_deref(), false);
    }
    if let Some(file) = &options.build {
        return generate(file, options.out.as_deref(), options.lib_dir.as_deref(), true);
    }

    let mut machine = Machine::new();
    machine.lib_dir = options.lib_dir.clone();
    machine.set_command_line(options.script_args.clone());

    for expr in &options.eval {
        match machine.interpret_expression(expr) {
            Ok(value) => println!("{}", print_value(&value, true)),
            Err(e) => return report(e),
        }
    }

    if !options.files.is_empty() {
        machine.set_input(Box::new(IoSource::new(std::io::stdin())));
        let mut last = None;
        for file in &options.files {
            match load::load_path(&mut machine, Path::new(file)) {
                Ok(value) => last = Some(value),
                Err(e) => return report(e),
            }
        }
        if options.show_result {
            if let Some(value) = last {
                println!("==> {}", print_value(&value, true));
            }
        }
        return ExitCode::SUCCESS;
    }

    if !options.eval.is_empty() {
        return ExitCode::SUCCESS;
    }

    if std::io::stdin().is_terminal() {
        repl(machine)
    } else {
        batch(machine)
    }
}

fn report(e: LispError) -> ExitCode {
    eprintln!("{}", e);
    ExitCode::FAILURE
}

/// Interactive session with line editing.  `:r` recompiles the last
/// successfully interpreted line through the code generator and runs the
/// produced binary.
fn repl(mut machine: Machine) -> ExitCode {
    println!(
        "Pika {} — :q or Ctrl-D quits, :r reruns the last line compiled",
        env!("CARGO_PKG_VERSION")
    );
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("cannot start line editor: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut last_line: Option<String> = None;
    loop {
        match editor.readline("pika> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == ":q" {
                    return ExitCode::SUCCESS;
                }
                if trimmed == ":r" {
                    match &last_line {
                        Some(source) => {
                            if let Err(e) = compile_and_run(source) {
                                eprintln!("{}", e);
                            }
                        }
                        None => eprintln!("nothing to rerun"),
                    }
                    continue;
                }
                let _ = editor.add_history_entry(trimmed);
                match machine.interpret_expression(&line) {
                    Ok(value) => {
                        println!("==> {}", print_value(&value, true));
                        last_line = Some(line.clone());
                    }
                    Err(e) => eprintln!("{}", e),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => return ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        }
    }
}

/// Piped stdin: read-eval-print each top-level form.
fn batch(mut machine: Machine) -> ExitCode {
    let mut source = String::new();
    if let Err(e) = std::io::Read::read_to_string(&mut std::io::stdin(), &mut source) {
        eprintln!("cannot read stdin: {}", e);
        return ExitCode::FAILURE;
    }
    let forms = match read_all(&source, &mut machine.st) {
        Ok(forms) => forms,
        Err(e) => return report(e),
    };
    for form in &forms {
        match machine.eval_top(form) {
            Ok(value) => println!("==> {}", print_value(&value, true)),
            Err(e) => return report(e),
        }
    }
    ExitCode::SUCCESS
}

/// The `:r` round trip: lower the line to host source, build it, run the
/// binary with inherited stdio.
fn compile_and_run(source: &str) -> Result<(), LispError> {
    let unit_source = echo_wrapped(source)?;
    let generated = codegen::generate_source(&unit_source, "repl")?;
    let compiler = HostCompiler::new()?;
    let binary = compiler.compile(&generated, "repl")?;
    let status = std::process::Command::new(&binary)
        .status()
        .map_err(|e| LispError::io(format!("cannot run {}: {}", binary.display(), e)))?;
    if !status.success() {
        return Err(LispError::io(format!(
            "compiled form exited with {}",
            status
        )));
    }
    Ok(())
}

/// Rewrite a line so the compiled program echoes its final value the way
/// the interpreter does.  The generated `main` itself prints nothing, so
/// the final expression is wrapped in write/writeln; forms that are only
/// legal at top level (definitions and friends) stay unwrapped.
fn echo_wrapped(source: &str) -> Result<String, LispError> {
    let mut st = SymbolTable::new();
    let forms = read_all(source, &mut st)?;
    let mut out = String::new();
    let count = forms.len();
    for (i, form) in forms.iter().enumerate() {
        let printed = print_value(form, true);
        if i + 1 == count && !is_toplevel_only(form) {
            out.push_str(&format!("(write \"==> \" nil) (writeln {})\n", printed));
        } else {
            out.push_str(&printed);
            out.push('\n');
        }
    }
    Ok(out)
}

fn is_toplevel_only(form: &Value) -> bool {
    matches!(
        list_car(form).as_symbol().and_then(|s| s.special_form()),
        Some(
            SpecialForm::Define
                | SpecialForm::Defun
                | SpecialForm::Defmacro
                | SpecialForm::Load
                | SpecialForm::Require
                | SpecialForm::Provide
                | SpecialForm::Declaim
                | SpecialForm::Progn
        )
    )
}

/// `--gen` / `--build`: lower a compilation unit to Rust source, and
/// optionally drive the host compiler to a binary.
fn generate(file: &str, out: Option<&Path>, lib_dir: Option<&Path>, build: bool) -> ExitCode {
    let source = match codegen::generate_file(Path::new(file), lib_dir) {
        Ok(source) => source,
        Err(e) => return report(e),
    };
    if !build {
        match out {
            Some(path) => {
                if let Err(e) = std::fs::write(path, source) {
                    eprintln!("cannot write {}: {}", path.display(), e);
                    return ExitCode::FAILURE;
                }
            }
            None => print!("{}", source),
        }
        return ExitCode::SUCCESS;
    }

    let unit = Path::new(file)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "unit".to_string());
    let compiler = match HostCompiler::new() {
        Ok(compiler) => compiler,
        Err(e) => return report(e),
    };
    let binary = match compiler.compile(&source, &unit) {
        Ok(binary) => binary,
        Err(e) => return report(e),
    };
    let dest = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(&unit));
    if let Err(e) = std::fs::copy(&binary, &dest) {
        eprintln!("cannot copy binary to {}: {}", dest.display(), e);
        return ExitCode::FAILURE;
    }
    debug!("built {}", dest.display());
    println!("{}", dest.display());
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_files_and_flags() {
        let args: Vec<String> = ["--lib", "/lib", "a.lisp", "b.lisp", "--result"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let options = parse_args(&args).unwrap();
        assert_eq!(options.files, vec!["a.lisp", "b.lisp"]);
        assert_eq!(options.lib_dir.as_deref(), Some(Path::new("/lib")));
        assert!(options.show_result);
    }

    #[test]
    fn parses_script_args_after_separator() {
        let args: Vec<String> = ["run.lisp", "--", "--not-an-option", "x"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let options = parse_args(&args).unwrap();
        assert_eq!(options.files, vec!["run.lisp"]);
        assert_eq!(options.script_args, vec!["--not-an-option", "x"]);
    }

    #[test]
    fn rejects_unknown_options() {
        let args = vec!["--frobnicate".to_string()];
        assert!(parse_args(&args).is_err());
    }

    #[test]
    fn eval_option_requires_argument() {
        let args = vec!["--eval".to_string()];
        assert!(parse_args(&args).is_err());
    }

    #[test]
    fn echo_wrapping_marks_the_final_expression() {
        let out = echo_wrapped("(define a 1) (+ a 1)").unwrap();
        assert!(out.contains("(define a 1)"), "{}", out);
        assert!(out.contains("(writeln (+ a 1))"), "{}", out);
        assert!(out.contains("\"==> \""), "{}", out);
    }

    #[test]
    fn echo_wrapping_leaves_definitions_unwrapped() {
        let out = echo_wrapped("(defun f (x) x)").unwrap();
        assert!(!out.contains("writeln"), "{}", out);
        assert!(out.contains("(defun f (x) x)"), "{}", out);
    }

    #[test]
    fn echo_wrapping_wraps_atoms() {
        let out = echo_wrapped("42").unwrap();
        assert!(out.contains("(writeln 42)"), "{}", out);
    }
}
