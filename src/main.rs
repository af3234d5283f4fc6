// File: src/main.rs
//
// Main entry point for the J* scripting language. Handles command-line
// argument parsing and dispatches to the `run` or `repl` subcommand.

mod ast;
mod builtins;
mod bytecode;
mod compiler;
mod errors;
mod gc;
mod lexer;
mod module;
mod parser;
mod repl;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use std::fs;
use std::path::PathBuf;

use errors::{RuffError, SourceLocation};
use vm::{RunError, Vm};

#[derive(ClapParser)]
#[command(
    name = "jstar",
    about = "J*: a lean, class-based scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a J* script file
    Run {
        /// Path to the .jsr file
        file: PathBuf,

        /// Arguments forwarded to the script as `sys.argv`
        #[arg(trailing_var_arg = true)]
        script_args: Vec<String>,
    },

    /// Launch the interactive J* REPL
    Repl,
}

/// Exit codes per spec.md §7: 0 success, 1 syntax error, 2 compile error,
/// 3 uncaught runtime exception.
const EXIT_SUCCESS: i32 = 0;
const EXIT_SYNTAX_ERROR: i32 = 1;
const EXIT_COMPILE_ERROR: i32 = 2;
const EXIT_RUNTIME_ERROR: i32 = 3;

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run { file, script_args }) => run_file(&file, &script_args),
        Some(Commands::Repl) | None => repl::Repl::new().run(),
    }
}

fn new_vm(script_dir: Option<&std::path::Path>) -> Vm {
    let mut vm = Vm::new();
    if let Some(dir) = script_dir {
        vm.add_search_path(dir);
    }
    vm
}

fn run_file(file: &PathBuf, script_args: &[String]) {
    let code = match fs::read_to_string(file) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: could not read '{}': {e}", file.display());
            std::process::exit(EXIT_COMPILE_ERROR);
        }
    };
    let filename = file.to_string_lossy().to_string();
    let module_name = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("main")
        .to_string();
    let script_dir = file.parent();

    let mut vm = new_vm(script_dir);
    let mut argv = vec![filename.clone()];
    argv.extend(script_args.iter().cloned());
    vm.set_sys_argv(&argv);
    match vm.run_source(&filename, &code, &module_name) {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(RunError::Syntax(errs)) => {
            print_stage_errors(&filename, "syntax", &errs);
            std::process::exit(EXIT_SYNTAX_ERROR);
        }
        Err(RunError::Compile(errs)) => {
            print_stage_errors(&filename, "compile", &errs);
            std::process::exit(EXIT_COMPILE_ERROR);
        }
        Err(RunError::Runtime { message, trace }) => {
            let err = RuffError::runtime_error(message, SourceLocation::with_file(0, 0, filename));
            eprintln!("{err}");
            for line in trace {
                eprintln!("{line}");
            }
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    }
}

fn print_stage_errors(filename: &str, stage: &str, errs: &[(u32, String)]) {
    if errs.is_empty() {
        eprintln!("{stage} error in '{filename}'");
        return;
    }
    for (line, msg) in errs {
        let err = RuffError::parse_error(msg.clone(), SourceLocation::with_file(*line as usize, 0, filename.to_string()));
        eprintln!("{err}");
    }
}
