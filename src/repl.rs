// File: src/repl.rs
//
// Interactive REPL (Read-Eval-Print Loop) for the J* scripting language.
// Provides an interactive shell for executing J* code with features like:
// - Multi-line input support for blocks that end with `end`
// - Command history with up/down arrow navigation
// - Line editing capabilities
// - Special commands (:help, :clear, :quit, :reset)
// - Persistent global state across inputs

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::errors::{RuffError, SourceLocation};
use crate::lexer::{self, Keyword, TokenKind};
use crate::value::Value;
use crate::vm::{RunError, Vm};

const MODULE_NAME: &str = "repl";

/// REPL session that maintains VM state and handles user interaction.
pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    /// Creates a new REPL session with a fresh VM.
    pub fn new() -> Self {
        let editor = DefaultEditor::new().expect("failed to initialize line editor");
        Repl { vm: Vm::new(), editor }
    }

    /// Displays the welcome banner with version and help information.
    fn show_banner(&self) {
        println!("{}", "╔══════════════════════════════════════════════════════╗".bright_cyan());
        println!(
            "{}",
            "║              J* REPL - Interactive Shell            ║".bright_cyan()
        );
        println!("{}", "╚══════════════════════════════════════════════════════╝".bright_cyan());
        println!();
        println!(
            "  {} Use {}{}{}{}",
            "Welcome!".bright_green(),
            ":".bright_blue(),
            "help".bright_yellow(),
            " for commands or ".bright_blue(),
            ":quit".bright_yellow()
        );
        println!("  {} Unfinished blocks continue until their matching 'end'", "Tip:".bright_magenta());
        println!();
    }

    /// Starts the REPL loop.
    pub fn run(&mut self) {
        self.show_banner();

        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "jstar> ".bright_green().to_string()
            } else {
                "  ...> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        } else {
                            break;
                        }
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if Self::is_input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (Ctrl+C to interrupt, :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "\nGoodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }
    }

    /// Handles special REPL commands starting with ':'.
    /// Returns true to continue the REPL, false to quit.
    fn handle_command(&mut self, cmd: &str) -> bool {
        match cmd {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => {
                println!("{}", "Goodbye!".bright_cyan());
                false
            }
            ":clear" | ":c" => {
                print!("\x1B[2J\x1B[1;1H");
                self.show_banner();
                true
            }
            ":reset" | ":r" => {
                self.vm = Vm::new();
                println!("{}", "reset environment".bright_green());
                true
            }
            _ => {
                println!(
                    "{} unknown command: {}. Type {}{}{}",
                    "Error:".bright_red(),
                    cmd.bright_yellow(),
                    ":".bright_blue(),
                    "help".bright_yellow(),
                    " for available commands.".bright_blue()
                );
                true
            }
        }
    }

    fn show_help(&self) {
        println!();
        println!("{}", "REPL Commands:".bright_cyan().bold());
        println!();
        println!("  {}{}  Display this help message", ":help".bright_yellow(), " or :h     ".dimmed());
        println!("  {}{}  Exit the REPL", ":quit".bright_yellow(), " or :q     ".dimmed());
        println!("  {}{}  Clear the screen", ":clear".bright_yellow(), " or :c    ".dimmed());
        println!("  {}{}  Reset the environment", ":reset".bright_yellow(), " or :r   ".dimmed());
        println!();
        println!("{}", "Navigation:".bright_cyan().bold());
        println!();
        println!("  {}  Navigate command history", "↑/↓ arrows".bright_blue());
        println!("  {}  Interrupt current input", "Ctrl+C    ".bright_blue());
        println!("  {}  Exit REPL", "Ctrl+D    ".bright_blue());
        println!();
        println!("{}", "Multi-line Input:".bright_cyan().bold());
        println!();
        println!("  Blocks (if/while/for/fun/class/try/with/begin) continue until");
        println!("  their matching 'end'; unclosed parens/brackets/braces also continue.");
        println!();
        println!("{}", "Examples:".bright_cyan().bold());
        println!();
        println!("  {}", "jstar> var x = 42".dimmed());
        println!("  {}", "jstar> fun greet(name)".dimmed());
        println!("  {}", "  ...>     print(\"Hello, \" + name)".dimmed());
        println!("  {}", "  ...> end".dimmed());
        println!("  {}", "jstar> greet(\"World\")".dimmed());
        println!();
    }

    /// Checks whether `input` forms a syntactically complete chunk: every
    /// block-opening keyword (`if`/`while`/`for`/`fun`/`class`/`try`/`with`/
    /// `begin`) has a matching `end`, and every paren/bracket/brace is
    /// closed. Mirrors the 1:1 keyword-to-`end` balance the grammar
    /// guarantees (see parser.rs's block-bodied statement productions).
    fn is_input_complete(input: &str) -> bool {
        if input.trim().is_empty() {
            return true;
        }

        let tokens = lexer::tokenize(input);
        let mut block_depth: i32 = 0;
        let mut parens: i32 = 0;
        let mut brackets: i32 = 0;
        let mut braces: i32 = 0;

        for tok in &tokens {
            match &tok.kind {
                TokenKind::Keyword(Keyword::If)
                | TokenKind::Keyword(Keyword::While)
                | TokenKind::Keyword(Keyword::For)
                | TokenKind::Keyword(Keyword::Fun)
                | TokenKind::Keyword(Keyword::Class)
                | TokenKind::Keyword(Keyword::Try)
                | TokenKind::Keyword(Keyword::With)
                | TokenKind::Keyword(Keyword::Begin) => block_depth += 1,
                TokenKind::Keyword(Keyword::End) => block_depth -= 1,
                TokenKind::LParen => parens += 1,
                TokenKind::RParen => parens -= 1,
                TokenKind::LBracket => brackets += 1,
                TokenKind::RBracket => brackets -= 1,
                TokenKind::LBrace => braces += 1,
                TokenKind::RBrace => braces -= 1,
                _ => {}
            }
        }

        block_depth <= 0 && parens <= 0 && brackets <= 0 && braces <= 0
    }

    /// Evaluates one chunk of input and prints the result or error.
    fn eval_input(&mut self, input: &str) {
        if input.trim().is_empty() {
            return;
        }

        match self.vm.run_repl_line("<repl>", input, MODULE_NAME) {
            Ok(value) => {
                if !matches!(value, Value::Null) {
                    self.print_value(value);
                }
            }
            Err(RunError::Syntax(errs)) => self.print_stage_errors("syntax", &errs),
            Err(RunError::Compile(errs)) => self.print_stage_errors("compile", &errs),
            Err(RunError::Runtime { message, trace }) => {
                let err = RuffError::runtime_error(message, SourceLocation::unknown());
                eprintln!("{err}");
                for line in trace {
                    eprintln!("{line}");
                }
            }
        }
    }

    fn print_stage_errors(&self, stage: &str, errs: &[(u32, String)]) {
        if errs.is_empty() {
            eprintln!("{stage} error");
            return;
        }
        for (line, msg) in errs {
            let err = RuffError::parse_error(msg.clone(), SourceLocation::new(*line as usize, 0));
            eprintln!("{err}");
        }
    }

    fn print_value(&mut self, value: Value) {
        let text = self.vm.stringify(value);
        println!("{} {}", "=>".bright_blue(), text.bright_white());
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new()
    }
}
