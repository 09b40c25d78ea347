//! The `bramble` binary: runs a script file, or a REPL when no file is
//! given.
//!
//! Exit codes follow the sysexits convention: 0 on success, 65 for compile
//! errors, 70 for runtime errors, 74 for I/O errors.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bramble_core::{InterpretError, Vm};
use clap::Parser;
use reedline::{DefaultPrompt, DefaultPromptSegment, Reedline, Signal};
use tracing_subscriber::EnvFilter;

const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

/// Bramble - a small class-based scripting language
#[derive(Parser, Debug)]
#[command(name = "bramble")]
#[command(about = "Run Bramble programs", long_about = None)]
struct Args {
    /// Script to run; starts a REPL when omitted
    script: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.script {
        Some(path) => run_file(&path),
        None => repl(),
    }
}

fn run_file(path: &Path) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Could not read {}: {}", path.display(), error);
            return ExitCode::from(EX_IOERR);
        }
    };
    tracing::debug!(path = %path.display(), bytes = source.len(), "loaded script");
    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile) => ExitCode::from(EX_DATAERR),
        Err(InterpretError::Runtime) => ExitCode::from(EX_SOFTWARE),
    }
}

/// Reads one line at a time into a single persistent VM, so definitions
/// carry over between lines. Errors are reported and the session continues.
fn repl() -> ExitCode {
    let mut vm = Vm::new();
    let mut editor = Reedline::create();
    let prompt = DefaultPrompt::new(
        DefaultPromptSegment::Basic("bramble".to_string()),
        DefaultPromptSegment::Empty,
    );

    loop {
        match editor.read_line(&prompt) {
            Ok(Signal::Success(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = vm.interpret(&line);
            }
            Ok(Signal::CtrlC) => continue,
            Ok(Signal::CtrlD) => return ExitCode::SUCCESS,
            Err(error) => {
                eprintln!("I/O error: {}", error);
                return ExitCode::from(EX_IOERR);
            }
        }
    }
}
