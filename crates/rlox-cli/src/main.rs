use std::{
    env, fs,
    io::{self, BufRead, Write},
    process::ExitCode,
};

use rlox::{InterpretError, Vm};

/// Exit codes: 0 success, 2 improper usage, 65 compile error, 70 runtime
/// error, 74 file read error.
fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: rlox [script]");
            ExitCode::from(2)
        }
    }
}

fn run_file(path: &str) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read {path}: {err}");
            return ExitCode::from(74);
        }
    };

    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ InterpretError::Compile(_)) => {
            eprintln!("{err}");
            ExitCode::from(65)
        }
        Err(err @ InterpretError::Runtime(_)) => {
            eprintln!("{err}");
            ExitCode::from(70)
        }
    }
}

/// Line-at-a-time loop against one persistent VM: globals, interned strings,
/// and defined functions and classes survive across lines. Errors print and
/// the session continues.
fn repl() -> ExitCode {
    let mut vm = Vm::new();
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let Some(line) = lines.next() else {
            // EOF (ctrl-D).
            println!();
            return ExitCode::SUCCESS;
        };
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                eprintln!("Could not read line: {err}");
                return ExitCode::from(74);
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Err(err) = vm.interpret(&line) {
            eprintln!("{err}");
        }
    }
}
