use std::{env, path::PathBuf, process::ExitCode};

use poise::{CompileResult, Compiler, RunOutcome, StdPrint, Vm};

fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    let Some(file_arg) = args.next() else {
        eprintln!("Expected file");
        return ExitCode::from(1);
    };

    let file_path = PathBuf::from(file_arg);
    if !file_path.exists() {
        eprintln!("File not found");
        return ExitCode::from(1);
    }
    if file_path.extension().is_none_or(|ext| ext != "poise") {
        eprintln!("Invalid file type");
        return ExitCode::from(1);
    }

    let mut vm = Vm::new();
    match Compiler::compile_file(&mut vm, &file_path) {
        CompileResult::Success => {}
        CompileResult::CompileError => return ExitCode::from(2),
        CompileResult::ParseError => return ExitCode::from(3),
        CompileResult::FileError => return ExitCode::from(4),
    }

    match vm.run(&mut StdPrint) {
        RunOutcome::Success => ExitCode::SUCCESS,
        RunOutcome::RuntimeError => ExitCode::from(5),
    }
}
