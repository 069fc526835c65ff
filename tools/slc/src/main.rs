//! Shader language compiler
//!
//! Compiles a shader source file to a SPIR-V module:
//! `slc input.vsl [output.spv]`

use std::path::PathBuf;
use std::process::ExitCode;

use forge_engine::shaderc;

fn run(input: &PathBuf, output: &PathBuf) -> Result<(), String> {
    let source = std::fs::read_to_string(input)
        .map_err(|error| format!("failed to read {}: {error}", input.display()))?;

    let words = shaderc::compile(&source).map_err(|error| error.to_string())?;

    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    std::fs::write(output, bytes)
        .map_err(|error| format!("failed to write {}: {error}", output.display()))?;
    log::info!("wrote {}", output.display());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(input) = args.next().map(PathBuf::from) else {
        eprintln!("usage: slc <input> [output]");
        return ExitCode::FAILURE;
    };
    let output = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| input.with_extension("spv"));

    match run(&input, &output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}
