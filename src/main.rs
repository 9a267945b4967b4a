//! beadflow - Orchestrates coding-agent sessions over a bead backlog

use std::process::ExitCode;

fn main() -> ExitCode {
    if let Err(e) = beadflow::cli::run() {
        eprintln!("Error: {:#}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
