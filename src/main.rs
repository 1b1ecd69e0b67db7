// src/main.rs

use std::process::ExitCode;

use planloop::{cli, logging, run};

/// Exit status when the plan ran but some missions failed.
const MISSIONS_FAILED: u8 = 2;

// The engine holds `Rc` callbacks and must stay on one thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = cli::parse();
    if let Err(err) = logging::init_logging(args.log_level) {
        eprintln!("planloop error: {err:?}");
        return ExitCode::FAILURE;
    }
    match run(args).await {
        Ok(Some(summary)) if summary.missions_failed > 0 => ExitCode::from(MISSIONS_FAILED),
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("planloop error: {err:?}");
            ExitCode::FAILURE
        }
    }
}
