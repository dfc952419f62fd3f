mod cli;
mod config;
mod defs;
mod logging;
mod magic_mount;
mod restorecon;
mod try_umount;
mod utils;

use std::process::ExitCode;

fn main() -> ExitCode {
    logging::init();

    match cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("magic-mount: {e:#}");
            ExitCode::FAILURE
        }
    }
}
