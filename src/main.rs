//! k230boot - USB boot loader for Kendryte K230/K230D
//!
//! Talks to the mask ROM loader a K230 exposes when strapped for USB boot,
//! and uses it to place firmware in SRAM and DRAM and start it.
//!
//! # Architecture
//!
//! - `k230boot-core` holds the frame codec, the boot sequencer and the
//!   session state machine. It is transport-agnostic.
//! - `k230boot-usb` implements the transport over nusb.
//! - `k230boot-dummy` is a simulated ROM used for `--dummy` dry runs.
//!
//! Staged boots are described by TOML plan files; see `plan_file`.

mod board;
mod cli;
mod commands;
mod image;
mod plan_file;
mod progress;

use clap::Parser;
use cli::{Cli, Commands};
use commands::Context;

/// Default log filter for a `-v` count
fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG still wins when set
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_filter(cli.verbose)),
    )
    .init();

    let ctx = Context {
        board: cli.board,
        dummy: cli.dummy,
        serial: cli.serial,
        chunk_size: cli.chunk_size,
        retries: cli.retries,
    };

    match cli.command {
        Commands::List => commands::cmd_list(&ctx),
        Commands::Info => commands::cmd_info(&ctx),
        Commands::Rom => commands::cmd_rom(&ctx),
        Commands::Load { file, address } => commands::cmd_load(&ctx, &file, address, false),
        Commands::Run { file, address } => commands::cmd_load(&ctx, &file, address, true),
        Commands::Boot { plan, no_execute } => commands::cmd_boot(&ctx, &plan, no_execute),
        Commands::Check { plan } => commands::cmd_check(&ctx, &plan),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_sets_filter() {
        assert_eq!(log_filter(0), "info");
        assert_eq!(log_filter(1), "debug");
        assert_eq!(log_filter(2), "trace");
        assert_eq!(log_filter(5), "trace");

        let cli = Cli::try_parse_from(["k230boot", "-vv", "info"]).unwrap();
        assert_eq!(log_filter(cli.verbose), "trace");
    }
}
