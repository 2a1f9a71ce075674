//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

/// Parse a transfer size like "4096", "0x800" or "2KiB"
fn parse_chunk_size(s: &str) -> Result<usize, String> {
    let lower = s.trim().to_lowercase();
    let (digits, multiplier) = if let Some(n) = lower.strip_suffix("kib") {
        (n.trim(), 1024)
    } else if let Some(n) = lower.strip_suffix('k') {
        (n.trim(), 1024)
    } else {
        (lower.as_str(), 1)
    };
    let size = parse_hex_u32(digits)? as usize * multiplier;
    if size == 0 {
        return Err("Chunk size must be non-zero".to_string());
    }
    Ok(size)
}

#[derive(Parser)]
#[command(name = "k230boot")]
#[command(author, version, about = "USB boot loader for Kendryte K230/K230D", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Board preset [available: k230, k230d; default: the plan's board, else k230d]
    #[arg(short, long, global = true)]
    pub board: Option<String>,

    /// Talk to a simulated mask ROM instead of USB hardware
    #[arg(long, global = true)]
    pub dummy: bool,

    /// Select the device by USB serial number
    #[arg(long, global = true)]
    pub serial: Option<String>,

    /// Maximum bytes per WriteMemory command (e.g. 4096, 2KiB)
    #[arg(long, global = true, value_parser = parse_chunk_size)]
    pub chunk_size: Option<usize>,

    /// Attempts per handshake, command and chunk before giving up
    #[arg(long, global = true)]
    pub retries: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List devices waiting in USB boot mode
    List,

    /// Handshake and print the chip identity
    Info,

    /// Jump back into the mask ROM loader
    Rom,

    /// Load an image into SRAM without running it
    Load {
        /// Image file
        file: PathBuf,

        /// Load address (hex with 0x prefix, or decimal) [default: 0x80360000]
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: Option<u32>,
    },

    /// Load an image into SRAM and jump to it
    Run {
        /// Image file
        file: PathBuf,

        /// Load and entry address (hex with 0x prefix, or decimal) [default: 0x80360000]
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: Option<u32>,
    },

    /// Run a staged boot from a plan file
    Boot {
        /// Boot plan (TOML)
        plan: PathBuf,

        /// Write every stage but do not hand off execution
        #[arg(long)]
        no_execute: bool,
    },

    /// Validate a plan file without touching a device
    Check {
        /// Boot plan (TOML)
        plan: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_load_defaults() {
        let cli = Cli::try_parse_from(["k230boot", "load", "fw.bin"]).unwrap();
        assert!(cli.board.is_none());
        assert!(!cli.dummy);
        match cli.command {
            Commands::Load { file, address } => {
                assert_eq!(file, PathBuf::from("fw.bin"));
                assert_eq!(address, None);
            }
            _ => panic!("expected load"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "k230boot", "run", "fw.bin", "-a", "0x80300000", "--dummy", "--chunk-size", "2KiB",
            "--retries", "5", "-vv", "--board", "k230",
        ])
        .unwrap();
        assert!(cli.dummy);
        assert_eq!(cli.board.as_deref(), Some("k230"));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.chunk_size, Some(2048));
        assert_eq!(cli.retries, Some(5));
        assert!(matches!(cli.command, Commands::Run { address: Some(0x8030_0000), .. }));
    }

    #[test]
    fn test_parse_chunk_size() {
        assert_eq!(parse_chunk_size("4096"), Ok(4096));
        assert_eq!(parse_chunk_size("0x800"), Ok(2048));
        assert_eq!(parse_chunk_size("4k"), Ok(4096));
        assert!(parse_chunk_size("0").is_err());
        assert!(parse_chunk_size("big").is_err());
    }
}
