//! Man page generator for k230boot
//!
//! Writes `k230boot.1` plus one `k230boot-<command>.1` page per subcommand.
//!
//! Usage: cargo run --bin gen-manpage -- [output-dir]

use clap::CommandFactory;
use std::fs;
use std::path::PathBuf;

#[path = "../cli.rs"]
mod cli;

/// Render every page as (file name, roff source)
fn render_pages() -> std::io::Result<Vec<(String, Vec<u8>)>> {
    let mut cmd = cli::Cli::command();
    // Propagates global flags into the subcommands
    cmd.build();

    let name = cmd.get_name().to_string();
    let mut pages = Vec::new();

    let mut buffer = Vec::new();
    clap_mangen::Man::new(cmd.clone()).render(&mut buffer)?;
    pages.push((format!("{}.1", name), buffer));

    for sub in cmd.get_subcommands().filter(|s| s.get_name() != "help") {
        let title = format!("{}-{}", name, sub.get_name());
        let mut buffer = Vec::new();
        clap_mangen::Man::new(sub.clone())
            .title(title.to_uppercase())
            .render(&mut buffer)?;
        pages.push((format!("{}.1", title), buffer));
    }
    Ok(pages)
}

fn main() -> std::io::Result<()> {
    let output_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("man"));
    fs::create_dir_all(&output_dir)?;

    let pages = render_pages()?;
    for (file, roff) in &pages {
        fs::write(output_dir.join(file), roff)?;
    }

    println!("{} man pages written to {}", pages.len(), output_dir.display());
    println!("\nTo view:");
    println!("  man -l {}", output_dir.join("k230boot.1").display());
    println!("  man -l {}", output_dir.join("k230boot-boot.1").display());
    println!("\nTo install system-wide (requires sudo):");
    println!(
        "  sudo cp {}/k230boot*.1 /usr/local/share/man/man1/ && sudo mandb",
        output_dir.display()
    );

    Ok(())
}
