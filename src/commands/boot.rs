//! Boot commands: load, run, boot, check

use std::path::Path;

use k230boot_core::{BootProgress, Region, Sequencer, SessionSummary, WritePlan};

use super::{connect, Context};
use crate::board::{self, Board};
use crate::image::FileImage;
use crate::plan_file::PlanFile;
use crate::progress::IndicatifProgress;

/// Load a single image into SRAM, and run it if `execute` is set
pub fn cmd_load(
    ctx: &Context,
    file: &Path,
    address: Option<u32>,
    execute: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let board = ctx.board(None)?;
    let address = address.unwrap_or(board::DEFAULT_LOAD_ADDRESS);
    let image = FileImage::open(file)?;
    let data = image.data();
    if data.is_empty() {
        return Err(format!("{} is empty", file.display()).into());
    }

    let size = u32::try_from(data.len())
        .map_err(|_| format!("{} is too large to load", file.display()))?;
    let region = Region::sram(address, size);
    if !board.memory_map().admits(&region) {
        return Err(format!(
            "{} bytes at 0x{:08X} do not fit in {} SRAM (0x{:08X}, {} bytes)",
            size, address, board.name, board.sram.0, board.sram.1
        )
        .into());
    }

    let mut session = ctx.open_session(board, ctx.session_config(None))?;
    let mut progress = IndicatifProgress::new();
    connect(&mut session, board, &mut progress)?;
    session.load(address, data, &mut progress)?;

    if execute {
        session.execute(address)?;
        println!(
            "Loaded {} bytes at 0x{:08X} and jumped to it",
            size, address
        );
    } else {
        session.finish()?;
        println!("Loaded {} bytes at 0x{:08X}", size, address);
    }
    Ok(())
}

/// Run a staged boot described by a plan file
pub fn cmd_boot(
    ctx: &Context,
    plan_path: &Path,
    no_execute: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    run_plan(ctx, plan_path, no_execute)?;
    Ok(())
}

fn run_plan(
    ctx: &Context,
    plan_path: &Path,
    no_execute: bool,
) -> Result<SessionSummary, Box<dyn std::error::Error>> {
    let file = PlanFile::from_toml_file(plan_path)?;
    let board = ctx.board(file.board.as_deref())?;
    let config = ctx.session_config(Some(&file.session));

    let mut session = ctx.open_session(board, config)?;
    let mut plan = build_plan(&file, board, session.chunk_size())?;
    if no_execute {
        plan.entry = None;
    }
    log::info!(
        "Plan {}: {} stage(s), {} bytes in {} chunk(s)",
        file.name.as_deref().unwrap_or("(unnamed)"),
        plan.stages.len(),
        plan.total_bytes(),
        plan.chunk_count()
    );

    // The chip must match the board before anything is written
    let mut progress = IndicatifProgress::new();
    connect(&mut session, board, &mut progress)?;
    session.stage(&plan, &mut progress)?;
    match plan.entry {
        Some(entry) => session.execute(entry)?,
        None => session.finish()?,
    }

    let summary = session
        .summary()
        .ok_or("session ended without identifying the chip")?;
    progress.complete(&summary);
    Ok(summary)
}

/// Validate a plan file and print what it would write
pub fn cmd_check(ctx: &Context, plan_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let file = PlanFile::from_toml_file(plan_path)?;
    let board = ctx.board(file.board.as_deref())?;
    let config = ctx.session_config(Some(&file.session));
    let plan = build_plan(&file, board, config.chunk_size_for(usize::MAX))?;

    println!(
        "Plan {} for {}: OK",
        file.name.as_deref().unwrap_or("(unnamed)"),
        board.name
    );
    for (i, stage) in plan.stages.iter().enumerate() {
        let call = if stage.call_after_write { " (DRAM init)" } else { "" };
        println!(
            "  {}. {:<16} {:>10} bytes -> {} 0x{:08X}{}",
            i + 1,
            stage.name,
            stage.len(),
            stage.region.kind,
            stage.region.base,
            call
        );
    }
    match plan.entry {
        Some(entry) => println!("Entry: 0x{:08X}", entry),
        None => println!("Entry: none (stages are written, nothing is executed)"),
    }
    println!(
        "{} bytes in {} chunk(s) of up to {} bytes",
        plan.total_bytes(),
        plan.chunk_count(),
        plan.chunk_size
    );
    Ok(())
}

fn build_plan(
    file: &PlanFile,
    board: &Board,
    chunk_size: usize,
) -> Result<WritePlan, Box<dyn std::error::Error>> {
    let images = file.load_images()?;
    let plan = file.boot_plan(&images)?;
    let sequencer = Sequencer::new(chunk_size).with_memory_map(board.memory_map());
    Ok(sequencer.build(&plan, &images)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("k230boot-{}-{}", name, std::process::id()));
            fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }

        fn write(&self, name: &str, data: &[u8]) -> PathBuf {
            let path = self.0.join(name);
            fs::write(&path, data).unwrap();
            path
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    const PLAN: &str = r#"
        [plan]
        name = "test"
        board = "k230d"

        [session]
        chunk_size = 1024

        [[stage]]
        name = "ddr"
        image = "ddr.bin"
        base = 0x80300000
        max_size = "64 KiB"
        dram_init = true

        [[stage]]
        name = "uboot"
        image = "u-boot.bin"
        base = 0x00200000
        max_size = "1 MiB"
        memory = "dram"
        requires = "ddr"
        execute = true
    "#;

    fn dummy() -> Context {
        Context {
            dummy: true,
            ..Context::default()
        }
    }

    #[test]
    fn test_boot_plan_on_dummy() {
        let dir = TempDir::new("boot");
        dir.write("ddr.bin", &[0xDD; 3000]);
        dir.write("u-boot.bin", &[0xB0; 5000]);
        let plan = dir.write("plan.toml", PLAN.as_bytes());

        let summary = run_plan(&dummy(), &plan, false).unwrap();
        assert_eq!(summary.stages_completed, 2);
        assert_eq!(summary.bytes_written, 8000);
        assert_eq!(summary.entry, Some(0x0020_0000));

        let summary = run_plan(&dummy(), &plan, true).unwrap();
        assert_eq!(summary.entry, None);
    }

    #[test]
    fn test_check_rejects_board_overflow() {
        let dir = TempDir::new("check");
        dir.write("ddr.bin", &[0xDD; 16]);
        dir.write("u-boot.bin", &[0xB0; 16]);
        let plan = dir.write("plan.toml", PLAN.as_bytes());
        cmd_check(&dummy(), &plan).unwrap();

        // 1 GiB of DRAM does not exist on a K230D
        let big = PLAN.replace("0x00200000", "0x40000000");
        let plan = dir.write("big.toml", big.as_bytes());
        assert!(cmd_check(&dummy(), &plan).is_err());

        let plan = dir.write("missing.toml", PLAN.replace("u-boot.bin", "nope.bin").as_bytes());
        assert!(cmd_check(&dummy(), &plan).is_err());
    }

    #[test]
    fn test_load_and_run_on_dummy() {
        let dir = TempDir::new("load");
        let image = dir.write("fw.bin", &[0x13; 10_000]);
        cmd_load(&dummy(), &image, None, false).unwrap();
        cmd_load(&dummy(), &image, Some(board::DEFAULT_LOAD_ADDRESS), true).unwrap();
    }

    #[test]
    fn test_load_rejects_bad_images() {
        let dir = TempDir::new("load-bad");
        let empty = dir.write("empty.bin", &[]);
        assert!(cmd_load(&dummy(), &empty, None, false).is_err());

        let image = dir.write("fw.bin", &[0x13; 64]);
        assert!(cmd_load(&dummy(), &image, Some(0x0010_0000), false).is_err());

        // The default address leaves no room for an image larger than the SRAM tail
        let tail = (0x8020_0000 + 2 * 1024 * 1024 - board::DEFAULT_LOAD_ADDRESS) as usize;
        let big = dir.write("big.bin", &vec![0x13; tail + 1]);
        assert!(cmd_load(&dummy(), &big, None, false).is_err());
    }
}
