//! Device commands: list, info, rom

use k230boot_core::NoProgress;

use super::{connect, Context};
use crate::progress::IndicatifProgress;

/// List loaders waiting in USB boot mode
pub fn cmd_list(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    if ctx.dummy {
        println!("Simulated boot ROM (--dummy)");
        return Ok(());
    }
    list_usb()
}

#[cfg(feature = "usb")]
fn list_usb() -> Result<(), Box<dyn std::error::Error>> {
    let devices = k230boot_usb::K230Usb::list_devices()?;
    if devices.is_empty() {
        println!("No K230 devices in USB boot mode found");
        return Ok(());
    }
    for (i, device) in devices.iter().enumerate() {
        println!("{}: {}", i, device);
    }
    Ok(())
}

#[cfg(not(feature = "usb"))]
fn list_usb() -> Result<(), Box<dyn std::error::Error>> {
    Err("USB support not compiled in".into())
}

/// Handshake and print what the ROM reports
pub fn cmd_info(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let board = ctx.board(None)?;
    let mut session = ctx.open_session(board, ctx.session_config(None))?;
    connect(&mut session, board, &mut IndicatifProgress::new())?;

    if let Some(summary) = session.summary() {
        println!("Board:            {} ({})", board.name, board.description);
        println!("Chip:             {}", summary.chip.family);
        println!("CPU info:         {}", summary.chip.info);
        println!("Loader protocol:  {}", summary.protocol);
        println!("Chunk size:       {} bytes", session.chunk_size());
    }
    session.finish()?;
    Ok(())
}

/// Send the device back to the start of the mask ROM
pub fn cmd_rom(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let board = ctx.board(None)?;
    let mut session = ctx.open_session(board, ctx.session_config(None))?;
    connect(&mut session, board, &mut NoProgress)?;
    session.return_to_rom()?;
    println!("Returned to mask ROM");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy() -> Context {
        Context {
            dummy: true,
            ..Context::default()
        }
    }

    #[test]
    fn test_dummy_commands() {
        cmd_list(&dummy()).unwrap();
        cmd_info(&dummy()).unwrap();
        cmd_rom(&dummy()).unwrap();
    }

    #[test]
    fn test_unknown_board() {
        let ctx = Context {
            board: Some("k510".into()),
            ..dummy()
        };
        assert!(cmd_info(&ctx).is_err());
    }
}
