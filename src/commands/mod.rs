//! CLI command implementations
//!
//! Every command opens a [`Session`] over either the USB loader or the
//! simulated ROM from `k230boot-dummy`, so `--dummy` exercises exactly the
//! same code paths as real hardware.

mod boot;
mod device;

pub use boot::{cmd_boot, cmd_check, cmd_load};
pub use device::{cmd_info, cmd_list, cmd_rom};

use k230boot_core::{BootProgress, ChipIdentity, Session, SessionConfig, Transport};
use k230boot_dummy::{DummyConfig, DummyRom};

use crate::board::{self, Board};
use crate::plan_file::SessionOverrides;

/// A session over whichever transport the command line selected
pub type BoxedSession = Session<Box<dyn Transport>>;

/// Options shared by every command
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// `--board`
    pub board: Option<String>,
    /// `--dummy`
    pub dummy: bool,
    /// `--serial`
    pub serial: Option<String>,
    /// `--chunk-size`
    pub chunk_size: Option<usize>,
    /// `--retries`
    pub retries: Option<u32>,
}

impl Context {
    /// Resolve the board preset
    ///
    /// `--board` wins over the board a plan file names.
    pub fn board(&self, plan_board: Option<&str>) -> Result<&'static Board, Box<dyn std::error::Error>> {
        let name = self
            .board
            .as_deref()
            .or(plan_board)
            .unwrap_or(board::DEFAULT_BOARD);
        board::find(name).ok_or_else(|| {
            format!(
                "Unknown board '{}'. Available boards: {}",
                name,
                board::board_names()
            )
            .into()
        })
    }

    /// Session settings: defaults, then plan overrides, then flags
    pub fn session_config(&self, overrides: Option<&SessionOverrides>) -> SessionConfig {
        let mut config = SessionConfig::default();
        if let Some(overrides) = overrides {
            overrides.apply(&mut config);
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        if let Some(n) = self.retries {
            config.handshake_attempts = n;
            config.command_attempts = n;
            config.write_attempts = n;
        }
        config
    }

    /// Open the selected transport
    pub fn open_transport(&self, board: &Board) -> Result<Box<dyn Transport>, Box<dyn std::error::Error>> {
        if self.dummy {
            log::info!("Using simulated {} mask ROM", board.family);
            let rom = DummyRom::new(DummyConfig {
                cpu_info: board.dummy_cpu_info(),
                dram_base: board.dram.0,
                dram_size: board.dram.1,
                ..DummyConfig::default()
            });
            return Ok(Box::new(rom));
        }
        open_usb(self)
    }

    /// Open a transport and wrap it in a session
    pub fn open_session(
        &self,
        board: &Board,
        config: SessionConfig,
    ) -> Result<BoxedSession, Box<dyn std::error::Error>> {
        let transport = self.open_transport(board)?;
        Ok(Session::new(transport, config))
    }
}

#[cfg(feature = "usb")]
fn open_usb(ctx: &Context) -> Result<Box<dyn Transport>, Box<dyn std::error::Error>> {
    let usb = k230boot_usb::K230Usb::open_with_config(k230boot_usb::UsbConfig {
        serial: ctx.serial.clone(),
        index: 0,
    })?;
    Ok(Box::new(k230boot_usb::RomBridge::new(usb)))
}

#[cfg(not(feature = "usb"))]
fn open_usb(_ctx: &Context) -> Result<Box<dyn Transport>, Box<dyn std::error::Error>> {
    Err("USB support not compiled in (rebuild with --features usb, or use --dummy)".into())
}

/// Handshake and identify, then make sure the chip matches the board
fn connect(
    session: &mut BoxedSession,
    board: &Board,
    progress: &mut dyn BootProgress,
) -> Result<ChipIdentity, Box<dyn std::error::Error>> {
    progress.state_changed(session.state());
    let protocol = session.handshake()?;
    progress.state_changed(session.state());
    let chip = session.identify()?;
    progress.state_changed(session.state());
    log::info!("Found {} (loader protocol {})", chip, protocol);

    if chip.family != board.family {
        return Err(format!(
            "Board '{}' expects a {} but the device reports {}",
            board.name, board.family, chip
        )
        .into());
    }
    Ok(chip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::find;
    use k230boot_core::{NoProgress, SessionState};

    #[derive(Default)]
    struct StateLog(Vec<SessionState>);

    impl BootProgress for StateLog {
        fn state_changed(&mut self, state: SessionState) {
            self.0.push(state);
        }
    }

    #[test]
    fn test_board_resolution() {
        let ctx = Context::default();
        assert_eq!(ctx.board(None).unwrap().name, "k230d");
        assert_eq!(ctx.board(Some("k230")).unwrap().name, "k230");

        let ctx = Context {
            board: Some("k230d".into()),
            ..Context::default()
        };
        assert_eq!(ctx.board(Some("k230")).unwrap().name, "k230d");

        let ctx = Context {
            board: Some("k210".into()),
            ..Context::default()
        };
        let err = ctx.board(None).unwrap_err();
        assert!(err.to_string().contains("k230, k230d"));
    }

    #[test]
    fn test_flags_override_plan_settings() {
        let overrides = SessionOverrides {
            chunk_size: Some(1024),
            write_attempts: Some(7),
            ..SessionOverrides::default()
        };
        let ctx = Context {
            chunk_size: Some(2048),
            ..Context::default()
        };
        let config = ctx.session_config(Some(&overrides));
        assert_eq!(config.chunk_size, 2048);
        assert_eq!(config.write_attempts, 7);

        let ctx = Context {
            retries: Some(1),
            ..Context::default()
        };
        let config = ctx.session_config(Some(&overrides));
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.write_attempts, 1);
        assert_eq!(config.handshake_attempts, 1);
    }

    #[test]
    fn test_dummy_session_identifies_board() {
        for name in ["k230", "k230d"] {
            let board = find(name).unwrap();
            let ctx = Context {
                dummy: true,
                ..Context::default()
            };
            let mut session = ctx.open_session(board, ctx.session_config(None)).unwrap();
            let chip = connect(&mut session, board, &mut NoProgress).unwrap();
            assert_eq!(chip.family, board.family);
        }
    }

    #[test]
    fn test_board_mismatch_is_rejected() {
        let ctx = Context {
            dummy: true,
            ..Context::default()
        };
        let k230d = find("k230d").unwrap();
        let mut session = ctx.open_session(k230d, ctx.session_config(None)).unwrap();
        let err = connect(&mut session, find("k230").unwrap(), &mut NoProgress).unwrap_err();
        assert!(err.to_string().contains("expects a K230"));
    }

    #[test]
    fn test_connect_reports_states() {
        let ctx = Context {
            dummy: true,
            ..Context::default()
        };
        let board = find("k230d").unwrap();
        let mut session = ctx.open_session(board, ctx.session_config(None)).unwrap();
        let mut log = StateLog::default();
        connect(&mut session, board, &mut log).unwrap();
        assert_eq!(
            log.0,
            vec![
                SessionState::Disconnected,
                SessionState::Handshaking,
                SessionState::Identified
            ]
        );
    }
}
