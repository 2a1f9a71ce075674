//! Board presets
//!
//! A preset names the SoC family and its physical memory map. The map is
//! handed to the sequencer so plans that target memory the board does not
//! have are rejected before the device is touched.

use k230boot_core::{ChipFamily, MemoryKind, MemoryMap, MemoryWindow};

/// Preset used when neither the command line nor the plan names one
pub const DEFAULT_BOARD: &str = "k230d";

/// Where the ROM loader conventionally places ad-hoc images
pub const DEFAULT_LOAD_ADDRESS: u32 = 0x8036_0000;

/// A board preset
#[derive(Debug, Clone, Copy)]
pub struct Board {
    /// Preset name used on the command line
    pub name: &'static str,
    /// Human-readable description
    pub description: &'static str,
    /// SoC family the ROM must report
    pub family: ChipFamily,
    /// On-chip SRAM (base, size)
    pub sram: (u32, u32),
    /// DRAM (base, size)
    pub dram: (u32, u32),
}

impl Board {
    /// Physical memory map for plan validation
    pub fn memory_map(&self) -> MemoryMap {
        MemoryMap::new()
            .window(MemoryWindow::new("sram", MemoryKind::Sram, self.sram.0, self.sram.1))
            .window(MemoryWindow::new("dram", MemoryKind::Dram, self.dram.0, self.dram.1))
    }

    /// CPU info string the simulated ROM reports for this board
    pub fn dummy_cpu_info(&self) -> String {
        format!("{}-DUMMY", self.family)
    }
}

/// All known presets
pub const BOARDS: &[Board] = &[
    Board {
        name: "k230",
        description: "Kendryte K230 with external LPDDR",
        family: ChipFamily::K230,
        sram: (0x8020_0000, 2 * 1024 * 1024),
        dram: (0x0000_0000, 0x8000_0000),
    },
    Board {
        name: "k230d",
        description: "Kendryte K230D with 128 MiB in-package LPDDR4",
        family: ChipFamily::K230D,
        sram: (0x8020_0000, 2 * 1024 * 1024),
        dram: (0x0000_0000, 128 * 1024 * 1024),
    },
];

/// Find a preset by name (case-insensitive)
pub fn find(name: &str) -> Option<&'static Board> {
    BOARDS.iter().find(|b| b.name.eq_ignore_ascii_case(name))
}

/// Comma-separated preset names for help and error text
pub fn board_names() -> String {
    BOARDS.iter().map(|b| b.name).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k230boot_core::Region;

    #[test]
    fn test_find_board() {
        assert_eq!(find("K230D").map(|b| b.family), Some(ChipFamily::K230D));
        assert_eq!(find("k230").map(|b| b.family), Some(ChipFamily::K230));
        assert!(find("k210").is_none());
        assert_eq!(board_names(), "k230, k230d");
        assert!(find(DEFAULT_BOARD).is_some());
    }

    #[test]
    fn test_default_load_address_is_in_sram() {
        for board in BOARDS {
            let map = board.memory_map();
            assert!(map.admits(&Region::sram(DEFAULT_LOAD_ADDRESS, 0x1000)));
            assert!(!map.admits(&Region::dram(DEFAULT_LOAD_ADDRESS, 0x1000)));
        }
    }
}
