//! Boot plan types
//!
//! A [`BootPlan`] is the caller's description of what to load: an ordered
//! list of [`StageDescriptor`]s, each naming a target [`Region`] and the
//! [`SourceRange`] of an image to place there. Plans are only descriptions;
//! the [`Sequencer`](crate::Sequencer) validates them and produces the
//! concrete writes.

use core::fmt;

use bitflags::bitflags;

/// Kind of memory backing a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// On-chip SRAM, usable straight out of reset
    Sram,
    /// External or in-package DRAM, usable only after training
    Dram,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::Sram => f.write_str("SRAM"),
            MemoryKind::Dram => f.write_str("DRAM"),
        }
    }
}

/// A target memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Base address
    pub base: u32,
    /// Maximum number of bytes the region can hold
    pub max_size: u32,
    /// Backing memory kind
    pub kind: MemoryKind,
}

impl Region {
    /// Create a region
    pub const fn new(base: u32, max_size: u32, kind: MemoryKind) -> Self {
        Self {
            base,
            max_size,
            kind,
        }
    }

    /// Create an SRAM region
    pub const fn sram(base: u32, max_size: u32) -> Self {
        Self::new(base, max_size, MemoryKind::Sram)
    }

    /// Create a DRAM region
    pub const fn dram(base: u32, max_size: u32) -> Self {
        Self::new(base, max_size, MemoryKind::Dram)
    }

    /// Last address of the region (inclusive), or `None` if it wraps
    pub fn end(&self) -> Option<u32> {
        match self.max_size {
            0 => None,
            size => self.base.checked_add(size - 1),
        }
    }

    /// Check if an address is within this region
    pub fn contains(&self, addr: u32) -> bool {
        match self.end() {
            Some(end) => addr >= self.base && addr <= end,
            None => false,
        }
    }

    /// Check if this region overlaps with another
    pub fn overlaps(&self, other: &Region) -> bool {
        match (self.end(), other.end()) {
            (Some(end), Some(other_end)) => self.base <= other_end && other.base <= end,
            _ => false,
        }
    }
}

/// A byte range of a named image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRange {
    /// Image name, looked up in the [`ImageSet`](crate::ImageSet)
    pub image: String,
    /// Offset into the image
    pub offset: u64,
    /// Number of bytes
    pub length: u64,
}

impl SourceRange {
    /// Create a source range
    pub fn new(image: impl Into<String>, offset: u64, length: u64) -> Self {
        Self {
            image: image.into(),
            offset,
            length,
        }
    }
}

bitflags! {
    /// Stage behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StageFlags: u8 {
        /// Execution is handed off to this stage after loading
        const EXECUTE   = 1 << 0;
        /// This stage trains DRAM; it is called before any DRAM stage loads
        const DRAM_INIT = 1 << 1;
    }
}

/// One firmware stage of a boot plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    /// Unique stage name
    pub name: String,
    /// Target region
    pub region: Region,
    /// Where the stage's bytes come from
    pub source: SourceRange,
    /// Stage that must be loaded before this one
    pub requires: Option<String>,
    /// Behaviour flags
    pub flags: StageFlags,
}

impl StageDescriptor {
    /// Create a stage with no predecessor and no flags
    pub fn new(name: impl Into<String>, region: Region, source: SourceRange) -> Self {
        Self {
            name: name.into(),
            region,
            source,
            requires: None,
            flags: StageFlags::empty(),
        }
    }

    /// Set the predecessor stage
    pub fn requires(mut self, stage: impl Into<String>) -> Self {
        self.requires = Some(stage.into());
        self
    }

    /// Set the stage flags
    pub fn with_flags(mut self, flags: StageFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether execution is handed off to this stage
    pub fn is_handoff(&self) -> bool {
        self.flags.contains(StageFlags::EXECUTE)
    }

    /// Whether this stage trains DRAM
    pub fn is_dram_init(&self) -> bool {
        self.flags.contains(StageFlags::DRAM_INIT)
    }
}

/// Ordered list of stages plus an optional entry override
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootPlan {
    /// Stages in load order
    pub stages: Vec<StageDescriptor>,
    /// Entry address; defaults to the handoff stage's base
    pub entry: Option<u32>,
}

impl BootPlan {
    /// Create an empty plan
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage
    pub fn stage(mut self, stage: StageDescriptor) -> Self {
        self.stages.push(stage);
        self
    }

    /// Override the entry address
    pub fn with_entry(mut self, entry: u32) -> Self {
        self.entry = Some(entry);
        self
    }

    /// Find a stage by name
    pub fn find(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The stage execution is handed off to, if any
    pub fn handoff(&self) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.is_handoff())
    }
}

/// A window of physical memory on the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryWindow {
    /// Human-readable name
    pub name: String,
    /// Memory kind
    pub kind: MemoryKind,
    /// Base address
    pub base: u32,
    /// Size in bytes
    pub size: u32,
}

impl MemoryWindow {
    /// Create a memory window
    pub fn new(name: impl Into<String>, kind: MemoryKind, base: u32, size: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            base,
            size,
        }
    }

    /// Check if a region lies entirely inside this window
    pub fn contains(&self, region: &Region) -> bool {
        let Some(region_end) = region.end() else {
            return false;
        };
        let window_end = self.base as u64 + self.size as u64;
        region.base >= self.base && (region_end as u64) < window_end
    }
}

/// Physical memory map of a board
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryMap {
    /// Known memory windows
    pub windows: Vec<MemoryWindow>,
}

impl MemoryMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a window
    pub fn window(mut self, window: MemoryWindow) -> Self {
        self.windows.push(window);
        self
    }

    /// Check that a region lies inside a window of its own kind
    pub fn admits(&self, region: &Region) -> bool {
        self.windows
            .iter()
            .any(|w| w.kind == region.kind && w.contains(region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_end_and_wrap() {
        assert_eq!(Region::sram(0x8000_0000, 0x1000).end(), Some(0x8000_0FFF));
        assert_eq!(Region::sram(0xFFFF_F000, 0x1000).end(), Some(0xFFFF_FFFF));
        assert_eq!(Region::sram(0xFFFF_F000, 0x1001).end(), None);
        assert_eq!(Region::sram(0x1000, 0).end(), None);
    }

    #[test]
    fn test_region_overlap() {
        let a = Region::sram(0x8000_0000, 0x1000);
        let b = Region::sram(0x8000_1000, 0x1000);
        let c = Region::dram(0x8000_0800, 0x1000);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
        assert!(a.contains(0x8000_0FFF));
        assert!(!a.contains(0x8000_1000));
    }

    #[test]
    fn test_memory_map_admits() {
        let map = MemoryMap::new()
            .window(MemoryWindow::new("sram", MemoryKind::Sram, 0x8020_0000, 0x20_0000))
            .window(MemoryWindow::new("dram", MemoryKind::Dram, 0, 0x800_0000));

        assert!(map.admits(&Region::sram(0x8030_0000, 0x1000)));
        assert!(map.admits(&Region::sram(0x803F_F000, 0x1000)));
        assert!(!map.admits(&Region::sram(0x803F_F000, 0x1001)));
        // Right range, wrong kind
        assert!(!map.admits(&Region::dram(0x8030_0000, 0x1000)));
        assert!(map.admits(&Region::dram(0x20_0000, 0x10_0000)));
    }

    #[test]
    fn test_plan_builder() {
        let plan = BootPlan::new()
            .stage(StageDescriptor::new(
                "ddr",
                Region::sram(0x8030_0000, 0x1_0000),
                SourceRange::new("ddr.bin", 0, 0x800),
            )
            .with_flags(StageFlags::DRAM_INIT))
            .stage(
                StageDescriptor::new(
                    "uboot",
                    Region::dram(0x20_0000, 0x10_0000),
                    SourceRange::new("u-boot.bin", 0, 0x8000),
                )
                .requires("ddr")
                .with_flags(StageFlags::EXECUTE),
            )
            .with_entry(0x20_0000);

        assert_eq!(plan.stages.len(), 2);
        assert!(plan.find("ddr").map(|s| s.is_dram_init()).unwrap_or(false));
        assert_eq!(plan.handoff().map(|s| s.name.as_str()), Some("uboot"));
        assert_eq!(plan.entry, Some(0x20_0000));
    }
}
