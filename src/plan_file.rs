//! TOML boot plan files
//!
//! ```toml
//! [plan]
//! name = "k230d-uboot"
//! board = "k230d"
//!
//! [session]
//! chunk_size = "4 KiB"
//! write_attempts = 5
//!
//! [[stage]]
//! name = "ddr"
//! image = "ddr_init.bin"
//! base = 0x80300000
//! max_size = "64 KiB"
//! memory = "sram"
//! dram_init = true
//!
//! [[stage]]
//! name = "uboot"
//! image = "u-boot.bin"
//! base = 0x00200000
//! max_size = "16 MiB"
//! memory = "dram"
//! requires = "ddr"
//! execute = true
//! ```
//!
//! Image paths are relative to the plan file. `length` defaults to the rest
//! of the image after `offset`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use k230boot_core::{
    BootPlan, ImageSet, MemoryKind, Region, SessionConfig, SourceRange, StageDescriptor,
    StageFlags,
};
use thiserror::Error;

use crate::image::FileImages;

/// Errors loading a plan file
#[derive(Debug, Error)]
pub enum PlanFileError {
    /// Reading the plan or one of its images failed
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The plan is not valid TOML or has wrong field types
    #[error("invalid plan file: {0}")]
    Parse(#[from] toml::de::Error),
    /// The plan has no `[[stage]]` tables
    #[error("plan file has no [[stage]] entries")]
    NoStages,
    /// A stage's image was not loaded
    #[error("stage '{stage}': image '{image}' not loaded")]
    MissingImage {
        /// Stage name
        stage: String,
        /// Image name
        image: String,
    },
    /// A stage's offset lies past the end of its image
    #[error("stage '{stage}': offset 0x{offset:X} is past the end of the {size}-byte image")]
    OffsetPastEnd {
        /// Stage name
        stage: String,
        /// Offset
        offset: u32,
        /// Image size
        size: u64,
    },
}

/// TOML plan file structure
#[derive(Debug, serde::Deserialize)]
struct TomlPlanFile {
    plan: Option<TomlPlanMeta>,
    session: Option<SessionOverrides>,
    #[serde(default)]
    stage: Vec<TomlStage>,
}

/// Plan metadata
#[derive(Debug, serde::Deserialize)]
struct TomlPlanMeta {
    name: Option<String>,
    board: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_hex_u32")]
    entry: Option<u32>,
}

/// Stage definition in TOML
#[derive(Debug, Clone, serde::Deserialize)]
struct TomlStage {
    name: String,
    image: String,
    #[serde(default, deserialize_with = "deserialize_hex_u32")]
    offset: u32,
    #[serde(default, deserialize_with = "deserialize_opt_size")]
    length: Option<u32>,
    #[serde(deserialize_with = "deserialize_hex_u32")]
    base: u32,
    #[serde(deserialize_with = "deserialize_size")]
    max_size: u32,
    #[serde(default)]
    memory: TomlMemory,
    requires: Option<String>,
    #[serde(default)]
    dram_init: bool,
    #[serde(default)]
    execute: bool,
}

#[derive(Debug, Clone, Copy, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
enum TomlMemory {
    #[default]
    Sram,
    Dram,
}

impl From<TomlMemory> for MemoryKind {
    fn from(m: TomlMemory) -> Self {
        match m {
            TomlMemory::Sram => MemoryKind::Sram,
            TomlMemory::Dram => MemoryKind::Dram,
        }
    }
}

/// `[session]` table: overrides for [`SessionConfig`]
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct SessionOverrides {
    /// Preferred chunk size
    #[serde(default, deserialize_with = "deserialize_opt_size")]
    pub chunk_size: Option<u32>,
    /// Handshake attempts
    pub handshake_attempts: Option<u32>,
    /// Attempts for ReadInfo / FlushCaches
    pub command_attempts: Option<u32>,
    /// Attempts per written chunk
    pub write_attempts: Option<u32>,
    /// Handshake timeout in milliseconds
    pub handshake_timeout_ms: Option<u64>,
    /// ReadInfo / FlushCaches timeout in milliseconds
    pub command_timeout_ms: Option<u64>,
    /// WriteMemory timeout in milliseconds
    pub write_timeout_ms: Option<u64>,
    /// DRAM training timeout in milliseconds
    pub call_timeout_ms: Option<u64>,
    /// Issue FlushCaches before Execute
    pub flush_before_execute: Option<bool>,
}

impl SessionOverrides {
    /// Apply the overrides to a session configuration
    pub fn apply(&self, config: &mut SessionConfig) {
        if let Some(size) = self.chunk_size {
            config.chunk_size = size as usize;
        }
        if let Some(n) = self.handshake_attempts {
            config.handshake_attempts = n;
        }
        if let Some(n) = self.command_attempts {
            config.command_attempts = n;
        }
        if let Some(n) = self.write_attempts {
            config.write_attempts = n;
        }
        if let Some(ms) = self.handshake_timeout_ms {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.command_timeout_ms {
            config.command_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.write_timeout_ms {
            config.write_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.call_timeout_ms {
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(flush) = self.flush_before_execute {
            config.flush_before_execute = flush;
        }
    }
}

/// A parsed boot plan file
#[derive(Debug)]
pub struct PlanFile {
    /// Plan name
    pub name: Option<String>,
    /// Board preset the plan was written for
    pub board: Option<String>,
    /// Entry override
    pub entry: Option<u32>,
    /// Session overrides
    pub session: SessionOverrides,
    base_dir: PathBuf,
    stages: Vec<TomlStage>,
}

impl PlanFile {
    /// Load a plan from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, PlanFileError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            std::io::Error::new(e.kind(), format!("{}: {}", path.display(), e))
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&content, base_dir)
    }

    /// Parse a plan; image paths are resolved against `base_dir`
    pub fn from_toml_str(content: &str, base_dir: &Path) -> Result<Self, PlanFileError> {
        let file: TomlPlanFile = toml::from_str(content)?;
        if file.stage.is_empty() {
            return Err(PlanFileError::NoStages);
        }

        let (name, board, entry) = match file.plan {
            Some(meta) => (meta.name, meta.board, meta.entry),
            None => (None, None, None),
        };

        Ok(Self {
            name,
            board,
            entry,
            session: file.session.unwrap_or_default(),
            base_dir: base_dir.to_path_buf(),
            stages: file.stage,
        })
    }

    /// Read every image the plan references
    pub fn load_images(&self) -> Result<FileImages, PlanFileError> {
        let mut images = FileImages::new();
        for stage in &self.stages {
            images.load(&stage.image, &self.base_dir.join(&stage.image))?;
        }
        Ok(images)
    }

    /// Build the core boot plan
    ///
    /// `images` is consulted only to default missing stage lengths.
    pub fn boot_plan(&self, images: &dyn ImageSet) -> Result<BootPlan, PlanFileError> {
        let mut plan = BootPlan::new();
        for stage in &self.stages {
            let length = match stage.length {
                Some(len) => len as u64,
                None => {
                    let image = images.source(&stage.image).ok_or_else(|| {
                        PlanFileError::MissingImage {
                            stage: stage.name.clone(),
                            image: stage.image.clone(),
                        }
                    })?;
                    image.len().checked_sub(stage.offset as u64).ok_or_else(|| {
                        PlanFileError::OffsetPastEnd {
                            stage: stage.name.clone(),
                            offset: stage.offset,
                            size: image.len(),
                        }
                    })?
                }
            };

            let mut flags = StageFlags::empty();
            flags.set(StageFlags::DRAM_INIT, stage.dram_init);
            flags.set(StageFlags::EXECUTE, stage.execute);

            let mut descriptor = StageDescriptor::new(
                stage.name.clone(),
                Region::new(stage.base, stage.max_size, stage.memory.into()),
                SourceRange::new(stage.image.clone(), stage.offset as u64, length),
            )
            .with_flags(flags);
            descriptor.requires = stage.requires.clone();
            plan = plan.stage(descriptor);
        }

        if let Some(entry) = self.entry {
            plan = plan.with_entry(entry);
        }
        Ok(plan)
    }
}

// =============================================================================
// Number parsing
// =============================================================================

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum HexOrInt {
    Int(u32),
    Str(String),
}

/// Deserialize a u32 that can be hex (0x...) or decimal
fn deserialize_hex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Str(s) => parse_number(&s).map_err(serde::de::Error::custom),
    }
}

fn deserialize_opt_hex_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_hex_u32(deserializer).map(Some)
}

/// Deserialize a size that can be a number or a string like "64 KiB"
fn deserialize_size<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Str(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

fn deserialize_opt_size<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_size(deserializer).map(Some)
}

/// Parse a number that can be hex (0x...) or decimal
pub fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim().replace('_', "");
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("invalid hex: {}", e))
    } else {
        s.parse().map_err(|e| format!("invalid number: {}", e))
    }
}

/// Parse a size string like "16 MiB" or "4096"
pub fn parse_size(s: &str) -> Result<u32, String> {
    let s = s.trim();

    if let Ok(n) = parse_number(s) {
        return Ok(n);
    }

    let s_lower = s.to_lowercase();
    let (num_str, multiplier) = if let Some(n) = s_lower.strip_suffix("mib") {
        (n.trim(), 1024 * 1024)
    } else if let Some(n) = s_lower.strip_suffix("mb") {
        (n.trim(), 1024 * 1024)
    } else if let Some(n) = s_lower.strip_suffix("kib") {
        (n.trim(), 1024)
    } else if let Some(n) = s_lower.strip_suffix("kb") {
        (n.trim(), 1024)
    } else if let Some(n) = s_lower.strip_suffix('b') {
        (n.trim(), 1)
    } else {
        return Err(format!("invalid size: {}", s));
    };

    let num: u32 = num_str.parse().map_err(|_| format!("invalid size: {}", s))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size too large: {}", s))
}
