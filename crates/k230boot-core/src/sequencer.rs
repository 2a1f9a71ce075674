//! Stage sequencer
//!
//! Turns a [`BootPlan`] into a [`WritePlan`]: every stage's bytes read,
//! every constraint checked, every chunk address computed. Nothing here
//! touches the device, so a plan that builds is one the session can execute
//! without discovering a layout problem half-way through a boot.

use std::collections::HashMap;

use crate::error::{ImageError, PlanError};
use crate::frame::HEADER_LEN;
use crate::image::ImageSet;
use crate::plan::{BootPlan, MemoryKind, MemoryMap, Region, StageDescriptor, StageFlags};

/// A single `WriteMemory` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Offset of the chunk within its stage
    pub offset: usize,
    /// Target address
    pub address: u32,
    /// Chunk bytes
    pub data: &'a [u8],
}

/// A stage with its bytes resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageWrite {
    /// Stage name
    pub name: String,
    /// Target region
    pub region: Region,
    /// Stage flags
    pub flags: StageFlags,
    /// Bytes to write at `region.base`
    pub data: Vec<u8>,
    /// Run the stage with `Call` once written (DRAM training)
    pub call_after_write: bool,
}

impl StageWrite {
    /// Create an ad-hoc stage with no flags
    pub fn new(name: impl Into<String>, region: Region, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            region,
            flags: StageFlags::empty(),
            data,
            call_after_write: false,
        }
    }

    /// Number of bytes to write
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the stage has no bytes
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Split the stage into chunks of at most `chunk_size` bytes
    pub fn chunks(&self, chunk_size: usize) -> impl Iterator<Item = Chunk<'_>> + '_ {
        let base = self.region.base;
        self.data
            .chunks(chunk_size.max(1))
            .enumerate()
            .map(move |(i, data)| {
                let offset = i * chunk_size.max(1);
                Chunk {
                    offset,
                    address: base.wrapping_add(offset as u32),
                    data,
                }
            })
    }
}

/// Validated, fully resolved sequence of writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    /// Stages in load order
    pub stages: Vec<StageWrite>,
    /// Entry address to execute after staging, if any
    pub entry: Option<u32>,
    /// Maximum chunk payload
    pub chunk_size: usize,
}

impl WritePlan {
    /// Total number of bytes across all stages
    pub fn total_bytes(&self) -> usize {
        self.stages.iter().map(|s| s.len()).sum()
    }

    /// Total number of `WriteMemory` commands the plan will issue
    pub fn chunk_count(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.len().div_ceil(self.chunk_size))
            .sum()
    }
}

/// Builds [`WritePlan`]s from [`BootPlan`]s
#[derive(Debug, Clone)]
pub struct Sequencer {
    chunk_size: usize,
    memory_map: Option<MemoryMap>,
}

impl Sequencer {
    /// Create a sequencer producing chunks of at most `chunk_size` bytes
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            memory_map: None,
        }
    }

    /// Create a sequencer whose chunks fit a transport's largest transfer
    pub fn for_transfer_size(chunk_size: usize, max_transfer: usize) -> Self {
        Self::new(chunk_size.min(max_transfer.saturating_sub(HEADER_LEN)))
    }

    /// Check every region against a board memory map
    pub fn with_memory_map(mut self, map: MemoryMap) -> Self {
        self.memory_map = Some(map);
        self
    }

    /// Chunk size this sequencer produces
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Validate `plan` and resolve its bytes from `images`
    pub fn build(&self, plan: &BootPlan, images: &dyn ImageSet) -> Result<WritePlan, PlanError> {
        if self.chunk_size == 0 {
            return Err(PlanError::ZeroChunkSize);
        }
        if plan.stages.is_empty() {
            return Err(PlanError::Empty);
        }

        let index = stage_index(plan)?;
        check_dependencies(plan, &index)?;
        check_dram_order(plan, &index)?;
        let handoff = check_handoff(plan)?;

        for stage in &plan.stages {
            self.check_region(stage)?;
        }
        check_overlaps(plan)?;

        let mut stages = Vec::with_capacity(plan.stages.len());
        for stage in &plan.stages {
            let data = read_stage(stage, images)?;
            log::debug!(
                "stage '{}': {} bytes -> {} 0x{:08X}",
                stage.name,
                data.len(),
                stage.region.kind,
                stage.region.base
            );
            stages.push(StageWrite {
                name: stage.name.clone(),
                region: stage.region,
                flags: stage.flags,
                data,
                call_after_write: stage.is_dram_init() && !stage.is_handoff(),
            });
        }

        let entry = match (handoff, plan.entry) {
            (None, None) => None,
            (None, Some(entry)) => return Err(PlanError::EntryWithoutHandoff(entry)),
            (Some(stage), None) => Some(stage.region.base),
            (Some(stage), Some(entry)) => {
                // Only the written bytes count, not the whole region
                let written = stage.region.base as u64 + stage.source.length;
                if (entry as u64) < stage.region.base as u64 || entry as u64 >= written {
                    return Err(PlanError::EntryOutsideStage {
                        entry,
                        stage: stage.name.clone(),
                    });
                }
                Some(entry)
            }
        };

        Ok(WritePlan {
            stages,
            entry,
            chunk_size: self.chunk_size,
        })
    }

    fn check_region(&self, stage: &StageDescriptor) -> Result<(), PlanError> {
        let region = &stage.region;
        if stage.source.length == 0 {
            return Err(PlanError::EmptySource(stage.name.clone()));
        }
        if stage.source.length > region.max_size as u64 {
            return Err(PlanError::SourceTooLarge {
                stage: stage.name.clone(),
                length: stage.source.length,
                max_size: region.max_size,
            });
        }
        if region.end().is_none() {
            return Err(PlanError::RegionWraps(stage.name.clone()));
        }
        if let Some(map) = &self.memory_map {
            if !map.admits(region) {
                return Err(PlanError::OutsideMemoryMap {
                    stage: stage.name.clone(),
                    kind: region.kind,
                    base: region.base,
                    size: region.max_size,
                });
            }
        }
        Ok(())
    }
}

fn stage_index(plan: &BootPlan) -> Result<HashMap<&str, usize>, PlanError> {
    let mut index = HashMap::with_capacity(plan.stages.len());
    for (i, stage) in plan.stages.iter().enumerate() {
        if index.insert(stage.name.as_str(), i).is_some() {
            return Err(PlanError::DuplicateStage(stage.name.clone()));
        }
    }
    Ok(index)
}

/// Predecessors must exist and come earlier in the plan
///
/// Requiring backward edges rules out cycles: any cycle has at least one
/// edge pointing forward.
fn check_dependencies(plan: &BootPlan, index: &HashMap<&str, usize>) -> Result<(), PlanError> {
    for (i, stage) in plan.stages.iter().enumerate() {
        let Some(predecessor) = &stage.requires else {
            continue;
        };
        if *predecessor == stage.name {
            return Err(PlanError::SelfDependency(stage.name.clone()));
        }
        match index.get(predecessor.as_str()) {
            None => {
                return Err(PlanError::UnknownPredecessor {
                    stage: stage.name.clone(),
                    predecessor: predecessor.clone(),
                })
            }
            Some(&j) if j > i => {
                return Err(PlanError::DependencyOrder {
                    stage: stage.name.clone(),
                    predecessor: predecessor.clone(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn check_dram_order(plan: &BootPlan, index: &HashMap<&str, usize>) -> Result<(), PlanError> {
    for stage in plan.stages.iter().filter(|s| s.is_dram_init()) {
        if stage.region.kind != MemoryKind::Sram {
            return Err(PlanError::DramInitNotSram(stage.name.clone()));
        }
    }

    for stage in &plan.stages {
        if stage.region.kind != MemoryKind::Dram {
            continue;
        }

        let mut init = None;
        let mut current = stage.requires.as_deref();
        while let Some(name) = current {
            // Dependencies already point strictly backwards, so this ends
            let Some(&j) = index.get(name) else { break };
            let predecessor = &plan.stages[j];
            if predecessor.is_dram_init() {
                init = Some(predecessor);
                break;
            }
            current = predecessor.requires.as_deref();
        }

        match init {
            None => return Err(PlanError::DramBeforeInit(stage.name.clone())),
            Some(init) if init.is_handoff() => {
                return Err(PlanError::DramInitIsHandoff {
                    init: init.name.clone(),
                    stage: stage.name.clone(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn check_handoff(plan: &BootPlan) -> Result<Option<&StageDescriptor>, PlanError> {
    let mut handoff: Option<&StageDescriptor> = None;
    for stage in plan.stages.iter().filter(|s| s.is_handoff()) {
        if let Some(first) = handoff {
            return Err(PlanError::MultipleHandoff {
                first: first.name.clone(),
                second: stage.name.clone(),
            });
        }
        handoff = Some(stage);
    }
    Ok(handoff)
}

fn check_overlaps(plan: &BootPlan) -> Result<(), PlanError> {
    for (i, a) in plan.stages.iter().enumerate() {
        for b in &plan.stages[i + 1..] {
            if a.region.overlaps(&b.region) {
                return Err(PlanError::Overlap {
                    first: a.name.clone(),
                    second: b.name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn read_stage(stage: &StageDescriptor, images: &dyn ImageSet) -> Result<Vec<u8>, PlanError> {
    let source = &stage.source;
    let image = images
        .source(&source.image)
        .ok_or_else(|| PlanError::MissingImage {
            stage: stage.name.clone(),
            image: source.image.clone(),
        })?;

    let size = image.len();
    let in_range = source
        .offset
        .checked_add(source.length)
        .is_some_and(|end| end <= size);
    if !in_range {
        return Err(PlanError::Image {
            stage: stage.name.clone(),
            source: ImageError::OutOfRange {
                offset: source.offset,
                length: source.length,
                size,
            },
        });
    }

    let data = image
        .read(source.offset, source.length)
        .map_err(|e| PlanError::Image {
            stage: stage.name.clone(),
            source: e,
        })?;
    if data.len() as u64 != source.length {
        return Err(PlanError::ShortRead {
            stage: stage.name.clone(),
            expected: source.length,
            actual: data.len(),
        });
    }
    Ok(data)
}
