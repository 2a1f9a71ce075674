//! Terminal progress bars for boot sessions

use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use k230boot_core::{BootProgress, SessionState, SessionSummary, StageWrite};

/// Create a byte progress bar labelled with the stage name
fn create_stage_bar(total: u64, stage: &str) -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {}",
                stage
            ))?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn create_spinner_style() -> Result<ProgressStyle, Box<dyn std::error::Error>> {
    Ok(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?)
}

/// [`BootProgress`] that draws one bar per stage
pub struct IndicatifProgress {
    multi: MultiProgress,
    current_bar: Option<ProgressBar>,
}

impl IndicatifProgress {
    /// Create a progress display with no bars
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            current_bar: None,
        }
    }

    fn create_bar(&mut self, total: u64, stage: &str) {
        let pb = self.multi.add(
            create_stage_bar(total, stage).unwrap_or_else(|_| ProgressBar::new(total)),
        );
        self.current_bar = Some(pb);
    }

    fn create_spinner(&mut self, message: String) {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(create_spinner_style().unwrap_or_else(|_| ProgressStyle::default_spinner()));
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(100));
        self.current_bar = Some(pb);
    }

    fn finish(&mut self, message: String) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish_with_message(message);
        }
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IndicatifProgress {
    fn drop(&mut self) {
        // A failed session leaves its bar running
        if let Some(pb) = self.current_bar.take() {
            pb.abandon();
        }
    }
}

impl BootProgress for IndicatifProgress {
    fn state_changed(&mut self, state: SessionState) {
        match state {
            SessionState::Disconnected => self.create_spinner("Waiting for boot ROM...".to_string()),
            SessionState::Handshaking => {
                if let Some(pb) = &self.current_bar {
                    pb.set_message("Identifying chip...");
                } else {
                    self.create_spinner("Identifying chip...".to_string());
                }
            }
            SessionState::Identified => self.finish("Chip identified".to_string()),
            _ => {}
        }
    }

    fn stage_started(&mut self, index: usize, stage: &StageWrite) {
        self.finish(String::new());
        println!(
            "Stage {} '{}': {} bytes to {} 0x{:08X}",
            index + 1,
            stage.name,
            stage.len(),
            stage.region.kind,
            stage.region.base
        );
        self.create_bar(stage.len() as u64, &stage.name);
    }

    fn stage_progress(&mut self, _index: usize, written: usize, _total: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(written as u64);
        }
    }

    fn stage_completed(&mut self, _index: usize, stage: &StageWrite) {
        if stage.call_after_write {
            self.finish(format!("{} written, DRAM ready", stage.name));
        } else {
            self.finish(format!("{} written", stage.name));
        }
    }

    fn complete(&mut self, summary: &SessionSummary) {
        self.finish(String::new());
        match summary.entry {
            Some(entry) => println!(
                "Booted {}: {} stage(s), {} bytes, running at 0x{:08X}",
                summary.chip, summary.stages_completed, summary.bytes_written, entry
            ),
            None => println!(
                "Staged {}: {} stage(s), {} bytes, not executed",
                summary.chip, summary.stages_completed, summary.bytes_written
            ),
        }
    }
}
