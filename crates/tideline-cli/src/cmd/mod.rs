pub mod completions;
pub mod inspect;
pub mod replay;
pub mod sim;
pub mod window;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tideline_core::config::AccumulatorConfig;
use tideline_core::error::ErrorCode;
use tideline_core::sync::{SyncAccumulator, SyncState};

use crate::output::{CliError, OutputMode, render_error};

/// Read a checkpoint written by `tide replay --checkpoint`.
pub fn read_checkpoint(path: &Path) -> Result<SyncState> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse checkpoint {}", path.display()))
}

pub fn write_checkpoint(path: &Path, state: &SyncState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

/// Load and validate a checkpoint into an accumulator, reporting failures
/// with the catalog code before returning them.
pub fn restore_checkpoint(
    path: &Path,
    config: AccumulatorConfig,
    output: OutputMode,
) -> Result<SyncAccumulator> {
    let restored = read_checkpoint(path).and_then(|state| {
        SyncAccumulator::restore(&state, config)
            .with_context(|| format!("Checkpoint {} is corrupt", path.display()))
    });
    match restored {
        Ok(acc) => Ok(acc),
        Err(err) => {
            render_error(
                output,
                &CliError::new(format!("{err:#}")).with_code(ErrorCode::CheckpointUnreadable),
            )?;
            Err(err)
        }
    }
}
