use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use crate::process::{CommandRunner, CommandSpec, RunOutput};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VolumeError {
    #[error("Volume must be a number between 0 and 100")]
    InvalidInput(i64),
    #[error("Failed to set volume")]
    Mixer(String),
}

/// Sets the output level through the system mixer (`amixer sset <control> N%`).
/// Fire and forget: nothing is read back.
pub struct VolumeController {
    runner: Arc<dyn CommandRunner>,
    program: String,
    control: String,
}

impl VolumeController {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>, control: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
            control: control.into(),
        }
    }

    pub async fn set_volume(&self, level: i64) -> Result<u8, VolumeError> {
        let percent = u8::try_from(level)
            .ok()
            .filter(|v| *v <= 100)
            .ok_or(VolumeError::InvalidInput(level))?;

        let cmd = CommandSpec::new(&self.program)
            .arg("sset")
            .arg(&self.control)
            .arg(format!("{percent}%"));

        match self.runner.run(&cmd, None).await {
            Ok(out) if out.success() => {
                info!("volume set to {percent}%");
                Ok(percent)
            }
            Ok(RunOutput::Exited { code, output }) => {
                error!("error setting volume: {cmd} exited with {code:?}: {}", output.trim());
                Err(VolumeError::Mixer(output.trim().to_string()))
            }
            Ok(RunOutput::TimedOut) => {
                error!("error setting volume: {cmd} timed out");
                Err(VolumeError::Mixer("mixer timed out".into()))
            }
            Err(e) => {
                error!("error setting volume: {e}");
                Err(VolumeError::Mixer(e.to_string()))
            }
        }
    }
}
