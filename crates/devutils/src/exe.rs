use std::process::Command;

use anyhow::{anyhow, Context, Error};
use log::trace;

/// Extension for `std::process::Command` to run a process to completion and
/// turn a non-zero exit into an error carrying the captured output.
pub trait RunAndCheck {
    fn run_and_check(&mut self) -> Result<(), Error>;
}

impl RunAndCheck for Command {
    fn run_and_check(&mut self) -> Result<(), Error> {
        trace!("Running: {self:?}");
        let output = self
            .output()
            .with_context(|| format!("Failed to execute {:?}", self.get_program()))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit = match output.status.code() {
            Some(code) => format!("process exited with status: {code}"),
            None => "process was terminated by a signal".to_owned(),
        };
        Err(if stderr.trim().is_empty() {
            anyhow!("(No output was captured)").context(exit)
        } else {
            anyhow!("Process output:\n{stderr}").context(exit)
        })
    }
}
