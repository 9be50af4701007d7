//! Subcommand implementations.

pub(crate) mod completions;
pub(crate) mod ports;
pub(crate) mod probe;
pub(crate) mod serve;
pub(crate) mod upload;

use crate::{CliError, was_interrupted};

/// Return `Cancelled` once Ctrl-C was pressed.
pub(crate) fn ensure_not_interrupted() -> anyhow::Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted by user".to_string()).into())
    } else {
        Ok(())
    }
}
