use anyhow::{Context, Result};
use clap::Args;
use sccal::{config::PollConfig, discovery::HidBackend};

use super::{Cli, bind, report_success};

/// Persist the current calibration of a device.
#[derive(Args)]
pub struct CommitCommand {}

impl CommitCommand {
    pub async fn execute<B: HidBackend>(
        &self,
        root: &Cli,
        backend: B,
        config: PollConfig,
    ) -> Result<()> {
        let (mut manager, context) = bind(root, backend, config).await?;

        manager
            .commit(&context)?
            .wait()
            .await
            .with_context(|| format!("could not commit the settings of {}", context.serial()))?;

        report_success(root, context.serial(), "settings were committed")?;

        manager.release_all();
        Ok(())
    }
}
