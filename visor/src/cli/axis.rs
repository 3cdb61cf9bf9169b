use anyhow::{Context, Result, bail, ensure};
use clap::{Args, Subcommand};
use sccal::{
    config::PollConfig,
    context::DeviceContext,
    discovery::HidBackend,
    model::{AxisEditState, MODEL_COUNT},
    transport::RawHidChannel,
};

use super::{Cli, bind, report_success};

/// Change the calibration of a single axis.
#[derive(Args)]
pub struct AxisCommand {
    /// The index of the axis
    axis: u8,

    #[command(subcommand)]
    action: AxisAction,
}

#[derive(Subcommand)]
enum AxisAction {
    /// Report the axis to the host
    Enable,

    /// Stop reporting the axis to the host
    Disable,

    /// Set the calibrated range, deadzone and output limit
    ///
    /// Values that are not given keep their current setting.
    Range {
        /// The raw input mapped to 0% output
        #[arg(long)]
        min: Option<u16>,

        /// The raw input mapped to 100% output
        #[arg(long)]
        max: Option<u16>,

        /// The deadzone in percent
        #[arg(long)]
        deadzone: Option<u8>,

        /// The output limit in percent
        #[arg(long)]
        limit: Option<u8>,
    },

    /// Select the Bezier model shaping the response of the axis
    Curve {
        /// The index of the model, or -1 for a linear response
        #[arg(allow_negative_numbers = true)]
        model: i8,
    },
}

impl AxisCommand {
    pub async fn execute<B: HidBackend>(
        &self,
        root: &Cli,
        backend: B,
        config: PollConfig,
    ) -> Result<()> {
        let (mut manager, context) = bind(root, backend, config).await?;
        let axis = self.axis;

        let current = context
            .snapshot()
            .axes_edit
            .get(usize::from(axis))
            .copied();
        let Some(current) = current else {
            bail!("{} has no axis {axis}", context.serial());
        };

        let ticket = match &self.action {
            AxisAction::Enable => manager.set_axis_enabled(&context, axis, true)?,
            AxisAction::Disable => manager.set_axis_enabled(&context, axis, false)?,
            AxisAction::Range {
                min,
                max,
                deadzone,
                limit,
            } => {
                let staged = AxisEditState {
                    range_min: min.unwrap_or(current.range_min),
                    range_max: max.unwrap_or(current.range_max),
                    deadzone: deadzone.unwrap_or(current.deadzone),
                    limit: limit.unwrap_or(current.limit),
                    ..current
                };
                ensure!(
                    staged.range_min < staged.range_max,
                    "the minimum must be below the maximum"
                );
                ensure!(staged.limit <= 100, "the limit must be at most 100%");

                stage(&context, axis, staged);
                manager.push_axis_range(&context, axis)?
            },
            AxisAction::Curve { model } => {
                ensure!(
                    (-1..MODEL_COUNT as i8).contains(model),
                    "there is no model {model}"
                );

                stage(
                    &context,
                    axis,
                    AxisEditState {
                        curve_edit_index: *model,
                        ..current
                    },
                );
                manager.activate_bezier_model(&context, axis)?
            },
        };

        ticket
            .wait()
            .await
            .with_context(|| format!("could not update axis {axis} of {}", context.serial()))?;

        report_success(root, context.serial(), &format!("updated axis {axis}"))?;

        manager.release_all();
        Ok(())
    }
}

/// Replaces the staged values of an axis.
fn stage<T: RawHidChannel>(context: &DeviceContext<T>, axis: u8, staged: AxisEditState) {
    context.with_state(|state| {
        if let Some(slot) = state.axes_edit.get_mut(usize::from(axis)) {
            *slot = staged;
        }
    });
}
