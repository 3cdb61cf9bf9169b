use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use clap::Args;
use itertools::Itertools;
use owo_colors::OwoColorize;
use sccal::{
    config::PollConfig,
    device::{DeviceHandle, DeviceIdentity},
    discovery::{self, HidBackend},
    model::{AxisState, BezierModel, FirmwareVersion, MODEL_COUNT, PercentPoint},
    transport::RawHidChannel,
};
use serde::Serialize;
use serde_json::json;

use super::Cli;

/// Detect and view the calibration of connected devices.
#[derive(Args)]
pub struct ProbeCommand {}

impl ProbeCommand {
    pub async fn execute<B: HidBackend>(
        &self,
        root: &Cli,
        backend: B,
        config: PollConfig,
    ) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let handles = discovery::discover(&backend, &config, None)
            .await
            .context("could not search for devices")?;

        let mut devices = Vec::with_capacity(handles.len());
        for handle in handles {
            if root
                .serial
                .as_ref()
                .is_some_and(|serial| *serial != handle.identity().serial)
            {
                continue;
            }

            devices.push(
                probe_device(&handle)
                    .await
                    .with_context(|| format!("could not probe {}", handle.identity().serial))?,
            );
        }

        if root.json {
            writeln!(stdout, "{}", json!(devices))?;
            stdout.flush()?;
            return Ok(());
        }

        if devices.is_empty() {
            writeln!(stdout, "{}", "No devices were found.".bright_black())?;
            stdout.flush()?;
            return Ok(());
        }

        for (device_i, device) in devices.into_iter().enumerate() {
            if device_i != 0 {
                writeln!(stdout)?;
            }

            writeln!(
                stdout,
                "{}: {} {} ({:#06x}:{:#06x})",
                device.identity.serial.bright_black(),
                device.identity.organization,
                device.identity.name,
                device.identity.vendor_id.bright_black(),
                device.identity.product_id.bright_black()
            )?;
            writeln!(stdout, " │")?;
            writeln!(stdout, " ├─ FIRMWARE: {}", device.version.bright_blue())?;
            writeln!(stdout, " ├─ PATH: {}", device.identity.uuid.bright_black())?;
            writeln!(stdout, " │")?;

            let axes_len = device.axes.len();
            writeln!(stdout, " ├─ {}", "AXES".bold())?;
            for (axis_i, axis) in device.axes.iter().enumerate() {
                writeln!(
                    stdout,
                    " │   {} {}: {} {} ({}..{}, DEADZONE {}%, LIMIT {}%, CURVE {})",
                    if axis_i == axes_len - 1 { "╰─" } else { "├─" },
                    axis_i.bright_blue(),
                    if axis.enabled {
                        "●".green().into_styled()
                    } else {
                        "●".red().into_styled()
                    },
                    format!("{:5.1}%", axis.output_fraction * 100.0).blue(),
                    axis.range_min,
                    axis.range_max,
                    axis.deadzone,
                    axis.limit,
                    if axis.curve_index < 0 {
                        "linear".bright_black().to_string()
                    } else {
                        axis.curve_index.to_string()
                    },
                )?;
            }
            if device.axes.is_empty() {
                writeln!(
                    stdout,
                    " │   ╰─ {}",
                    "No axes were reported.".bright_black().italic()
                )?;
            }

            writeln!(stdout, " │")?;
            writeln!(stdout, " ╰─ {}", "MODELS".bold())?;
            for (model_i, model) in device.models.iter().enumerate() {
                writeln!(
                    stdout,
                    "     {} {}: {} {}",
                    if model_i == MODEL_COUNT - 1 {
                        "╰─"
                    } else {
                        "├─"
                    },
                    model_i.bright_blue(),
                    format_points(&model.points),
                    match &model.label {
                        Some(label) => format!("\"{label}\"").green().to_string(),
                        None => "unlabeled".bright_black().italic().to_string(),
                    }
                )?;
            }
        }

        stdout.flush()?;

        Ok(())
    }
}

async fn probe_device<T: RawHidChannel>(handle: &DeviceHandle<T>) -> Result<ProbedDevice> {
    let version = handle.get_version().await?;

    let count = handle.get_num_axes().await?;
    let mut axes = Vec::with_capacity(usize::from(count));
    for axis in 0..count {
        axes.push(handle.get_axis_state(axis).await?);
    }

    let mut models = Vec::with_capacity(MODEL_COUNT);
    for model in 0..MODEL_COUNT as u8 {
        let label = handle.get_bezier_label(model).await?;
        let mut probed = BezierModel {
            label: (!label.is_empty()).then_some(label),
            ..Default::default()
        };
        probed.set_from_wire(&handle.get_bezier_model(model).await?);
        models.push(probed);
    }

    Ok(ProbedDevice {
        identity: handle.identity().clone(),
        version,
        axes,
        models,
    })
}

pub(super) fn format_points(points: &[PercentPoint]) -> String {
    points
        .iter()
        .map(|point| format!("({},{})", point.x, point.y))
        .join(" ")
}

#[derive(Clone, PartialEq, Debug, Serialize)]
struct ProbedDevice {
    identity: DeviceIdentity,
    version: FirmwareVersion,
    axes: Vec<AxisState>,
    models: Vec<BezierModel>,
}
