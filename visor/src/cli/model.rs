use anyhow::{Context, Result, ensure};
use clap::{Args, Subcommand};
use sccal::{
    config::PollConfig,
    discovery::HidBackend,
    model::{MODEL_COUNT, MODEL_POINTS, PercentPoint},
};

use super::{Cli, bind, probe::format_points, report_success};

/// Change one of the Bezier models stored on a device.
#[derive(Args)]
pub struct ModelCommand {
    /// The index of the model
    model: u8,

    #[command(subcommand)]
    action: ModelAction,
}

#[derive(Subcommand)]
enum ModelAction {
    /// Replace the control points of the model
    Set {
        /// Six control points given as X:Y percentages, e.g. 0:0 20:10 40:30 60:55 80:80 100:100
        #[arg(num_args = MODEL_POINTS, value_parser = parse_point, required = true)]
        points: Vec<PercentPoint>,
    },

    /// Rename the model
    Label {
        /// The new label, at most 50 bytes long. An empty label removes it.
        label: String,
    },
}

impl ModelCommand {
    pub async fn execute<B: HidBackend>(
        &self,
        root: &Cli,
        backend: B,
        config: PollConfig,
    ) -> Result<()> {
        let model = self.model;
        ensure!(usize::from(model) < MODEL_COUNT, "there is no model {model}");

        let (mut manager, context) = bind(root, backend, config).await?;

        let (ticket, message) = match &self.action {
            ModelAction::Set { points } => {
                ensure!(
                    points.len() == MODEL_POINTS,
                    "a model has exactly {MODEL_POINTS} control points"
                );

                context.with_state(|state| {
                    if let Some(slot) = state.models.get_mut(usize::from(model)) {
                        slot.points.copy_from_slice(points);
                    }
                });
                (
                    manager.push_bezier_model(&context, model)?,
                    format!("model {model} is now {}", format_points(points)),
                )
            },
            ModelAction::Label { label } => (
                manager.push_bezier_label(&context, model, label.clone())?,
                format!("model {model} is now labeled \"{label}\""),
            ),
        };

        ticket
            .wait()
            .await
            .with_context(|| format!("could not update model {model} of {}", context.serial()))?;

        report_success(root, context.serial(), &message)?;

        manager.release_all();
        Ok(())
    }
}

fn parse_point(value: &str) -> Result<PercentPoint, String> {
    let (x, y) = value
        .split_once(':')
        .ok_or_else(|| format!("`{value}` is not of the form X:Y"))?;

    let parse = |part: &str| match part.trim().parse::<i32>() {
        Ok(percent) if (0..=100).contains(&percent) => Ok(percent),
        _ => Err(format!("`{part}` is not a percentage between 0 and 100")),
    };

    Ok(PercentPoint {
        x: parse(x)?,
        y: parse(y)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_are_parsed() {
        assert_eq!(parse_point("20:35"), Ok(PercentPoint { x: 20, y: 35 }));
        assert_eq!(parse_point(" 0 : 100"), Ok(PercentPoint { x: 0, y: 100 }));
        assert!(parse_point("20").is_err());
        assert!(parse_point("20:101").is_err());
        assert!(parse_point("-1:0").is_err());
        assert!(parse_point("a:b").is_err());
    }
}
