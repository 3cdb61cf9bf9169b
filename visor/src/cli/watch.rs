use std::{
    io::{BufWriter, Write},
    time::Duration,
};

use anyhow::Result;
use clap::Args;
use owo_colors::OwoColorize;
use sccal::{
    config::PollConfig,
    context::ContextState,
    discovery::HidBackend,
    manager::HardwareManager,
};
use serde_json::json;
use tokio::{runtime::Handle, time::Instant};

use super::{Cli, FRAME};

/// Follow the live axis values of connected devices.
#[derive(Args)]
pub struct WatchCommand {
    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(short, long, value_name = "SECS")]
    duration: Option<u64>,

    /// Time between two printed updates
    #[arg(long, value_name = "MS", default_value_t = 250)]
    interval_ms: u64,
}

impl WatchCommand {
    pub async fn execute<B: HidBackend>(
        &self,
        root: &Cli,
        backend: B,
        config: PollConfig,
    ) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());
        let mut manager = HardwareManager::new(backend, config, Handle::current());

        let started = Instant::now();
        let deadline = self.duration.map(|secs| started + Duration::from_secs(secs));
        let interval = Duration::from_millis(self.interval_ms);
        let mut last_print: Option<Instant> = None;

        let mut frames = tokio::time::interval(FRAME);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => break,
                _ = frames.tick() => {},
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }

            manager.tick();

            if last_print.is_some_and(|last| last.elapsed() < interval) {
                continue;
            }
            last_print = Some(Instant::now());

            let elapsed = started.elapsed().as_secs_f32();
            for context in manager.contexts() {
                if root
                    .serial
                    .as_ref()
                    .is_some_and(|serial| serial != context.serial())
                {
                    continue;
                }

                let state = context.state();
                let snapshot = context.snapshot();

                if root.json {
                    writeln!(
                        stdout,
                        "{}",
                        json!({
                            "time": elapsed,
                            "serial": context.serial(),
                            "state": state,
                            "axes": snapshot.axes,
                        })
                    )?;
                    continue;
                }

                let axes = snapshot
                    .axes
                    .iter()
                    .enumerate()
                    .map(|(i, axis)| {
                        format!(
                            "{}: {:5.1}% → {:5.1}%",
                            i.bright_blue(),
                            axis.input_fraction * 100.0,
                            (axis.output_fraction * 100.0).green()
                        )
                    })
                    .collect::<Vec<_>>();

                writeln!(
                    stdout,
                    "{} {} {}",
                    format!("{elapsed:7.2}s").bright_black(),
                    match state {
                        ContextState::BoundSynced => context.serial().green().to_string(),
                        ContextState::BoundUnsynced => context.serial().yellow().to_string(),
                        ContextState::Unbound => context.serial().red().to_string(),
                    },
                    if axes.is_empty() {
                        "no axes".bright_black().italic().to_string()
                    } else {
                        axes.join("  ")
                    }
                )?;
            }
            stdout.flush()?;
        }

        manager.release_all();
        Ok(())
    }
}
