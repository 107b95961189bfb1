//! Command line interface

mod terminal;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rcabench_viewer::{
    Config, HttpDataApi, LoadController, LoadPhase, RenderProps, ViewState, shared_worker,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

pub use clap;

pub use self::terminal::TerminalViewer;

pub trait Main {
    fn main(self) -> Result<()>;
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Stream a result file and print a preview of it
    View(View),
    /// Print the default configuration
    Config,
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct View {
    /// Id of the resource the file belongs to
    resource_id: i64,
    /// Path of the file within the resource
    file_path: String,
    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Backend base URL, overrides the configuration
    #[arg(long)]
    base_url: Option<String>,
    /// Bearer token, overrides the configuration
    #[arg(long)]
    token: Option<String>,
    /// Number of rows to print
    #[arg(long)]
    rows: Option<usize>,
    /// Print view states as JSON lines
    #[arg(long)]
    json: bool,
}

impl Main for Cli {
    fn main(self) -> Result<()> {
        match self.command {
            Commands::View(view) => view.main()?,
            Commands::Config => print!("{}", Config::default().to_toml()),
        }
        Ok(())
    }
}

impl Main for View {
    fn main(self) -> Result<()> {
        init_logging();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run())
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl View {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(base_url) = &self.base_url {
            config.api.base_url.clone_from(base_url);
        }
        if let Some(token) = &self.token {
            config.api.token = Some(token.clone());
        }
        if let Some(rows) = self.rows {
            config.viewer.preview_rows = rows;
        }
        Ok(config)
    }

    async fn run(self) -> Result<()> {
        let config = self.config()?;
        info!("Using backend {}", config.api.base_url);
        let controller = LoadController::new(
            Arc::new(HttpDataApi::new(&config.api)),
            shared_worker().await,
            Box::new(TerminalViewer::new(config.viewer.preview_rows, self.json)),
            config.viewer.display,
        );
        let mut states = controller.subscribe();
        controller
            .render(RenderProps {
                resource_id: self.resource_id,
                file_path: self.file_path,
                height: None,
            })
            .await;

        let mut last = None;
        let outcome = loop {
            let state = states.borrow_and_update().clone();
            if last.as_ref() != Some(&state) {
                report(&state, self.json)?;
            }
            match state.phase {
                LoadPhase::Ready => break Ok(()),
                LoadPhase::Failed => break Err(state),
                LoadPhase::Idle | LoadPhase::Loading => {}
            }
            last = Some(state);
            if states.changed().await.is_err() {
                bail!("Viewer stopped unexpectedly");
            }
        };
        controller.unmount().await;

        if let Err(state) = outcome {
            let Some(panel) = state.error else {
                bail!("Load failed");
            };
            bail!("{}: {}\n{}", panel.title, panel.message, panel.hint);
        }
        Ok(())
    }
}

fn report(state: &ViewState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(state)?);
    } else if state.phase != LoadPhase::Failed {
        let progress = &state.progress;
        if progress.total_rows > 0 {
            eprintln!(
                "[{:>3}%] {} {}/{} rows",
                progress.percent, progress.stage, progress.received_rows, progress.total_rows
            );
        } else {
            eprintln!(
                "[{:>3}%] {} {} rows",
                progress.percent, progress.stage, progress.received_rows
            );
        }
    }
    Ok(())
}
