//! Command-line interface.
//!
//! `serve` (the default) runs the HTTP service. `prepare` resolves and
//! downloads the model once, records the winning configuration, and exits.
//! Flags override values loaded from config.toml and the environment.

use crate::config::AppConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "sensevoice-server")]
#[command(about = "Local SenseVoice speech-recognition service with background model warm-up")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP service
    Serve(ServeArgs),

    /// Resolve and fetch the model ahead of time, then exit
    Prepare(PrepareArgs),
}

#[derive(Debug, Default, Args)]
pub struct ServeArgs {
    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Start loading the model at boot instead of on the first health probe
    #[arg(long)]
    pub eager_warmup: bool,
}

#[derive(Debug, Default, Args)]
pub struct PrepareArgs {
    #[arg(long)]
    pub model_id: Option<String>,

    /// Cache root for downloaded model assets
    #[arg(long)]
    pub model_dir: Option<PathBuf>,

    /// "auto", "cpu", "cuda:0", ...
    #[arg(long)]
    pub device: Option<String>,

    /// Comma-separated hubs in preference order, e.g. "hf,ms"
    #[arg(long)]
    pub hubs: Option<String>,

    /// Where to record the resolved configuration
    #[arg(long)]
    pub state_path: Option<PathBuf>,
}

impl Cli {
    /// The subcommand to run; `serve` with no flags when none was given.
    pub fn command(self) -> Command {
        self.command.unwrap_or_else(|| Command::Serve(ServeArgs::default()))
    }
}

impl ServeArgs {
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.eager_warmup {
            config.server.eager_warmup = true;
        }
    }
}

impl PrepareArgs {
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(model_id) = &self.model_id {
            config.model.model_id = model_id.clone();
        }
        if let Some(model_dir) = &self.model_dir {
            config.model.model_dir = model_dir.clone();
        }
        if let Some(device) = &self.device {
            config.model.device = device.clone();
        }
        if let Some(hubs) = &self.hubs {
            config.model.hubs = hubs.clone();
        }
        if let Some(state_path) = &self.state_path {
            config.model.state_path = state_path.clone();
        }
    }
}
