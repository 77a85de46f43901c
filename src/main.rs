//! `llm-dispatcher` binary: loads the config file, applies command line
//! overrides and runs the dispatcher until SIGINT or SIGTERM.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use llm_dispatcher_rs::{startup, DispatcherConfig};

#[derive(Parser, Debug)]
#[command(name = "llm-dispatcher", version, about)]
struct Cli {
    /// JSON config file; defaults are used when omitted
    #[arg(long, short, env = "DISPATCHER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// trace, debug, info, warn or error
    #[arg(long, env = "DISPATCHER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Also write daily rotated log files here
    #[arg(long)]
    log_dir: Option<String>,

    #[arg(long)]
    log_json: bool,

    #[arg(long)]
    max_retries: Option<u32>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<DispatcherConfig> {
        let mut config = match &self.config {
            Some(path) => DispatcherConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => DispatcherConfig::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.log_level.is_some() {
            config.log_level = self.log_level;
        }
        if self.log_dir.is_some() {
            config.log_dir = self.log_dir;
        }
        if self.log_json {
            config.log_json = true;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Cli::parse().into_config()?;
    startup(config).await
}
