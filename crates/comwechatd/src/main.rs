use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

mod api;
mod daemon;
mod logging;

#[derive(Debug, Parser)]
#[command(name = "comwechatd")]
#[command(about = "ComWeChat bridge daemon")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Long-running JSONL sidecar: commands on stdin, messages on stdout.
    Daemon {
        /// Bridge config file (JSON)
        #[arg(long, default_value = "comwechat.json")]
        config: PathBuf,

        /// ComWeChat HTTP control interface
        #[arg(long, default_value = "http://127.0.0.1:18888/api/")]
        api_url: String,

        /// Address the chat client pushes its event callbacks to
        #[arg(long, default_value = "127.0.0.1:10808")]
        listen: String,
    },
}

fn main() -> anyhow::Result<()> {
    logging::init_logging();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Daemon {
            config,
            api_url,
            listen,
        } => {
            let config = comwechat_core::load_config(&config)
                .with_context(|| format!("load config {}", config.display()))?;
            // The blocking client spins up its own runtime and must be built
            // before ours.
            let client = api::HttpChatClient::new(&api_url)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("build tokio runtime")?;
            runtime
                .block_on(daemon::daemon_main(config, client, &listen))
                .context("daemon failed")
        }
    }
}
