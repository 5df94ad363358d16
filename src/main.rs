#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use instagate::accounts::start_accounts;
use instagate::channels::ReplyPipeline;
use instagate::gateway::registry::TargetRegistry;
use instagate::gateway::{run_gateway, AppState};
use instagate::media::MediaStore;
use instagate::pipeline::{HttpReplyPipeline, LogOnlyPipeline};
use instagate::Config;
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[derive(Parser, Debug)]
#[command(
    name = "instagate",
    version,
    about = "Multi-account Instagram webhook gateway"
)]
struct Cli {
    /// Override the config directory (defaults to ~/.instagate)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the webhook gateway
    Gateway {
        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// List configured accounts and their webhook paths
    Accounts,
    /// Generate shell completions
    #[command(after_help = "Examples:
  source <(instagate completions bash)
  instagate completions zsh > ~/.zfunc/_instagate
  instagate completions fish > ~/.config/fish/completions/instagate.fish")]
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("INSTAGATE_CONFIG_DIR", config_dir);
    }

    // Completions must remain stdout-only and should not load config or
    // initialize logging, so sourced scripts stay clean.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        return write_shell_completion(*shell, &mut stdout);
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = Config::load_or_init().await?;

    match cli.command {
        Commands::Gateway { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            run(config).await
        }
        Commands::Accounts => {
            list_accounts(&config);
            Ok(())
        }
        Commands::Completions { .. } => unreachable!("handled before logging init"),
    }
}

async fn run(config: Config) -> Result<()> {
    let registry = Arc::new(TargetRegistry::new());

    if config.accounts.is_empty() {
        tracing::warn!(
            "no accounts configured; edit {} and add an [[accounts]] entry",
            config.config_path.display()
        );
    }

    let handles = start_accounts(&registry, &config.accounts);
    if !config.accounts.is_empty() && handles.is_empty() {
        bail!("all configured accounts failed to start");
    }

    let pipeline: Arc<dyn ReplyPipeline> = match HttpReplyPipeline::from_config(&config.pipeline)? {
        Some(http) => {
            tracing::info!(
                url = config.pipeline.url.as_deref().unwrap_or_default(),
                "reply pipeline configured"
            );
            Arc::new(http)
        }
        None => {
            tracing::info!("no reply pipeline configured; inbound events will only be logged");
            Arc::new(LogOnlyPipeline)
        }
    };

    let media = Arc::new(MediaStore::from_config(&config.media));
    let state = AppState::new(&config.gateway, Arc::clone(&registry), pipeline, media);

    tokio::select! {
        result = run_gateway(&config.gateway, state) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            for handle in &handles {
                handle.stop();
            }
            Ok(())
        }
    }
}

fn list_accounts(config: &Config) {
    if config.accounts.is_empty() {
        println!("No accounts configured in {}", config.config_path.display());
        return;
    }

    for account in &config.accounts {
        let path = account
            .webhook_path
            .clone()
            .unwrap_or_else(|| instagate::accounts::default_webhook_path(&account.account_id));
        println!(
            "{:<20} path={path} dm_policy={:?} signature={}",
            account.account_id,
            account.dm_policy,
            if account.app_secret.is_some() {
                "verified"
            } else {
                "unverified"
            }
        );
    }
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}
