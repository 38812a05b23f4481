//! infra - deploy, inspect or destroy the origin rewrite worker

use anyhow::{Context, Result};
use cf_origin_rewrite::config::{self, DEFAULT_APP_NAME, DEFAULT_STAGE};
use cf_origin_rewrite::{
    logging, ConfigError, DeploymentConfig, EdgeHost, Environment, ExplicitOptions, GeneralOptions,
    HostConfig, LocalEngine, Orchestrator, Outcome, Phase, RequiredField, SqliteStateStore,
    StateMode, WorkerRegistry,
};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

/// Manage the origin rewrite worker
#[derive(Parser, Debug)]
#[command(name = "infra")]
#[command(author = "cf-origin-rewrite Contributors")]
#[command(version)]
#[command(about = "Deploy a worker that rewrites requests from a vanity route to an origin")]
struct Args {
    /// Application name
    #[arg(long, default_value = DEFAULT_APP_NAME)]
    app_name: String,

    /// Phase to execute
    #[arg(long, value_enum, default_value_t = Phase::Up)]
    phase: Phase,

    /// Deployment stage
    #[arg(long, default_value = DEFAULT_STAGE)]
    stage: String,

    /// Run in quiet mode
    #[arg(long)]
    quiet: bool,

    /// Run in dev mode (ephemeral local state, worker served locally)
    #[arg(long)]
    dev: bool,

    /// Cloudflare Account ID
    #[arg(long)]
    cloudflare_account_id: Option<String>,

    /// Cloudflare API Token
    #[arg(long)]
    cloudflare_api_token: Option<String>,

    /// Passphrase for state secrets
    #[arg(long)]
    secret_alchemy_passphrase: Option<String>,

    /// Your vanity domain, aka the domain you want to rewrite requests from
    #[arg(long)]
    from_route: Option<String>,

    /// The origin, aka the URL you want to rewrite requests to
    #[arg(long)]
    to_route: Option<String>,

    /// Deployment state database
    #[arg(long, env = "STATE_DB_PATH", default_value = "./data/state.db")]
    state_path: PathBuf,

    /// Local worker platform database
    #[arg(long, env = "PLATFORM_DB_PATH", default_value = "./data/platform.db")]
    platform_path: PathBuf,

    /// Port the worker is served on in dev mode
    #[arg(long, env = "DEV_PORT", default_value = "8787")]
    dev_port: u16,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    // .env feeds both the resolver and the clap `env =` fallbacks
    if let Ok(dir) = std::env::current_dir() {
        if let Err(e) = config::load_dotenv(&dir) {
            report_config_error(&e);
            return ExitCode::from(1);
        }
    }

    let args = Args::parse();
    logging::init(&args.log_level, args.quiet);

    let env = Environment::from_process();

    let explicit = ExplicitOptions {
        account_id: args.cloudflare_account_id.clone(),
        api_token: args.cloudflare_api_token.clone(),
        passphrase: args.secret_alchemy_passphrase.clone(),
        from_route: args.from_route.clone(),
        to_route: args.to_route.clone(),
    };

    let general = GeneralOptions {
        app_name: args.app_name.clone(),
        stage: args.stage.clone(),
        phase: args.phase,
        quiet: args.quiet,
        dev_mode: args.dev,
    };

    let deployment = match config::resolve(general, &[&explicit, &env]) {
        Ok(deployment) => deployment,
        Err(e) => {
            report_config_error(&e);
            return ExitCode::from(1);
        }
    };

    match run(&args, &deployment).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

fn report_config_error(err: &ConfigError) {
    eprintln!("{}", err);

    if let ConfigError::Missing {
        passphrase_suggestion: Some(suggestion),
        ..
    } = err
    {
        println!(
            "\nHere's a generated passphrase you can use:\n\n{}=\"{}\"\n",
            RequiredField::Passphrase.env_var(),
            suggestion
        );
    }
}

async fn run(args: &Args, config: &DeploymentConfig) -> Result<()> {
    let (registry, mode) = if config.dev_mode {
        (Arc::new(WorkerRegistry::in_memory()?), StateMode::PreferLocal)
    } else {
        let registry = WorkerRegistry::open(&args.platform_path)
            .with_context(|| format!("opening platform at {}", args.platform_path.display()))?;
        let store = SqliteStateStore::open(&args.state_path)
            .with_context(|| format!("opening state at {}", args.state_path.display()))?;
        (Arc::new(registry), StateMode::Durable(Arc::new(store)))
    };

    let orchestrator = Orchestrator::new(Arc::new(LocalEngine::new(registry.clone())), mode);
    let outcome = orchestrator.run(config).await?;

    match outcome {
        Outcome::Deployed { url, .. } => {
            if config.dev_mode {
                let host = Arc::new(EdgeHost::new(
                    HostConfig {
                        port: args.dev_port,
                    },
                    registry,
                ));
                info!("Serving {} locally on port {} (Ctrl-C to stop)", url, args.dev_port);
                host.run_until(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
            }
        }
        Outcome::Destroyed { removed } => {
            info!("Destroyed {} worker(s)", removed.len());
        }
        Outcome::State { workers } => {
            println!("{}", serde_json::to_string_pretty(&workers)?);
        }
    }

    Ok(())
}
