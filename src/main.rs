use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use keypool_gateway::{
    App, DEFAULT_UPSTREAM, HttpProbe, ProbeError, STARTUP_REFRESH_LIMIT, SecuritySettings,
    UpstreamEndpoint, UpstreamProbe, mask_key, server,
};
use reqwest::Client;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(author, version, about = "Load-balancing gateway over a pool of LLM API keys")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Query the account balance of each key once and exit.
    CheckBalance(CheckBalanceArgs),
    /// Start the OpenAI-compatible gateway.
    Serve(ServeArgs),
}

#[derive(Debug, Parser)]
struct CheckBalanceArgs {
    /// Comma separated API keys or repeat the flag multiple times.
    #[arg(
        short,
        long,
        value_delimiter = ',',
        env = "POOL_API_KEYS",
        hide_env_values = true,
        required = true
    )]
    keys: Vec<String>,

    /// Override the upstream base URL.
    #[arg(long, env = "POOL_UPSTREAM", default_value = DEFAULT_UPSTREAM)]
    upstream: String,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    /// Comma separated API keys registered at startup.
    #[arg(long, value_delimiter = ',', env = "POOL_API_KEYS", hide_env_values = true)]
    keys: Option<Vec<String>>,

    /// Override the upstream base URL.
    #[arg(long, env = "POOL_UPSTREAM", default_value = DEFAULT_UPSTREAM)]
    upstream: String,

    /// SQLite database path used to persist keys, settings and daily usage.
    #[arg(long, env = "POOL_DB_PATH", default_value = "keypool.db")]
    db_path: String,

    /// Address to bind the gateway to.
    #[arg(long, env = "POOL_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to bind the gateway to.
    #[arg(long, env = "POOL_PORT", default_value_t = 3016)]
    port: u16,

    /// Require clients to present this key on proxied requests.
    #[arg(long, env = "POOL_CLIENT_API_KEY", hide_env_values = true)]
    client_api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::CheckBalance(args) => {
            if !run_check_balance(args).await {
                std::process::exit(1);
            }
        }
        Command::Serve(args) => {
            run_server(args).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("keypool_gateway=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// 逐个查询余额，全部成功时返回 true。
async fn run_check_balance(args: CheckBalanceArgs) -> bool {
    let endpoint = match UpstreamEndpoint::parse(&args.upstream) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            eprintln!("error: {err}");
            return false;
        }
    };
    let probe = HttpProbe::new(Client::new(), endpoint);

    let mut all_ok = true;
    for key in sanitize_keys(args.keys) {
        match probe.check_balance(&key).await {
            Ok(balance) => println!("{}\t{balance:.4}", mask_key(&key)),
            Err(err) => {
                all_ok = false;
                eprintln!("{}", mask_key(&key));
                report_error(&err);
            }
        }
    }
    all_ok
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let app = App::with_endpoint(&args.upstream, &args.db_path).await?;

    if let Some(client_key) = args.client_api_key.filter(|key| !key.trim().is_empty()) {
        let mut settings = app.store().settings().snapshot().await;
        settings.security = SecuritySettings {
            api_key_enabled: true,
            api_key: client_key,
        };
        app.update_settings(settings).await?;
        info!("client API key authentication enabled");
    }

    let keys = sanitize_keys(args.keys.unwrap_or_default());
    if !keys.is_empty() {
        let results = app.gateway.register_keys(&keys, false).await;
        let registered = results.iter().filter(|result| result.ok).count();
        info!(registered, requested = keys.len(), "registered keys from command line");
    }

    let report = app.health.force_refresh(STARTUP_REFRESH_LIMIT).await;
    if report.timed_out {
        warn!(checked = report.checked, "startup balance refresh timed out");
    }
    app.health.clone().spawn();

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    server::serve(addr, app).await
}

fn sanitize_keys(keys: Vec<String>) -> Vec<String> {
    keys.into_iter()
        .map(|key| key.trim().to_owned())
        .filter(|key| !key.is_empty())
        .collect()
}

fn report_error(err: &ProbeError) {
    eprintln!("error: {err}");
    match err {
        ProbeError::Http(source) => {
            if let Some(status) = source.status() {
                eprintln!("  status: {status}");
            }
        }
        ProbeError::Status { status, .. } => {
            eprintln!("  status: {status}");
        }
        ProbeError::Rejected { code, .. } => {
            eprintln!("  upstream code: {code}");
        }
        _ => {}
    }
}
