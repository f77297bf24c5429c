use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Operator CLI for the tenant gateway admin API", long_about = None)]
struct Cli {
    #[arg(short, long, env = "GATEWAY_ADMIN_URL", default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "GATEWAY_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check gateway status
    Status,
    /// Circuits, cache and realtime hub at a glance
    Overview,
    /// Inspect or reset circuit breakers
    Circuits {
        #[command(subcommand)]
        action: Option<CircuitAction>,
    },
    /// Inspect or manage the response cache
    Cache {
        #[command(subcommand)]
        action: Option<CacheAction>,
    },
}

#[derive(Subcommand)]
enum CircuitAction {
    /// Reset every circuit, or only the named backend's
    Reset { backend: Option<String> },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove every cached entry
    Flush,
    /// Remove every entry carrying a tag
    Invalidate { tag: String },
    /// Zero the hit/miss counters
    ResetStats,
}

impl Commands {
    fn request(&self) -> (Method, String) {
        match self {
            Commands::Status => (Method::GET, "/admin/status".into()),
            Commands::Overview => (Method::GET, "/admin/overview".into()),
            Commands::Circuits { action: None } => (Method::GET, "/admin/circuits".into()),
            Commands::Circuits { action: Some(CircuitAction::Reset { backend: None }) } => {
                (Method::POST, "/admin/circuits/reset".into())
            }
            Commands::Circuits { action: Some(CircuitAction::Reset { backend: Some(b) }) } => {
                (Method::POST, format!("/admin/circuits/{}/reset", b))
            }
            Commands::Cache { action: None } => (Method::GET, "/admin/cache".into()),
            Commands::Cache { action: Some(CacheAction::Flush) } => (Method::POST, "/admin/cache/flush".into()),
            Commands::Cache { action: Some(CacheAction::Invalidate { tag }) } => {
                (Method::POST, format!("/admin/cache/invalidate/{}", tag))
            }
            Commands::Cache { action: Some(CacheAction::ResetStats) } => {
                (Method::POST, "/admin/cache/stats/reset".into())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let (method, path) = cli.command.request();
    let res = client
        .request(method, format!("{}{}", cli.url.trim_end_matches('/'), path))
        .headers(headers)
        .send()
        .await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let text = res.text().await?;
    if text.is_empty() {
        println!("{}", status);
        return Ok(());
    }
    let json: Value = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
