//! Wallet Relay CLI
//!
//! Command-line tool for exercising the wallet relay: an in-process
//! simulation of all four contexts, a background node served over HTTP, and
//! the password-expiry check against a file store.

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;
use wallet_relay::{
    ApprovalPolicy, BackgroundNode, BroadcastHub, ContentNode, ErrorPayload, FileStore,
    MemoryRuntime, PageNode, PopupNode, RelayConfig, RelayServer, WalletCore, WalletStorage,
    actions,
};

#[derive(Parser)]
#[command(name = "wallet-relay")]
#[command(about = "Wallet extension message relay", version)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run page, content, background and popup in-process and make one call
    Simulate {
        /// Have the popup reject instead of approve
        #[arg(long)]
        reject: bool,

        /// Action the page calls
        #[arg(long, default_value = actions::SIGN_PSBT)]
        action: String,
    },

    /// Run a background node behind the HTTP/WebSocket server
    Serve {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,

        /// Bearer token required to answer approvals
        #[arg(long)]
        api_token: Option<String>,

        /// Origin allowed to call the server from a browser (repeatable)
        #[arg(long = "cors-origin")]
        cors_origins: Vec<String>,

        /// Store directory; enables wallet and origin checks on page traffic
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Run the password-expiry check against a file store
    CheckSession {
        /// Store directory
        #[arg(long)]
        store: PathBuf,
    },

    /// Show the effective configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level: Level = cli
        .log_level
        .parse()
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    FmtSubscriber::builder().with_max_level(level).init();

    let config = match &cli.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };

    match cli.command {
        Commands::Simulate { reject, action } => simulate(&config, &action, reject).await?,
        Commands::Serve {
            addr,
            api_token,
            cors_origins,
            store,
        } => {
            let mut config = config;
            if let Some(token) = api_token {
                config = config.with_api_token(token);
            }
            if !cors_origins.is_empty() {
                config = config.with_cors_origins(cors_origins);
            }
            config.validate()?;
            serve(config, addr, store).await?
        }
        Commands::CheckSession { store } => check_session(&config, store).await?,
        Commands::Info => show_info(&config)?,
    }

    Ok(())
}

/// Wallet core with canned answers
struct DemoWallet;

#[async_trait]
impl WalletCore for DemoWallet {
    async fn call(&self, action: &str, data: Value) -> std::result::Result<Value, ErrorPayload> {
        match action {
            actions::GET_ACCOUNTS => Ok(json!(["tb1qdemo0000000000000000000000000000000000"])),
            actions::GET_NETWORK => Ok(json!("testnet")),
            actions::GET_BALANCE => Ok(json!({ "confirmed": 100_000, "unconfirmed": 0, "total": 100_000 })),
            actions::ESTIMATE_FEE => Ok(json!({ "feeRate": 2, "input": data })),
            other => Err(ErrorPayload::method_not_found(other)),
        }
    }
}

async fn simulate(config: &RelayConfig, action: &str, reject: bool) -> Result<()> {
    let runtime = MemoryRuntime::new();
    let hub = BroadcastHub::new();

    let background = BackgroundNode::start(runtime.clone(), Arc::new(DemoWallet), config);
    let content = ContentNode::start(runtime.clone(), &hub, config).await;
    let page = Arc::new(PageNode::start(&hub, config).await?);
    let popup = PopupNode::start(runtime.clone(), config).await?;
    let mut announcements = popup.events();

    info!(action, "Page calling wallet");
    let caller = {
        let page = Arc::clone(&page);
        let action = action.to_string();
        tokio::spawn(async move { page.request(&action, json!({ "psbt": "70736274ff" })).await })
    };

    if ApprovalPolicy::default().requires_approval(action) {
        let announced = tokio::time::timeout(Duration::from_secs(5), announcements.recv())
            .await
            .context("no approval was announced")??;
        info!(action = %announced.action, "Popup notified");

        let Some(pending) = popup.get_approve_data().await? else {
            bail!("approval announced but nothing pending");
        };
        println!("Approval requested: {} ({})", pending.action, pending.id);

        if reject {
            popup.reject().await?;
            println!("Popup rejected");
        } else {
            popup.approve(json!({ "signed": true, "approvalId": pending.id })).await?;
            println!("Popup approved");
        }
    }

    match caller.await? {
        Ok(value) => println!("Result: {}", serde_json::to_string_pretty(&value)?),
        Err(e) => println!("Error {}: {e}", e.code()),
    }

    popup.close();
    page.shutdown();
    content.shutdown();
    background.shutdown();
    Ok(())
}

async fn serve(config: RelayConfig, addr: SocketAddr, store: Option<PathBuf>) -> Result<()> {
    if config.api_token.is_none() {
        warn!("No api token set, approvals cannot be answered over HTTP");
    }
    let node = match store {
        Some(dir) => {
            let store = FileStore::open(&dir).await?;
            info!(path = %store.path().display(), "Checking page access against store");
            let storage = WalletStorage::new(Arc::new(store)).with_password_ttl(config.password_ttl());
            BackgroundNode::start_with_storage(MemoryRuntime::new(), Arc::new(DemoWallet), storage, &config)
        }
        None => BackgroundNode::start(MemoryRuntime::new(), Arc::new(DemoWallet), &config),
    };
    RelayServer::new(node, config).serve(addr).await
}

async fn check_session(config: &RelayConfig, dir: PathBuf) -> Result<()> {
    let store = FileStore::open(&dir).await?;
    info!(path = %store.path().display(), "Checking session");
    let storage = WalletStorage::new(Arc::new(store)).with_password_ttl(config.password_ttl());
    let status = storage.check_session().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn show_info(config: &RelayConfig) -> Result<()> {
    println!("Wallet Relay v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Links:");
    println!("  INJECT_CONTENT       page <-> content");
    println!("  CONTENT_BG           content <-> background");
    println!("  BG_POPUP             popup <-> background");
    println!("  KEEP_ALIVE_INTERVAL  keep-alive only");
    println!();
    println!("Configuration:");
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
