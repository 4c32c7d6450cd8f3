//! wamp-demo: example WAMP client.
//!
//! Joins a realm, registers `com.example.add2`, subscribes to
//! `com.example.oncounter`, and calls and publishes on a timer until the
//! router goes away for good or the process is interrupted.

mod component;
mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wamp_client::transport::detect_transport;
use wamp_client::{AnonymousAuth, Client, RetryPolicy, Session, SessionConfig};
use wamp_core::Serializer;

/// wamp-demo: example WAMP client
#[derive(Parser)]
#[command(name = "wamp-demo", version, about = "Example WAMP client: add2 callee, counter subscriber, periodic caller and publisher")]
struct Cli {
    /// Router URL (ws://, wss://, tcp:// or rs://)
    #[arg(short, long)]
    url: Option<String>,

    /// Realm to join
    #[arg(short, long)]
    realm: Option<String>,

    /// Wire serializer
    #[arg(short, long, value_enum)]
    serializer: Option<SerializerArg>,

    /// Reconnect rounds before giving up
    #[arg(long)]
    max_retries: Option<u32>,

    /// Config file path
    #[arg(long)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SerializerArg {
    Json,
    Cbor,
}

impl From<SerializerArg> for Serializer {
    fn from(arg: SerializerArg) -> Self {
        match arg {
            SerializerArg::Json => Serializer::Json,
            SerializerArg::Cbor => Serializer::Cbor,
        }
    }
}

fn parse_serializer(name: &str) -> Result<Serializer> {
    match name.to_ascii_lowercase().as_str() {
        "json" => Ok(Serializer::Json),
        "cbor" => Ok(Serializer::Cbor),
        other => bail!("unknown serializer '{other}' (expected json or cbor)"),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over the built-in defaults.
    let default_filter = if cli.verbose {
        "wamp_demo=debug,wamp_client=debug,wamp_core=debug"
    } else {
        "wamp_demo=info,wamp_client=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose)
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("wamp-demo: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(config::default_path);
    let cfg = config::Config::load(&config_path)?;

    // CLI overrides config.
    let url = cli.url.unwrap_or(cfg.router.url);
    let realm = cli.realm.unwrap_or(cfg.router.realm);
    let serializer = match cli.serializer {
        Some(arg) => arg.into(),
        None => parse_serializer(&cfg.router.serializer)?,
    };
    let max_retries = cli.max_retries.unwrap_or(cfg.router.max_retries);
    detect_transport(&url).with_context(|| format!("cannot use router URL {url}"))?;

    let session = Session::new(SessionConfig::new(realm.clone()).with_authenticator(AnonymousAuth::new()));
    component::attach(&session, cfg.demo.clone());

    let client = Client::new(session.clone())
        .with_url(url.clone(), serializer)
        .with_retry(RetryPolicy {
            max_retries,
            ..RetryPolicy::default()
        });
    info!(%url, %realm, ?serializer, "starting");

    let connect = client.connect();
    tokio::pin!(connect);
    let exit = tokio::select! {
        exit = &mut connect => exit.context("router connection failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, leaving realm");
            let Ok(leaving) = session.leave(None, Some("client shutting down")) else {
                // Not joined: nothing to say goodbye to.
                return Ok(());
            };
            if let Err(error) = leaving.await {
                warn!(%error, "leave did not complete");
            }
            connect.await.context("router connection failed")?
        }
    };

    info!(was_clean = exit.was_clean, reason = ?exit.reason, "session ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializer_names() {
        assert_eq!(parse_serializer("json").unwrap(), Serializer::Json);
        assert_eq!(parse_serializer("CBOR").unwrap(), Serializer::Cbor);
        assert!(parse_serializer("msgpack").is_err());
    }

    #[test]
    fn cli_flags_parse() {
        let cli = Cli::parse_from([
            "wamp-demo",
            "--url",
            "tcp://127.0.0.1:8081",
            "--realm",
            "demo",
            "--serializer",
            "cbor",
            "--max-retries",
            "0",
        ]);
        assert_eq!(cli.url.as_deref(), Some("tcp://127.0.0.1:8081"));
        assert_eq!(cli.realm.as_deref(), Some("demo"));
        assert!(matches!(cli.serializer, Some(SerializerArg::Cbor)));
        assert_eq!(cli.max_retries, Some(0));
        assert!(!cli.verbose);
    }
}
