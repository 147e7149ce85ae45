//! FleetSync tail: prints reconciled updates as JSON lines.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use fleetsync_realtime::credentials::default_token_path;
use fleetsync_realtime::{
    Credential, CredentialProvider, StaticCredentials, Subscription, SyncConfig, SyncSession,
    TokenStore,
};

#[derive(Debug, Parser)]
#[command(name = "fleetsync-tail", about = "Stream fleet updates to stdout", version)]
struct Args {
    /// Topics to subscribe to (e.g. `positions`, `events`).
    #[arg(required = true)]
    topics: Vec<String>,

    /// Parameter applied to every topic, as `key=value`. Values that parse as
    /// JSON are sent as JSON, anything else as a string.
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// TOML configuration file. Defaults apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Token store path.
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// User id to connect as, together with `--token`.
    #[arg(long, requires = "token")]
    user: Option<String>,

    /// Bearer token, together with `--user`.
    #[arg(long, requires = "user")]
    token: Option<String>,

    /// Persist `--user`/`--token` to the token store.
    #[arg(long, default_value_t = false)]
    save_token: bool,
}

fn parse_param(raw: &str) -> Result<(String, serde_json::Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("parameter {raw:?} is not KEY=VALUE");
    };
    if key.is_empty() {
        bail!("parameter {raw:?} has an empty key");
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn build_subscriptions(args: &Args) -> Result<Vec<Subscription>> {
    let params = args
        .params
        .iter()
        .map(|p| parse_param(p))
        .collect::<Result<Vec<_>>>()?;
    Ok(args
        .topics
        .iter()
        .map(|topic| {
            params
                .iter()
                .fold(Subscription::new(topic.as_str()), |sub, (k, v)| {
                    sub.with_param(k.as_str(), v.clone())
                })
        })
        .collect())
}

fn credentials(args: &Args) -> Result<Box<dyn CredentialProvider>> {
    let explicit = match (&args.user, &args.token) {
        (Some(user_id), Some(token)) => Some(Credential {
            user_id: user_id.clone(),
            token: token.clone(),
        }),
        _ => None,
    };

    let path = args.token_file.clone().or_else(default_token_path);
    match (explicit, path) {
        (Some(credential), Some(path)) if args.save_token => {
            let store = TokenStore::new(path.clone())
                .with_context(|| format!("opening token store {}", path.display()))?;
            store.save(credential).context("saving token")?;
            tracing::info!(path = %path.display(), "token saved");
            Ok(Box::new(store))
        }
        (Some(credential), _) => Ok(Box::new(StaticCredentials::new(Some(credential)))),
        (None, Some(path)) => {
            let store = TokenStore::new(path.clone())
                .with_context(|| format!("opening token store {}", path.display()))?;
            Ok(Box::new(store))
        }
        (None, None) => bail!("no token store location; pass --token-file or --user/--token"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting fleetsync-tail");

    let config = match &args.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    let subscriptions = build_subscriptions(&args)?;
    let provider = credentials(&args)?;
    if provider.current().is_none() {
        tracing::warn!("no credential stored yet; the session stays parked until one is saved");
    }

    let session = SyncSession::with_websocket(config, provider.as_ref())?;
    let mut updates = session.updates();
    let mut state = session.watch_state();
    for sub in subscriptions {
        session.subscribe(sub);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                tracing::info!(state = ?*state.borrow_and_update(), "connection state");
            }
            update = updates.recv() => match update {
                Ok(update) => println!("{}", serde_json::to_string(&update)?),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "output fell behind, updates skipped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_values_parse_as_json_or_string() {
        assert_eq!(
            parse_param("deviceId=42").unwrap(),
            ("deviceId".to_string(), serde_json::json!(42))
        );
        assert_eq!(
            parse_param("group=north").unwrap(),
            ("group".to_string(), serde_json::json!("north"))
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[test]
    fn params_apply_to_every_topic() {
        let args = Args::parse_from([
            "fleetsync-tail",
            "positions",
            "events",
            "--param",
            "deviceId=7",
        ]);
        let subs = build_subscriptions(&args).unwrap();
        assert_eq!(subs.len(), 2);
        assert!(subs.iter().all(|s| s.params["deviceId"] == 7));
    }

    #[test]
    fn user_requires_token() {
        assert!(Args::try_parse_from(["fleetsync-tail", "positions", "--user", "7"]).is_err());
    }
}
