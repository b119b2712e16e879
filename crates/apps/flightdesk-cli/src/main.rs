use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use flightdesk_net::{
    ConnectionEvent, ConnectionHub, Envelope, NetConfig, RequestExecutor, RestClient,
};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "flightdesk", about = "flightdesk network operator CLI", version)]
struct Cli {
    /// TOML configuration; built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// GET a path from a configured REST service and print the JSON body.
    Get {
        service: String,
        path: String,
        /// Query parameters as key=value.
        #[arg(long = "query", short = 'q')]
        query: Vec<String>,
    },
    /// Print push messages for the given topics until interrupted.
    Watch {
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(required = true)]
        topics: Vec<String>,
        /// Server-side filter (JSON) registered for every topic.
        #[arg(long)]
        filter: Option<String>,
    },
    /// Send one envelope to the push endpoint.
    Send {
        #[arg(long)]
        endpoint: Option<String>,
        kind: String,
        /// JSON payload.
        #[arg(default_value = "null")]
        payload: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => NetConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => NetConfig::default(),
    };

    match cli.command {
        Command::Get { service, path, query } => get(&config, &service, &path, &query).await,
        Command::Watch { endpoint, topics, filter } => {
            let endpoint = push_endpoint(&config, endpoint)?;
            watch(&config, &endpoint, &topics, filter.as_deref()).await
        }
        Command::Send { endpoint, kind, payload } => {
            let endpoint = push_endpoint(&config, endpoint)?;
            send(&config, &endpoint, kind, &payload).await
        }
    }
}

fn push_endpoint(config: &NetConfig, endpoint: Option<String>) -> anyhow::Result<String> {
    endpoint
        .or_else(|| config.push_endpoint.clone())
        .ok_or_else(|| anyhow!("no push endpoint: pass --endpoint or set push_endpoint"))
}

fn parse_query(pairs: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .ok_or_else(|| anyhow!("query parameter '{pair}' is not key=value"))
        })
        .collect()
}

async fn get(config: &NetConfig, service: &str, path: &str, query: &[String]) -> anyhow::Result<()> {
    let executor = RequestExecutor::new(&config.request);
    let client = RestClient::from_config(config, service, executor)?;
    let ctx = client.context();
    let body = client.get(&ctx, path, parse_query(query)?).await?;
    println!("{}", serde_json::to_string_pretty(&body.unwrap_or(Value::Null))?);
    Ok(())
}

async fn watch(
    config: &NetConfig,
    endpoint: &str,
    topics: &[String],
    filter: Option<&str>,
) -> anyhow::Result<()> {
    let filter: Option<Value> = filter.map(serde_json::from_str).transpose().context("parsing --filter")?;
    let hub = ConnectionHub::new(config.connection.clone());
    let manager = hub.manager(endpoint);
    let mut events = manager.events();

    for topic in topics {
        let registered = match &filter {
            Some(filter) => hub.subscribe_remote(endpoint, topic, filter.clone()).await,
            None => hub.subscribe(endpoint, topic),
        };
        let Some(mut rx) = registered else {
            bail!("duplicate topic {topic}");
        };
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match serde_json::to_string(&message) {
                    Ok(line) => println!("{line}"),
                    Err(err) => log::warn!("watch: unprintable message err={err}"),
                }
            }
        });
    }

    if let Err(err) = hub.connect(endpoint).await {
        log::warn!("watch: initial connect failed endpoint={endpoint} err={err}");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ConnectionEvent::Abandoned { attempts }) => {
                    hub.disconnect_all().await;
                    bail!("gave up on {endpoint} after {attempts} reconnect attempts");
                }
                Ok(event) => log::debug!("watch: event={event:?}"),
                Err(err) => log::debug!("watch: event stream err={err}"),
            },
        }
    }
    hub.disconnect_all().await;
    Ok(())
}

async fn send(config: &NetConfig, endpoint: &str, kind: String, payload: &str) -> anyhow::Result<()> {
    let payload: Value = serde_json::from_str(payload).context("parsing payload")?;
    let hub = ConnectionHub::new(config.connection.clone());
    hub.connect(endpoint).await?;
    let delivered = hub.send(endpoint, &Envelope::new(kind, payload)).await;
    hub.disconnect(endpoint).await;
    if !delivered {
        bail!("envelope not delivered to {endpoint}");
    }
    Ok(())
}
