use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use graphql_autoclient::{
    Client, ClientBuilder, ClientConfig, ClientError, OperationKind, Result, StreamEvent, TypeGraph,
};

#[derive(Parser)]
#[command(name = "graphql-autoclient", version, about = "Generated GraphQL client for any schema")]
struct Cli {
    /// Client configuration file
    #[arg(short, long, default_value = "graphql-autoclient.yaml")]
    config: PathBuf,

    /// Schema SDL file; the endpoint is introspected when omitted
    #[arg(short, long)]
    schema: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List generated operations
    List { kind: Option<OperationKind> },
    /// Print the rendered operation without sending it
    Render {
        operation: String,
        /// Arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },
    /// Run a query or mutation and print its data
    Run {
        operation: String,
        #[arg(long)]
        args: Option<String>,
    },
    /// Subscribe and print events until interrupted
    Watch {
        operation: String,
        #[arg(long)]
        args: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = load_client(&cli).await?;

    match cli.command {
        Command::List { kind } => {
            let kinds = match kind {
                Some(kind) => vec![kind],
                None => OperationKind::ALL.to_vec(),
            };
            for kind in kinds {
                for name in client.registry().list_by_kind(kind) {
                    println!("{}\t{}", kind, name);
                }
            }
        }
        Command::Render { operation, args } => {
            println!("{}", client.render(&operation, &parse_args(args.as_deref())?)?);
        }
        Command::Run { operation, args } => {
            let data = client.execute(&operation, &parse_args(args.as_deref())?).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Command::Watch { operation, args } => {
            let stream = client.subscribe(&operation, &parse_args(args.as_deref())?).await?;
            info!(query_id = %stream.query_id(), "subscribed");
            let mut events = stream.listen();
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(StreamEvent::Data(data)) => println!("{}", serde_json::to_string_pretty(&data)?),
                        Some(StreamEvent::Error(e)) => warn!(error = %e, "subscription error"),
                        Some(StreamEvent::Complete) | None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupted");
                        break;
                    }
                }
            }
            client.shutdown().await;
        }
    }
    Ok(())
}

async fn load_client(cli: &Cli) -> Result<Client> {
    let config = ClientConfig::load(&cli.config)?;
    match &cli.schema {
        Some(path) => {
            let sdl = fs::read_to_string(path)
                .map_err(|e| ClientError::Config(format!("failed to read {}: {}", path.display(), e)))?;
            ClientBuilder::new(TypeGraph::from_sdl(&sdl)?)
                .config(&config)
                .build()
        }
        None => Client::connect(&config).await,
    }
}

fn parse_args(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw) {
        Ok(Value::Object(args)) => Ok(args),
        Ok(_) => Err(ClientError::Config("--args must be a JSON object".to_string())),
        Err(e) => Err(ClientError::Config(format!("--args is not valid JSON: {}", e))),
    }
}
