use anyhow::Context;
use bingo_core::{MutationKind, Payload};
use bingod::daemon::{DaemonConfig, DaemonRuntime};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "bingod=info,bingo_core=info";

#[derive(Debug, Clone, PartialEq)]
enum CliMode {
    Run,
    Status,
    Drain,
    Enqueue { kind: MutationKind, payload: Payload },
    Failed,
    ClearFailed,
    Resubmit(String),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let mut mode = CliMode::Run;
    while let Some(arg) = args.next() {
        mode = match arg.as_str() {
            "--status" => CliMode::Status,
            "--drain" => CliMode::Drain,
            "--enqueue" => {
                let kind = args.next().context("--enqueue requires KIND and JSON")?;
                let payload = args.next().context("--enqueue requires KIND and JSON")?;
                CliMode::Enqueue {
                    kind: MutationKind::parse(&kind)?,
                    payload: parse_payload(&payload)?,
                }
            }
            "--failed" => CliMode::Failed,
            "--clear-failed" => CliMode::ClearFailed,
            "--resubmit" => CliMode::Resubmit(args.next().context("--resubmit requires an ID")?),
            "--help" | "-h" => CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        };
    }
    Ok(mode)
}

fn parse_payload(raw: &str) -> anyhow::Result<Payload> {
    match serde_json::from_str::<serde_json::Value>(raw).context("payload is not valid JSON")? {
        serde_json::Value::Object(payload) => Ok(payload),
        _ => anyhow::bail!("payload must be a JSON object"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_help() {
    println!("Usage: bingod [OPTION]");
    println!("  (no option)            Run the sync daemon until Ctrl-C");
    println!("  --status               Print queue status and storage stats");
    println!("  --drain                Run one sync pass if the API is reachable");
    println!("  --enqueue KIND JSON    Queue a mutation (occasion, games, pulltabs, moneycount, photo)");
    println!("  --failed               List items that will not be retried");
    println!("  --clear-failed         Discard all failed items");
    println!("  --resubmit ID          Queue a failed item again");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_help();
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let keep_synced = config.keep_synced;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    if mode == CliMode::Run {
        return daemon.run().await;
    }

    let manager = daemon.manager();
    let result = match mode {
        CliMode::Status => {
            let status = manager.get_queue_status().await?;
            let storage = manager.storage_stats().await?;
            let sync = manager.sync_meta().await?;
            print_json(&serde_json::json!({
                "queue": status,
                "storage": storage,
                "sync": sync,
            }))
        }
        CliMode::Drain => {
            if !daemon.probe().await {
                eprintln!("bingod: remote API is unreachable; nothing was sent");
            }
            let report = manager.drain().await;
            if report.is_none() && manager.connectivity().is_online() {
                eprintln!("bingod: another sync pass is already running; nothing was sent");
            }
            if !keep_synced {
                manager.purge_synced().await?;
            }
            print_json(&report)
        }
        CliMode::Enqueue { kind, payload } => {
            let id = manager.enqueue(kind, payload).await?;
            println!("{id}");
            Ok(())
        }
        CliMode::Failed => print_json(&manager.list_failed().await?),
        CliMode::ClearFailed => {
            let cleared = manager.clear_failed().await?;
            println!("cleared {cleared} failed item(s)");
            Ok(())
        }
        CliMode::Resubmit(id) => {
            let new_id = manager.resubmit_failed(&id).await?;
            println!("{new_id}");
            Ok(())
        }
        CliMode::Run | CliMode::Help => Ok(()),
    };
    daemon.shutdown().await;
    result
}
