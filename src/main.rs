//! Hive 命令行入口
//!
//! 用法：hive [--config PATH] [--machine ID] QUERY...
//! 未指定 --machine 时使用配置中第一个机台。

use std::path::PathBuf;

use anyhow::{bail, Context};
use hive::config::load_config;
use hive::CoordinatorCache;

const USAGE: &str = "Usage: hive [--config PATH] [--machine ID] QUERY...";

#[derive(Debug, Default)]
struct CliArgs {
    config: Option<PathBuf>,
    machine: Option<String>,
    query: String,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<CliArgs> {
    let mut out = CliArgs::default();
    let mut words = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config requires a path")?;
                out.config = Some(PathBuf::from(path));
            }
            "--machine" | "-m" => {
                out.machine = Some(args.next().context("--machine requires an id")?);
            }
            "--help" | "-h" => bail!(USAGE),
            _ => words.push(arg),
        }
    }
    out.query = words.join(" ");
    if out.query.trim().is_empty() {
        bail!(USAGE);
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let args = parse_args(std::env::args().skip(1))?;
    let cfg = load_config(args.config.clone()).context("Failed to load configuration")?;

    let machine = match args.machine.clone() {
        Some(m) => m,
        None => cfg
            .machine_ids()
            .into_iter()
            .next()
            .context("No agents configured; add [[agents]] entries to the config")?,
    };

    let cache = CoordinatorCache::from_config(cfg)
        .await
        .context("Failed to initialize orchestrator")?;
    let resp = cache.execute_query(&machine, &args.query).await;
    cache.tools().disconnect_all().await;

    if !resp.success {
        bail!(
            "Query failed on {}: {}",
            machine,
            resp.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    println!("{}", resp.response);
    tracing::info!(
        machine = %machine,
        agents = resp.agent_count,
        elapsed_ms = resp.execution_time_ms,
        "query finished"
    );
    Ok(())
}
