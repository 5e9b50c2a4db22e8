use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strand_core::command::{Command, CommandChannel, InMemoryCommandChannel};
use strand_core::config::AppConfig;
use strand_core::context::{ExecutionContext, Services};
use strand_core::event::{EventBus, GraphEvent};
use strand_core::variables::{Segment, SystemVariables, VariablePool};

use strand_engine::layers::EventBusLayer;
use strand_engine::{
    seed_inputs, Graph, GraphDescription, GraphEngine, ReqwestRequester, RunLogger,
    SingleNodeRun, SqlitePersistenceLayer, StrategyRegistry, TracingLayer,
};

#[derive(Parser)]
#[command(name = "strand", version, about = "Workflow graph engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "strand.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow and print its events as JSON lines
    Run {
        /// Workflow description (JSON)
        workflow: PathBuf,
        /// Start input as name=value (value parsed as JSON when possible)
        #[arg(long = "input", value_name = "NAME=VALUE")]
        inputs: Vec<String>,
        /// System variable as name=value (query, user_id, conversation_id, ...)
        #[arg(long = "sys", value_name = "NAME=VALUE")]
        sys: Vec<String>,
        /// Environment variable as name=value, readable as `env.<name>`
        #[arg(long = "env", value_name = "NAME=VALUE")]
        env: Vec<String>,
        /// Conversation variable as name=value, readable as `conversation.<name>`
        #[arg(long = "conversation", value_name = "NAME=VALUE")]
        conversation: Vec<String>,
    },
    /// Run one node in isolation
    Node {
        workflow: PathBuf,
        node_id: String,
        /// Pool input as node.var=value
        #[arg(long = "input", value_name = "SELECTOR=VALUE")]
        inputs: Vec<String>,
    },
    /// Resume a paused run from the persisted snapshot
    Resume {
        workflow: PathBuf,
        execution_id: String,
    },
    /// Validate a workflow description without running it
    Validate { workflow: PathBuf },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strand=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { workflow } => {
            let graph = load_graph(&workflow)?;
            println!(
                "ok: {} nodes, {} edges, root '{}'",
                graph.len(),
                graph.edges().len(),
                graph.root_id()
            );
        }
        Commands::Run {
            workflow,
            inputs,
            sys,
            env,
            conversation,
        } => {
            let graph = load_graph(&workflow)?;
            let system: SystemVariables = serde_json::from_value(Value::Object(parse_sys(&sys)?))
                .context("invalid --sys value")?;
            let mut pool =
                VariablePool::with_scopes(system, parse_scope(&env)?, parse_scope(&conversation)?);
            seed_inputs(&mut pool, graph.root_id(), &parse_pairs(&inputs)?)?;

            let ctx = ExecutionContext::from_config(&config, services());
            let execution_id = uuid::Uuid::new_v4().to_string();
            let channel = command_channel(&config, &execution_id).await?;
            let engine = GraphEngine::new(graph, pool, channel.clone(), config.engine.limits(), ctx)
                .with_execution_id(execution_id);
            drive(&config, engine, channel).await?;
        }
        Commands::Resume {
            workflow,
            execution_id,
        } => {
            let graph = load_graph(&workflow)?;
            let Some(persistence) = &config.persistence else {
                bail!("resume needs [persistence] sqlite_path in the config");
            };
            let store = SqlitePersistenceLayer::open(Path::new(&persistence.sqlite_path))?;
            let Some(snapshot) = store.load_snapshot(&execution_id)? else {
                bail!("no paused run with id {execution_id}");
            };
            let ctx = ExecutionContext::from_config(&config, services());
            let channel = command_channel(&config, &execution_id).await?;
            let engine =
                GraphEngine::resume(graph, snapshot, channel.clone(), config.engine.limits(), ctx)?;
            drive(&config, engine, channel).await?;
        }
        Commands::Node {
            workflow,
            node_id,
            inputs,
        } => {
            let graph = load_graph(&workflow)?;
            let ctx = ExecutionContext::from_config(&config, services());
            let execution_id = uuid::Uuid::new_v4().to_string();
            let channel = command_channel(&config, &execution_id).await?;
            let run = SingleNodeRun::new(
                &graph,
                &node_id,
                VariablePool::new(),
                &parse_pairs(&inputs)?,
                channel.clone(),
                config.engine.limits(),
                ctx,
            )?
            .with_execution_id(execution_id)
            .with_layer(Arc::new(TracingLayer));
            stop_on_interrupt(channel);
            let mut events = run.run();
            while let Some(event) = events.next().await {
                print_event(&event)?;
            }
        }
    }

    Ok(())
}

fn load_graph(path: &Path) -> anyhow::Result<Arc<Graph>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read workflow {}", path.display()))?;
    let desc = GraphDescription::from_json(&raw)?;
    Ok(Graph::build(&desc, &StrategyRegistry::default())?)
}

/// Model, tool and sandbox providers live outside the engine; only the HTTP
/// requester has a built-in implementation.
fn services() -> Services {
    Services::new().with_http(Arc::new(ReqwestRequester::new()))
}

#[cfg(feature = "redis")]
async fn command_channel(
    config: &AppConfig,
    execution_id: &str,
) -> anyhow::Result<Arc<dyn CommandChannel>> {
    if let Some(url) = config.command.as_ref().and_then(|c| c.redis_url.as_deref()) {
        let prefix = config
            .command
            .as_ref()
            .map(|c| c.key_prefix.as_str())
            .unwrap_or("strand:commands");
        let channel =
            strand_core::command::RedisCommandChannel::connect(url, prefix, execution_id).await?;
        info!(key = channel.key(), "Listening for commands on Redis");
        return Ok(Arc::new(channel));
    }
    Ok(Arc::new(InMemoryCommandChannel::new()))
}

#[cfg(not(feature = "redis"))]
async fn command_channel(
    config: &AppConfig,
    _execution_id: &str,
) -> anyhow::Result<Arc<dyn CommandChannel>> {
    if config.command.as_ref().is_some_and(|c| c.redis_url.is_some()) {
        warn!("redis_url is set but strand was built without the redis feature");
    }
    Ok(Arc::new(InMemoryCommandChannel::new()))
}

/// Attach the configured layers, run to the end and print every event.
async fn drive(
    config: &AppConfig,
    mut engine: GraphEngine,
    channel: Arc<dyn CommandChannel>,
) -> anyhow::Result<()> {
    engine = engine.with_layer(Arc::new(TracingLayer));
    if let Some(persistence) = &config.persistence {
        let store = SqlitePersistenceLayer::open(Path::new(&persistence.sqlite_path))?;
        engine = engine.with_layer(Arc::new(store));
    }

    let cancel = CancellationToken::new();
    let mut logger = None;
    let log_config = config.log.clone().unwrap_or_default();
    if log_config.enabled {
        let bus = Arc::new(EventBus::new(256));
        let run_logger = RunLogger::new(log_config.log_dir(), log_config.level);
        logger = Some(tokio::spawn(run_logger.run(
            bus.clone(),
            engine.execution_id().to_string(),
            cancel.clone(),
        )));
        engine = engine.with_layer(Arc::new(EventBusLayer::new(bus)));
    }

    stop_on_interrupt(channel);

    info!(execution_id = engine.execution_id(), "Starting run");
    let mut failed = false;
    let mut events = engine.run();
    while let Some(event) = events.next().await {
        failed |= matches!(event, GraphEvent::RunFailed { .. });
        print_event(&event)?;
    }
    drop(events);

    if let Some(handle) = logger {
        // the logger stops by itself after the terminal event
        if tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .is_err()
        {
            cancel.cancel();
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Ctrl-C asks the run to stop cleanly instead of killing it.
fn stop_on_interrupt(channel: Arc<dyn CommandChannel>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping run");
            if let Err(e) = channel.send(Command::stop()).await {
                warn!(error = %e, "Failed to send stop command");
            }
        }
    });
}

fn print_event(event: &GraphEvent) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, event)?;
    writeln!(stdout)?;
    Ok(())
}

/// Parse `name=value` pairs; values that are valid JSON keep their type.
fn parse_pairs(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let Some((name, raw)) = pair.split_once('=') else {
            bail!("expected NAME=VALUE, got '{pair}'");
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(name.trim().to_string(), value);
    }
    Ok(map)
}

/// System variables are text except the dialogue counter.
fn parse_sys(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut map = parse_pairs(pairs)?;
    for (name, value) in map.iter_mut() {
        if name != "dialogue_count" && !value.is_string() {
            *value = Value::String(value.to_string());
        }
    }
    Ok(map)
}

/// Environment and conversation variables keep their JSON type.
fn parse_scope(pairs: &[String]) -> anyhow::Result<BTreeMap<String, Segment>> {
    Ok(parse_pairs(pairs)?
        .into_iter()
        .map(|(name, value)| (name, Segment::from_value(value)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs_keeps_json_types() {
        let map = parse_pairs(&[
            "n=3".to_string(),
            "flag=true".to_string(),
            "name=alice".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
        ])
        .unwrap();
        assert_eq!(map["n"], Value::from(3));
        assert_eq!(map["flag"], Value::Bool(true));
        assert_eq!(map["name"], Value::String("alice".into()));
        assert!(map["tags"].is_array());
    }

    #[test]
    fn test_parse_sys_keeps_query_as_text() {
        let map = parse_sys(&["query=42".to_string(), "dialogue_count=2".to_string()]).unwrap();
        assert_eq!(map["query"], Value::String("42".into()));
        assert_eq!(map["dialogue_count"], Value::from(2));
        let system: SystemVariables = serde_json::from_value(Value::Object(map)).unwrap();
        assert_eq!(system.query.as_deref(), Some("42"));
    }

    #[test]
    fn test_parse_scope_feeds_env_and_conversation() {
        let env = parse_scope(&["api_base=https://example.test".to_string()]).unwrap();
        let conversation = parse_scope(&["turns=3".to_string(), "topic=rust".to_string()]).unwrap();
        let pool = VariablePool::with_scopes(SystemVariables::default(), env, conversation);
        assert_eq!(
            pool.get(&strand_core::variables::Selector::new("env", &["api_base"])),
            Some(Segment::String("https://example.test".into()))
        );
        assert_eq!(
            pool.get(&strand_core::variables::Selector::new("conversation", &["turns"])),
            Some(Segment::Integer(3))
        );
    }

    #[test]
    fn test_run_command_accepts_scope_flags() {
        let cli = Cli::try_parse_from([
            "strand",
            "run",
            "flow.json",
            "--env",
            "region=eu",
            "--conversation",
            "topic=rust",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { env, conversation, .. } => {
                assert_eq!(env, vec!["region=eu".to_string()]);
                assert_eq!(conversation, vec!["topic=rust".to_string()]);
            }
            _ => panic!("expected the run command"),
        }
    }

    #[test]
    fn test_parse_pairs_rejects_missing_equals() {
        assert!(parse_pairs(&["oops".to_string()]).is_err());
    }
}
