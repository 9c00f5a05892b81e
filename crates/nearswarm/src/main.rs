use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nearswarm::agents::{PluginLoader, SwarmAgent};
use nearswarm::cache::MarketDataClient;
use nearswarm::models::{NearswarmConfig, Params};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nearswarm", about = "LLM agent swarms for NEAR Protocol")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config/nearswarm.toml")]
    config: PathBuf,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect and maintain plugins on disk
    Plugins {
        #[command(subcommand)]
        action: PluginsAction,
    },
    /// Scaffold new components
    Create {
        #[command(subcommand)]
        what: CreateTarget,
    },
    /// Evaluate the market for a token on a fixed interval until Ctrl-C
    Run {
        agent: String,
        /// Seconds between evaluations
        #[arg(long, default_value_t = 60)]
        interval: u64,
        #[arg(long, default_value = "near")]
        token: String,
    },
    /// Run one operation on an agent
    Execute {
        agent: String,
        #[arg(long)]
        operation: String,
        /// JSON arguments
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Put an action to a swarm vote
    Propose {
        #[arg(long)]
        action: String,
        /// JSON object of action parameters
        #[arg(long, default_value = "{}")]
        params: String,
        /// Comma-separated agents; the first proposes. Defaults to every plugin.
        #[arg(long, value_delimiter = ',')]
        agents: Vec<String>,
        /// Record the action's outcome against the voters right away
        #[arg(long, value_enum)]
        outcome: Option<Outcome>,
    },
    /// Talk to an agent's model; reads lines from stdin without --message
    Chat {
        agent: String,
        #[arg(long, short)]
        message: Option<String>,
    },
    /// Show or update stored agent reputations
    Reputation {
        #[command(subcommand)]
        action: Option<ReputationAction>,
    },
}

#[derive(Subcommand, Debug)]
enum ReputationAction {
    /// Print every stored reputation (the default)
    Show,
    /// Credit or debit the voters of a finished proposal
    Record {
        /// `propose` output or a bare consensus result; `-` reads stdin
        file: PathBuf,
        #[arg(long, value_enum)]
        outcome: Outcome,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    fn succeeded(self) -> bool {
        self == Outcome::Success
    }
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Load and validate the configuration
    Validate,
    /// Print the effective configuration with secrets masked
    Show,
    /// Set one dotted key, e.g. `swarm.min_votes 3`
    Set { key: String, value: String },
}

#[derive(Subcommand, Debug)]
enum PluginsAction {
    List,
    /// Parse one plugin's descriptor and report problems
    Validate { name: String },
    /// Copy a local plugin directory into the plugin directory
    Install {
        source: PathBuf,
        /// Defaults to the descriptor's name
        #[arg(long)]
        name: Option<String>,
    },
    /// Replace an installed plugin with a newer copy
    Update {
        name: String,
        #[arg(long)]
        from: PathBuf,
    },
    /// Delete an installed plugin
    Remove { name: String },
}

#[derive(Subcommand, Debug)]
enum CreateTarget {
    /// Create `<plugins_dir>/<name>/agent.yaml`
    Agent {
        name: String,
        /// Defaults to the agent name
        #[arg(long)]
        role: Option<String>,
    },
}

#[derive(Serialize)]
struct PluginSummary {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let output = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{output}");
    Ok(())
}

fn parse_object(raw: &str, what: &str) -> Result<Params> {
    match serde_json::from_str(raw).with_context(|| format!("Failed to parse {what} JSON"))? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("{what} must be a JSON object, got {other}"),
    }
}

fn load_config(path: &Path) -> Result<NearswarmConfig> {
    nearswarm::load_config(path)
        .with_context(|| format!("Failed to load config: {}", path.display()))
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        return std::io::read_to_string(std::io::stdin()).context("Failed to read stdin");
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn setup(path: &Path) -> Result<(NearswarmConfig, PluginLoader)> {
    let config = load_config(path)?;
    let loader = nearswarm::build_loader(&config);
    Ok((config, loader))
}

async fn config_command(path: &Path, action: ConfigAction, pretty: bool) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let text = toml::to_string_pretty(&NearswarmConfig::default())?;
            std::fs::write(path, text)
                .with_context(|| format!("Failed to write config: {}", path.display()))?;
            print_json(&serde_json::json!({"created": path}), pretty)
        }
        ConfigAction::Validate => {
            let config = load_config(path)?;
            nearswarm::agents::create_provider(&config.llm).context("Invalid LLM settings")?;
            print_json(&serde_json::json!({"valid": true, "path": path}), pretty)
        }
        ConfigAction::Show => print_json(&load_config(path)?.redacted(), pretty),
        ConfigAction::Set { key, value } => {
            let value = nearswarm::manage::set_config_value(path, &key, &value)?;
            print_json(&serde_json::json!({"updated": key, "value": value, "path": path}), pretty)
        }
    }
}

async fn plugins_command(path: &Path, action: PluginsAction, pretty: bool) -> Result<()> {
    let (_, loader) = setup(path)?;
    match action {
        PluginsAction::List => {
            let mut summaries = Vec::new();
            for name in loader.discover().await? {
                let summary = match loader.read_descriptor(&name).await {
                    Ok(d) => PluginSummary {
                        name,
                        role: Some(d.role),
                        version: Some(d.version),
                        description: Some(d.description),
                        error: None,
                    },
                    Err(e) => PluginSummary {
                        name,
                        role: None,
                        version: None,
                        description: None,
                        error: Some(e.to_string()),
                    },
                };
                summaries.push(summary);
            }
            print_json(&summaries, pretty)
        }
        PluginsAction::Validate { name } => {
            let descriptor = loader
                .read_descriptor(&name)
                .await
                .with_context(|| format!("Plugin {name} is invalid"))?;
            let known = loader.registry().contains(&descriptor.role);
            if !known {
                bail!("plugin {name} has role {} which no agent implements", descriptor.role);
            }
            print_json(
                &serde_json::json!({"valid": true, "name": name, "role": descriptor.role}),
                pretty,
            )
        }
        PluginsAction::Install { source, name } => {
            let path = nearswarm::manage::install_plugin(loader.dir(), &source, name.as_deref())?;
            print_json(&serde_json::json!({"installed": path}), pretty)
        }
        PluginsAction::Update { name, from } => {
            let path = nearswarm::manage::update_plugin(loader.dir(), &name, &from)?;
            print_json(&serde_json::json!({"updated": path}), pretty)
        }
        PluginsAction::Remove { name } => {
            let path = nearswarm::manage::remove_plugin(loader.dir(), &name)?;
            print_json(&serde_json::json!({"removed": path}), pretty)
        }
    }
}

async fn chat(agent: &dyn SwarmAgent, message: &str) -> Result<String> {
    let output = agent
        .execute("chat", serde_json::json!({"message": message}))
        .await
        .with_context(|| format!("chat failed on {}", agent.name()))?;
    Ok(output["reply"].as_str().unwrap_or_default().to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Config { action } => config_command(&cli.config, action, cli.pretty).await?,
        Command::Plugins { action } => plugins_command(&cli.config, action, cli.pretty).await?,
        Command::Create {
            what: CreateTarget::Agent { name, role },
        } => {
            let (_, loader) = setup(&cli.config)?;
            let path = nearswarm::create_agent_scaffold(loader.dir(), &name, role.as_deref())?;
            print_json(&serde_json::json!({"created": path}), cli.pretty)?;
        }
        Command::Run {
            agent,
            interval,
            token,
        } => {
            let (config, loader) = setup(&cli.config)?;
            let agent = loader
                .load_plugin(&agent)
                .await
                .with_context(|| format!("Failed to load agent {agent}"))?;
            let market = MarketDataClient::new(&config.market)
                .context("Failed to build market data client")?;
            let cancel = CancellationToken::new();

            // Handle shutdown signals
            let signal = cancel.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Received shutdown signal");
                signal.cancel();
            });

            let pretty = cli.pretty;
            let stats = nearswarm::run_agent(
                Arc::clone(&agent),
                Some(Arc::new(market)),
                &token,
                Duration::from_secs(interval.max(1)),
                cancel,
                |proposal, vote| {
                    let line = serde_json::json!({"proposal": proposal.id, "vote": vote});
                    if let Err(e) = print_json(&line, pretty) {
                        tracing::warn!(error = %e, "failed to print vote");
                    }
                },
            )
            .await;
            tracing::info!(ticks = stats.ticks, votes = stats.votes, failures = stats.failures, "run finished");
            loader.cleanup_all().await?;
        }
        Command::Execute {
            agent,
            operation,
            args,
        } => {
            let (_, loader) = setup(&cli.config)?;
            let args = serde_json::Value::Object(parse_object(&args, "args")?);
            let agent = loader
                .load_plugin(&agent)
                .await
                .with_context(|| format!("Failed to load agent {agent}"))?;
            let output = agent
                .execute(&operation, args)
                .await
                .with_context(|| format!("{operation} failed on {}", agent.name()))?;
            print_json(&output, cli.pretty)?;
            loader.cleanup_all().await?;
        }
        Command::Propose {
            action,
            params,
            agents,
            outcome,
        } => {
            let (config, loader) = setup(&cli.config)?;
            let params = parse_object(&params, "params")?;
            let names = if agents.is_empty() {
                loader.discover().await?
            } else {
                agents
            };
            let swarm = nearswarm::build_swarm(&config, &loader, &names).await?;
            let proposal_outcome = swarm
                .propose_action(&action, params)
                .await
                .context("Proposal failed")?;
            if let Some(outcome) = outcome {
                nearswarm::record_outcome(&config, &loader, &proposal_outcome.result, outcome.succeeded())
                    .await?;
            }
            print_json(&proposal_outcome, cli.pretty)?;
            loader.cleanup_all().await?;
        }
        Command::Chat { agent, message } => {
            let (_, loader) = setup(&cli.config)?;
            let agent = loader
                .load_plugin(&agent)
                .await
                .with_context(|| format!("Failed to load agent {agent}"))?;
            match message {
                Some(message) => {
                    let reply = chat(agent.as_ref(), &message).await?;
                    print_json(&serde_json::json!({"agent": agent.name(), "reply": reply}), cli.pretty)?;
                }
                None => {
                    let mut lines = BufReader::new(tokio::io::stdin()).lines();
                    eprint!("> ");
                    while let Some(line) = lines.next_line().await? {
                        let line = line.trim();
                        if matches!(line, "exit" | "quit") {
                            break;
                        }
                        if !line.is_empty() {
                            match chat(agent.as_ref(), line).await {
                                Ok(reply) => println!("{reply}"),
                                Err(e) => eprintln!("error: {e:#}"),
                            }
                        }
                        eprint!("> ");
                    }
                }
            }
            loader.cleanup_all().await?;
        }
        Command::Reputation { action } => match action.unwrap_or(ReputationAction::Show) {
            ReputationAction::Show => {
                let config = load_config(&cli.config)?;
                let Some(ledger) = nearswarm::open_ledger(&config.reputation)? else {
                    bail!("reputation tracking is disabled in {}", cli.config.display());
                };
                print_json(&ledger.snapshot()?, cli.pretty)?;
            }
            ReputationAction::Record { file, outcome } => {
                let (config, loader) = setup(&cli.config)?;
                let result = nearswarm::parse_consensus_result(&read_input(&file)?)?;
                let recorded =
                    nearswarm::record_outcome(&config, &loader, &result, outcome.succeeded()).await?;
                print_json(
                    &serde_json::json!({"proposal": result.proposal_id, "recorded": recorded}),
                    cli.pretty,
                )?;
            }
        },
    }

    Ok(())
}
