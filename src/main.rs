use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use insight_relay::card::CardType;
use insight_relay::{
    AppContext, KnowledgeCard, MessageHub, Pipeline, PipelineConfig, Task, TaskStatus,
};

#[derive(Parser)]
#[command(name = "insight-relay")]
#[command(about = "Staged analysis pipeline with a vector-indexed knowledge memory", long_about = None)]
struct Cli {
    /// Data directory (overrides the config file and INSIGHT_RELAY_DATA_DIR)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a task and run it through all stages
    Run {
        /// What to analyze
        #[arg(short = 'D', long)]
        description: String,

        /// Raw material file, or "-" for stdin
        #[arg(short, long)]
        input: String,
    },

    /// Continue a task from its current stage
    Resume {
        task_id: String,
    },

    /// Show a task's state
    Status {
        task_id: String,
    },

    /// Show the cards accepted for a task
    Cards {
        task_id: String,
    },

    /// Show the audit trail of a task
    Audit {
        task_id: String,
    },

    /// Similarity search over all knowledge cards
    Search {
        /// Search query
        query: String,

        /// Maximum results to return
        #[arg(short, long)]
        limit: Option<usize>,

        /// Filter by card type (fact, interpretation, risk, action)
        #[arg(short = 't', long = "type")]
        card_type: Option<String>,
    },

    /// List registered skills
    Skills {
        /// Only skills owned by this agent
        #[arg(short, long)]
        agent: Option<String>,

        /// Only skills in this category
        #[arg(long)]
        category: Option<String>,
    },

    /// Show how a prompt would be routed
    Route {
        text: String,
    },

    /// Rebuild the vector index from the card table
    RebuildIndex,

    /// List all tasks
    Tasks,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "insight_relay=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        // Routing needs no stored state
        Commands::Route { ref text } => {
            let router = insight_relay::ModelRouter::new(config.router.max_input_chars);
            let decision = router.route(text);
            match decision.score {
                Some(score) => println!("Score:   {}", score),
                None => println!("Score:   - (input rejected, using fallback)"),
            }
            println!("Tier:    {}", decision.tier.as_str());
            println!("Backend: {}", decision.backend.as_str());
        }

        Commands::Run {
            ref description,
            ref input,
        } => {
            let raw = read_input(input)?;
            let (ctx, hub) = open_state(config).await?;
            let pipeline = Pipeline::new(ctx, hub.clone());
            let task = pipeline.run(description, &raw).await?;
            print_task(&task);
            for card in hub.cards(&task.task_id).await? {
                print_card(&card);
            }
            if task.is_failed() {
                anyhow::bail!("task {} failed", task.task_id);
            }
        }

        Commands::Resume { ref task_id } => {
            let (ctx, hub) = open_state(config).await?;
            let pipeline = Pipeline::new(ctx, hub);
            let task = pipeline.resume(task_id).await?;
            print_task(&task);
            if task.is_failed() {
                anyhow::bail!("task {} failed", task.task_id);
            }
        }

        Commands::Status { ref task_id } => {
            let (_, hub) = open_state(config).await?;
            let task = hub.get_status(task_id).await?;
            print_task(&task);
            if let Some(material) = hub.prepared_material(task_id).await? {
                println!(
                    "  Material: {} ({} rows), quality {:.2} ({})",
                    material.shape.as_str(),
                    material.rows.len(),
                    material.quality,
                    material.quality_label.as_str()
                );
            }
        }

        Commands::Cards { ref task_id } => {
            let (_, hub) = open_state(config).await?;
            let cards = hub.cards(task_id).await?;
            if cards.is_empty() {
                println!("No cards yet for {}", task_id);
            }
            for card in cards {
                print_card(&card);
            }
            let links = hub.causal_links(task_id).await?;
            if !links.is_empty() {
                println!("Causal chain:");
                for link in links {
                    println!("  {} --{}--> {}", link.from_node, link.relation_label, link.to_node);
                }
            }
        }

        Commands::Audit { ref task_id } => {
            let (_, hub) = open_state(config).await?;
            let entries = hub.audit_log(task_id).await?;
            println!("Audit trail for {}:", task_id);
            for e in entries {
                let mark = if e.accepted { "✓" } else { "✗" };
                let note = if e.note.is_empty() {
                    String::new()
                } else {
                    format!("  ({})", e.note)
                };
                println!(
                    "  #{:<3} {} {} {} -> {}  {}{}",
                    e.seq,
                    mark,
                    e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    e.from_agent,
                    e.to_agent,
                    &e.payload_digest[..12.min(e.payload_digest.len())],
                    note
                );
            }
        }

        Commands::Search {
            ref query,
            limit,
            ref card_type,
        } => {
            let (ctx, _) = open_state(config).await?;
            let card_type = match card_type {
                Some(t) => Some(
                    CardType::parse(t).with_context(|| format!("Unknown card type: {}", t))?,
                ),
                None => None,
            };
            let limit = limit.unwrap_or(ctx.config.search.default_top_k);
            let hits = ctx.memory.search_filtered(query, limit, card_type).await?;

            if hits.is_empty() {
                println!("No results found for: {}", query);
            } else {
                println!("Found {} results for: {}\n", hits.len(), query);
                for (i, hit) in hits.iter().enumerate() {
                    println!(
                        "{}. [{}] {} ({:.3})",
                        i + 1,
                        hit.card.card_type.as_str(),
                        hit.card.title,
                        hit.score
                    );
                    println!("   Task: {}  Card: {}", hit.card.task_id, hit.card.card_id);
                }
            }
        }

        Commands::Skills {
            ref agent,
            ref category,
        } => {
            let (ctx, _) = open_state(config).await?;
            let skills = ctx.skills.list(agent.as_deref(), category.as_deref()).await;
            println!("Skills:");
            for skill in skills {
                println!("  {}", skill);
            }
        }

        Commands::RebuildIndex => {
            let (ctx, _) = open_state(config).await?;
            let count = ctx.memory.rebuild_index().await?;
            ctx.memory.verify_index().await?;
            let embedder = ctx.memory.embedder();
            println!(
                "Index rebuilt with {} cards ({} embedder, dim {})",
                count,
                embedder.name(),
                embedder.dimension()
            );
        }

        Commands::Tasks => {
            let (_, hub) = open_state(config).await?;
            let tasks = hub.list_tasks().await;
            if tasks.is_empty() {
                println!("No tasks found. Run 'insight-relay run' first.");
            } else {
                println!("Tasks:");
                for task in tasks {
                    println!("  {}", task.display_line());
                }
            }
        }
    }

    Ok(())
}

/// Build the shared context and open the hub over it
async fn open_state(config: PipelineConfig) -> Result<(Arc<AppContext>, Arc<MessageHub>)> {
    let ctx = AppContext::build(config)
        .await
        .context("Failed to initialize pipeline")?;
    let hub = ctx.open_hub()?;
    Ok((ctx, hub))
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("Failed to read stdin")?;
        Ok(raw)
    } else {
        std::fs::read_to_string(Path::new(input))
            .with_context(|| format!("Failed to read input file {}", input))
    }
}

fn print_task(task: &Task) {
    let icon = match task.status {
        TaskStatus::Pending => "○",
        TaskStatus::Running => "◐",
        TaskStatus::Completed => "●",
        TaskStatus::Failed => "✗",
    };
    println!("{} {}", icon, task.display_line());
}

fn print_card(card: &KnowledgeCard) {
    println!(
        "\n[{}] {}  (confidence {:.2})",
        card.card_type.as_str(),
        card.title,
        card.confidence
    );
    for line in card.content.render().lines() {
        println!("  {}", line);
    }
    for note in &card.degradations {
        println!("  ! {}", note);
    }
}
