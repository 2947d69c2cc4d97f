mod config;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use uuid::Uuid;

use forge_core::runtime::{PlannerRun, PlannerTask, RuntimeConfig};
use forge_core::token::guard;
use forge_core::{AllowAllPolicy, NoopExecutor, ProcessGateway, WorkflowRuntime};
use forge_db::pool;

use config::ForgeConfig;

#[derive(Parser)]
#[command(name = "forge", about = "Multi-agent workflow orchestrator")]
struct Cli {
    /// Database URL (overrides FORGE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a forge config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/forge")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the forge database (requires config file or env vars)
    DbInit,
    /// Project registry
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Workflow lifecycle
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Run the polling loop and the HTTP callback server in the foreground
    Serve {
        /// Address to bind the HTTP server to
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: SocketAddr,
        /// Base URL sandboxes use to reach this server's callback endpoint
        #[arg(long, default_value = "http://localhost:8080")]
        callback_base_url: String,
    },
    /// Read your assigned task (agent mode)
    Task,
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Register a new project
    Create {
        /// Human-readable project name
        name: String,
        /// Path to the repository on disk
        repo_path: String,
        /// Default branch to target for PRs
        #[arg(long, default_value = "main")]
        default_branch: String,
    },
    /// List all registered projects
    List,
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Materialize a workflow from a TOML plan file
    Create {
        /// Project ID to run the workflow against
        project_id: Uuid,
        /// Path to the TOML plan file
        plan_file: String,
        /// Workflow kind, free-form
        #[arg(long)]
        kind: Option<String>,
    },
    /// Move a workflow from pending/paused to running
    Start { workflow_id: Uuid },
    /// Pause a running workflow; in-flight callbacks still complete
    Pause { workflow_id: Uuid },
    /// Cancel a workflow and skip its remaining steps
    Cancel { workflow_id: Uuid },
    /// Show a workflow's steps and agent runs
    Show { workflow_id: Uuid },
    /// List workflows, optionally scoped to a project
    List {
        #[arg(long)]
        project_id: Option<Uuid>,
    },
    /// Show queue depth for a workflow
    QueueMetrics { workflow_id: Uuid },
}

/// On-disk shape of a plan file: deserializes straight from TOML into
/// [`PlannerTask`]/[`PlannerRun`], mirroring the teacher's TOML plan-file
/// convention.
#[derive(Debug, Deserialize)]
struct PlanFile {
    #[serde(default)]
    tasks: Vec<PlanFileTask>,
}

#[derive(Debug, Deserialize)]
struct PlanFileTask {
    id: String,
    title: String,
    instructions: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

impl From<PlanFile> for PlannerRun {
    fn from(file: PlanFile) -> Self {
        PlannerRun {
            tasks: file
                .tasks
                .into_iter()
                .map(|t| PlannerTask {
                    id: t.id,
                    title: t.title,
                    instructions: t.instructions,
                    depends_on: t.depends_on,
                    metadata: t.metadata,
                })
                .collect(),
        }
    }
}

/// Execute the `forge init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let token_secret = config::generate_token_secret();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        auth: config::AuthSection {
            token_secret: token_secret.clone(),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  auth.token_secret = {}...{}", &token_secret[..8], &token_secret[56..]);
    println!();
    println!("Next: run `forge db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `forge db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = ForgeConfig::resolve(cli_db_url)?;

    println!("Initializing forge database...");

    pool::ensure_database_exists(&resolved.db_config).await?;

    let db_pool = pool::create_pool(&resolved.db_config).await?;

    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("forge db-init complete.");
    Ok(())
}

/// Build a `WorkflowRuntime` wired with the production adapters: real
/// sandbox launches, the HMAC token config, and the allow-all policy.
/// `NoopExecutor` stands in until a real agent provider is wired in (see
/// its own doc comment) -- this CLI's job is orchestration, not running an
/// agent in-process.
fn build_runtime(pool: sqlx::PgPool, resolved: &ForgeConfig, callback_base_url: Option<String>) -> WorkflowRuntime {
    let mut runtime_config = RuntimeConfig {
        token_config: resolved.token_config.clone(),
        ..Default::default()
    };
    if let Some(base_url) = callback_base_url {
        runtime_config.callback_base_url = base_url;
    }

    WorkflowRuntime::new(
        pool,
        Arc::new(ProcessGateway::default()),
        Arc::new(NoopExecutor),
        Arc::new(AllowAllPolicy),
        runtime_config,
    )
}

async fn run_project_command(command: ProjectCommands, runtime: &WorkflowRuntime) -> anyhow::Result<()> {
    match command {
        ProjectCommands::Create {
            name,
            repo_path,
            default_branch,
        } => {
            let project = runtime.create_project(&name, &repo_path, &default_branch).await?;
            println!("Created project {} ({})", project.id, project.name);
        }
        ProjectCommands::List => {
            let projects = runtime.list_projects().await?;
            if projects.is_empty() {
                println!("No projects registered.");
            }
            for project in projects {
                println!("{}  {}  {}", project.id, project.name, project.repo_path);
            }
        }
    }
    Ok(())
}

async fn run_workflow_command(command: WorkflowCommands, runtime: &WorkflowRuntime) -> anyhow::Result<()> {
    match command {
        WorkflowCommands::Create {
            project_id,
            plan_file,
            kind,
        } => {
            let contents = std::fs::read_to_string(&plan_file)
                .with_context(|| format!("failed to read plan file {plan_file}"))?;
            let plan: PlanFile =
                toml::from_str(&contents).with_context(|| format!("failed to parse plan file {plan_file}"))?;
            let run: PlannerRun = plan.into();

            let planner_run_id = Uuid::new_v4().to_string();
            let workflow = runtime
                .create_workflow_from_plan(project_id, &planner_run_id, kind.as_deref(), run)
                .await?;
            println!("Created workflow {} ({} tasks)", workflow.id, workflow.status);
        }
        WorkflowCommands::Start { workflow_id } => {
            let workflow = runtime.start_workflow(workflow_id).await?;
            println!("Workflow {} is now {}", workflow.id, workflow.status);
        }
        WorkflowCommands::Pause { workflow_id } => {
            let workflow = runtime.pause_workflow(workflow_id).await?;
            println!("Workflow {} is now {}", workflow.id, workflow.status);
        }
        WorkflowCommands::Cancel { workflow_id } => {
            let workflow = runtime.cancel_workflow(workflow_id).await?;
            println!("Workflow {} is now {}", workflow.id, workflow.status);
        }
        WorkflowCommands::Show { workflow_id } => {
            let detail = runtime.get_workflow_detail(workflow_id).await?;
            println!("Workflow {}  status={}", detail.workflow.id, detail.workflow.status);
            for step in &detail.steps {
                println!("  step {}  status={}  attempts={}", step.id, step.status, step.runner_attempts);
            }
            for run in &detail.agent_runs {
                println!("  agent_run {}  step={}  status={}", run.id, run.step_id, run.status);
            }
        }
        WorkflowCommands::List { project_id } => {
            let workflows = runtime.list_workflows(project_id).await?;
            if workflows.is_empty() {
                println!("No workflows found.");
            }
            for workflow in workflows {
                println!("{}  project={}  status={}", workflow.id, workflow.project_id, workflow.status);
            }
        }
        WorkflowCommands::QueueMetrics { workflow_id } => {
            let metrics = runtime.get_queue_metrics(workflow_id).await?;
            println!(
                "pending={} running={} stuck={}",
                metrics.pending, metrics.running, metrics.stuck
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // -----------------------------------------------------------------
    // Agent-mode detection: a sandboxed callback process authenticates
    // with WORKFLOW_RUNNER_ID/WORKFLOW_CALLBACK_TOKEN, never FORGE_AGENT_TOKEN
    // directly, but if it shares this binary and FORGE_AGENT_TOKEN happens to
    // be set, the operator-only command surface is blocked all the same.
    // -----------------------------------------------------------------
    if guard::is_agent_mode() {
        match cli.command {
            Commands::Task => {
                println!("forge task: agent-mode task retrieval is driven by the sandbox entry point, not this CLI.");
            }
            _ => {
                guard::require_operator_mode()?;
            }
        }
        return Ok(());
    }

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Project { command } => {
            let resolved = ForgeConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let runtime = build_runtime(db_pool.clone(), &resolved, None);
            let result = run_project_command(command, &runtime).await;
            db_pool.close().await;
            result?;
        }
        Commands::Workflow { command } => {
            let resolved = ForgeConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let runtime = build_runtime(db_pool.clone(), &resolved, None);
            let result = run_workflow_command(command, &runtime).await;
            db_pool.close().await;
            result?;
        }
        Commands::Serve { addr, callback_base_url } => {
            let resolved = ForgeConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let runtime = build_runtime(db_pool.clone(), &resolved, Some(callback_base_url));

            runtime.start_worker().await;
            let result = server::run_serve(runtime.clone(), addr).await;
            runtime.stop_worker().await;
            db_pool.close().await;
            result?;
        }
        Commands::Task => {
            println!("forge task: not available in operator mode (set FORGE_AGENT_TOKEN)");
        }
    }

    Ok(())
}
