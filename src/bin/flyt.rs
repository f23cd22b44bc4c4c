use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use flyt::definition::loader::load_definition_from_yaml;
use flyt::runtime::engine::Engine;
use flyt::runtime::instance::InstanceStatus;
use flyt::store::redis::redis_store;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a definition in memory until it completes, fails or suspends
    Run {
        /// Path to the definition YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Initial variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, serde_json::Value)>,
    },

    /// Deliver an external completion to a waiting instance (Redis store)
    Complete {
        /// Redis connection URL
        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,

        /// Process instance id
        #[arg(long)]
        instance: u64,

        /// Name of the waiting task
        #[arg(long)]
        task: String,

        /// Replacement variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, serde_json::Value)>,
    },

    /// List persisted instances (Redis store)
    Instances {
        /// Redis connection URL
        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,

        /// Filter by status (new, running, waiting, completed, failed)
        #[arg(long)]
        status: Option<String>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, serde_json::Value), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str)
        .unwrap_or_else(|_| serde_json::Value::String(val_str.to_string()));
    Ok((key, val))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, vars } => {
            let definition = load_definition_from_yaml(&file)?;
            info!(definition = %definition.id, "running definition in memory");

            let engine = Engine::new();
            let handle = engine.create_process_instance(definition);
            let mut instance = handle.lock().await;

            let initial: HashMap<_, _> = vars.into_iter().collect();
            let initial = if initial.is_empty() { None } else { Some(initial) };
            instance.start(initial).await?;

            println!("instance {}: {:?}", instance.id(), instance.status());
            if instance.status() == InstanceStatus::Waiting {
                println!("instance is suspended; a persistent store is needed to resume it later");
            }
            if let Some(error) = instance.error() {
                println!("error: {}", error);
            }
            println!(
                "variables: {}",
                serde_json::to_string_pretty(instance.variables())?
            );
        }

        Commands::Complete {
            redis,
            instance,
            task,
            vars,
        } => {
            let engine = Engine::new_with_store(redis_store(&redis)?);
            let handle = engine
                .load_process_instance(instance)
                .await?
                .ok_or_else(|| anyhow!("process instance {} not found", instance))?;
            let mut locked = handle.lock().await;

            let task_id = locked
                .get_node(&task)
                .map(|node| node.task_id)
                .ok_or_else(|| anyhow!("no waiting task named '{}' on instance {}", task, instance))?;

            let replacement: HashMap<_, _> = vars.into_iter().collect();
            let replacement = if replacement.is_empty() {
                None
            } else {
                Some(replacement)
            };
            locked.resume_task(task_id, replacement).await?;
            println!("instance {}: {:?}", locked.id(), locked.status());
        }

        Commands::Instances { redis, status } => {
            let engine = Engine::new_with_store(redis_store(&redis)?);
            let filter = match status {
                Some(status) => serde_json::json!({ "status": status }),
                None => serde_json::json!({}),
            };
            for doc in engine.query_process_instances(filter).await? {
                println!("{}", serde_json::to_string(&doc)?);
            }
        }
    }

    Ok(())
}
