//! jobwire CLI - worker, job submission, and queue administration.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobwire_core::app::{
    Dispatcher, JobOutcome, QueueAdmin, QueueDeclarationRequest, WorkerBuilder,
};
use jobwire_core::config::{BackendKind, Config};
use jobwire_core::domain::{
    ChatMessage, JobId, PromptTransaction, QueueDeclaration, QueueMetadataUpdate,
};
use jobwire_core::typed::Task;
use serde::Serialize;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod handlers;
mod services;

use handlers::EchoHandler;
use services::Services;

/// jobwire - priority job dispatch with waitable results
#[derive(Parser)]
#[command(name = "jobwire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Queue backend: memory, redis or amqp
    #[arg(long, env = "JOBWIRE_BACKEND", global = true)]
    backend: Option<BackendKind>,

    /// Queue name (defaults to JOBWIRE_QUEUE_NAME)
    #[arg(long, global = true)]
    queue: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume the queue with the built-in echo handler
    Worker {
        /// Unacknowledged deliveries allowed at once
        #[arg(long)]
        prefetch: Option<u16>,

        /// Model name reported by the echo handler
        #[arg(long, default_value = "echo")]
        model: String,
    },
    /// Create a job status and publish a prompt
    Submit {
        prompt: String,

        /// Prepend a system message (sends a chat completion)
        #[arg(long)]
        system: Option<String>,

        #[arg(long)]
        priority: Option<u8>,

        /// Use this job id instead of a generated one
        #[arg(long)]
        job_id: Option<String>,

        /// Wait for the result
        #[arg(long)]
        wait: bool,
    },
    /// Print the current status record of a job
    Status { job_id: String },
    /// Wait for a job and print its outcome
    Result {
        job_id: String,

        /// Per-cycle wait in seconds (defaults to JOBWIRE_WAIT_TIMEOUT_SECS)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Queue administration
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Run dispatcher and worker in-process against memory backends
    Demo,
}

#[derive(Subcommand)]
enum QueueCommands {
    Declare {
        name: String,
        #[arg(long)]
        max_priority: Option<u8>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Not durable across broker restarts
        #[arg(long)]
        transient: bool,
    },
    Delete {
        name: String,
    },
    /// Drop every ready message (irreversible)
    Purge {
        name: String,
    },
    /// Change model / description
    Update {
        name: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    List,
    /// Active consumers across all queues
    Workers,
    /// Inspect resident messages without consuming them
    Messages {
        name: String,
    },
    /// Remove one message by job id (drains and requeues the queue)
    RemoveMessage {
        name: String,
        message_id: String,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn outcome_json(job_id: &JobId, outcome: &JobOutcome) -> serde_json::Value {
    match outcome {
        JobOutcome::Completed(result) => json!({"job_id": job_id, "status": "completed", "result": result}),
        JobOutcome::Failed(error) => json!({"job_id": job_id, "status": "error", "error": error}),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::from_env().context("invalid JOBWIRE_* configuration")?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(queue) = cli.queue {
        config.worker.queue_name = queue;
    }
    init_tracing(cli.verbose, cli.json_logs || config.log_json);

    match cli.command {
        Commands::Demo => return demo(&config).await,
        Commands::Worker { prefetch, model } => {
            let services = Services::connect(&config).await?;
            run_worker(&config, &services, prefetch, model).await?;
            services.queue.close().await?;
        }
        Commands::Submit {
            prompt,
            system,
            priority,
            job_id,
            wait,
        } => {
            let services = Services::connect(&config).await?;
            let dispatcher = dispatcher(&config, &services);
            let mut transaction = match system {
                Some(system) => PromptTransaction::chat(vec![
                    ChatMessage::System {
                        content: system.into(),
                    },
                    ChatMessage::user(prompt),
                ]),
                None => PromptTransaction::single(prompt),
            }
            .with_priority(priority);
            if let Some(job_id) = job_id {
                transaction = transaction.with_job_id(JobId::new(job_id));
            }

            let job_id = dispatcher
                .submit(&config.worker.queue_name, transaction.into_envelope()?)
                .await
                .context("submitting job")?;
            if wait {
                let outcome = dispatcher.get_result(&job_id, None).await?;
                print_json(&outcome_json(&job_id, &outcome))?;
            } else {
                print_json(&json!({"job_id": job_id}))?;
            }
            services.queue.close().await?;
        }
        Commands::Status { job_id } => {
            let services = Services::connect(&config).await?;
            let status = services.storage.get_job_status(&JobId::new(job_id)).await?;
            print_json(&status)?;
        }
        Commands::Result {
            job_id,
            timeout_secs,
        } => {
            let services = Services::connect(&config).await?;
            let job_id = JobId::new(job_id);
            let outcome = dispatcher(&config, &services)
                .get_result(&job_id, timeout_secs.map(Duration::from_secs))
                .await?;
            print_json(&outcome_json(&job_id, &outcome))?;
        }
        Commands::Queue { command } => {
            let services = Services::connect(&config).await?;
            let admin = QueueAdmin::new(services.queue.clone(), services.metadata.clone());
            queue_command(&admin, command).await?;
            services.queue.close().await?;
        }
    }
    Ok(())
}

fn dispatcher(config: &Config, services: &Services) -> Dispatcher {
    Dispatcher::new(services.queue.clone(), services.storage.clone())
        .with_metadata(services.metadata.clone())
        .with_wait(config.wait.clone())
}

async fn run_worker(
    config: &Config,
    services: &Services,
    prefetch: Option<u16>,
    model: String,
) -> Result<()> {
    let queue_name = config.worker.queue_name.clone();
    if config.backend == BackendKind::Memory {
        services
            .queue
            .declare_queue(&QueueDeclaration::new(&queue_name).with_max_priority(10))
            .await?;
    }

    let worker = WorkerBuilder::new(services.queue.clone(), services.storage.clone())
        .register::<PromptTransaction, _>(EchoHandler::new(model))?
        .expect_tasks(&[PromptTransaction::TYPE])
        .prefetch(prefetch.unwrap_or(config.worker.prefetch))
        .build()?;
    let handle = worker.spawn(queue_name);
    info!(consumer_tag = handle.consumer_tag(), "worker running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    handle.shutdown().await?;
    Ok(())
}

async fn queue_command(admin: &QueueAdmin, command: QueueCommands) -> Result<()> {
    match command {
        QueueCommands::Declare {
            name,
            max_priority,
            model,
            description,
            transient,
        } => {
            let mut declaration = QueueDeclaration::new(name);
            if let Some(max) = max_priority {
                declaration = declaration.with_max_priority(max);
            }
            if transient {
                declaration = declaration.transient();
            }
            let request = QueueDeclarationRequest {
                declaration,
                model,
                description,
            };
            print_json(&admin.declare_queue(request).await?)?;
        }
        QueueCommands::Delete { name } => {
            let dropped = admin.delete_queue(&name).await?;
            print_json(&json!({"queue": name, "dropped": dropped}))?;
        }
        QueueCommands::Purge { name } => {
            let purged = admin.purge_queue(&name).await?;
            print_json(&json!({"queue": name, "purged": purged}))?;
        }
        QueueCommands::Update {
            name,
            model,
            description,
        } => {
            let update = QueueMetadataUpdate { model, description };
            if update.is_empty() {
                anyhow::bail!("nothing to update: pass --model and/or --description");
            }
            print_json(&admin.update_queue(&name, update).await?)?;
        }
        QueueCommands::List => print_json(&admin.list_queues().await?)?,
        QueueCommands::Workers => print_json(&admin.active_workers().await?)?,
        QueueCommands::Messages { name } => print_json(&admin.list_messages(&name).await?)?,
        QueueCommands::RemoveMessage { name, message_id } => {
            let removed = admin.remove_message(&name, &message_id).await?;
            print_json(&json!({"queue": name, "message_id": message_id, "removed": removed}))?;
        }
    }
    Ok(())
}

/// Priority ordering, a failing job, and result waits in one process.
async fn demo(config: &Config) -> Result<()> {
    let services = Services::memory();
    services.queue.connect().await?;
    let admin = QueueAdmin::new(services.queue.clone(), services.metadata.clone());
    let dispatcher = dispatcher(config, &services);
    let queue = "demo";

    admin
        .declare_queue(
            QueueDeclarationRequest::new(QueueDeclaration::new(queue).with_max_priority(10))
                .with_model("echo")
                .with_description("in-process demo queue"),
        )
        .await?;

    // worker 起動前に投入して priority 順を見せる
    let mut jobs = Vec::new();
    for (prompt, priority) in [("low priority", 1), ("high priority", 9), ("fail", 5)] {
        let envelope = PromptTransaction::single(prompt)
            .with_priority(Some(priority))
            .into_envelope()?;
        jobs.push(dispatcher.submit(queue, envelope).await?);
    }
    print_json(&admin.list_messages(queue).await?)?;

    let worker = WorkerBuilder::new(services.queue.clone(), services.storage.clone())
        .register::<PromptTransaction, _>(EchoHandler::new("echo"))?
        .build()?;
    let handle = worker.spawn(queue);

    for job_id in &jobs {
        let outcome = dispatcher
            .get_result(job_id, Some(Duration::from_secs(5)))
            .await?;
        print_json(&outcome_json(job_id, &outcome))?;
    }
    print_json(&admin.list_queues().await?)?;

    handle.shutdown().await?;
    services.queue.close().await?;
    Ok(())
}
