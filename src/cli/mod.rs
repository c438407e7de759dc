//! Command-line interface for callqa.
//!
//! Provides commands for running the ingestion watcher, the stage
//! workers, the whole pipeline, and for inspecting call state and
//! failed jobs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{ChatClient, WhisperCli};
use crate::broker::FileBroker;
use crate::config::Config;
use crate::domain::{
    Call, EvaluationJob, FailedJob, TranscriptionJob, EVALUATION_JOBS, FAILED_JOBS,
    TRANSCRIPTION_JOBS,
};
use crate::ingest::{CallWatcher, FileLedger, Ledger, WatcherConfig};
use crate::store::CallStore;
use crate::workers::{EvaluationWorker, TranscriptionWorker};

/// callqa - Call recording QA pipeline
#[derive(Parser, Debug)]
#[command(name = "callqa")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch the recordings directory and enqueue new calls
    Watch {
        /// Scan once and exit instead of watching
        #[arg(long)]
        once: bool,
    },

    /// Run the transcription worker
    Transcribe {
        /// Drain currently pending jobs and exit
        #[arg(long)]
        once: bool,
    },

    /// Run the evaluation worker
    Evaluate {
        /// Drain currently pending jobs and exit
        #[arg(long)]
        once: bool,
    },

    /// Run the whole pipeline (watcher plus both workers)
    Run,

    /// Show call status
    Status {
        /// Call ID; lists all calls when omitted
        call_id: Option<String>,
    },

    /// Show failed jobs and queue health
    Failed,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let config = Config::load()?;

        match self.command {
            Commands::Watch { once } => cmd_watch(&config, once).await,
            Commands::Transcribe { once } => cmd_transcribe(&config, once).await,
            Commands::Evaluate { once } => cmd_evaluate(&config, once).await,
            Commands::Run => cmd_run(&config).await,
            Commands::Status { call_id } => cmd_status(&config, call_id).await,
            Commands::Failed => cmd_failed(&config).await,
            Commands::Config => cmd_config(&config),
        }
    }
}

struct Components {
    store: Arc<CallStore>,
    broker: Arc<FileBroker>,
}

fn open_components(config: &Config) -> Result<Components> {
    let store = Arc::new(
        CallStore::open(&config.database_path)
            .with_context(|| format!("Failed to open store: {}", config.database_path.display()))?,
    );
    let broker = Arc::new(
        FileBroker::new(&config.queue_dir).with_max_redeliveries(config.max_redeliveries),
    );
    Ok(Components { store, broker })
}

async fn build_watcher(config: &Config, components: &Components) -> Result<Arc<CallWatcher>> {
    tokio::fs::create_dir_all(&config.watch_path).await?;
    let ledger: Arc<dyn Ledger> = Arc::new(FileLedger::open(&config.ledger_path).await?);

    Ok(Arc::new(CallWatcher::new(
        WatcherConfig::new(&config.watch_path),
        Arc::clone(&components.store),
        Arc::clone(&components.broker),
        ledger,
    )))
}

fn build_transcription_worker(config: &Config, components: &Components) -> Arc<TranscriptionWorker> {
    let recognizer = Arc::new(WhisperCli::new(
        &config.whisper_binary,
        &config.whisper_model,
    ));
    Arc::new(TranscriptionWorker::new(
        Arc::clone(&components.store),
        Arc::clone(&components.broker),
        recognizer,
        config.retry.clone(),
    ))
}

fn build_evaluation_worker(config: &Config, components: &Components) -> Arc<EvaluationWorker> {
    let model = Arc::new(ChatClient::new(
        &config.chat_base_url,
        &config.chat_model,
        config.chat_api_key.clone(),
    ));
    Arc::new(EvaluationWorker::new(
        Arc::clone(&components.store),
        Arc::clone(&components.broker),
        model,
        config.retry.clone(),
    ))
}

async fn cmd_watch(config: &Config, once: bool) -> Result<()> {
    let components = open_components(config)?;
    let watcher = build_watcher(config, &components).await?;

    let result = watcher.scan_once().await?;
    println!(
        "Scan: {} new, {} already seen, {} errors",
        result.new_calls, result.already_seen, result.errors
    );

    if once {
        return Ok(());
    }

    let handle = watcher.watch().await?;
    tokio::signal::ctrl_c().await?;
    handle.stop().await?;
    Ok(())
}

async fn cmd_transcribe(config: &Config, once: bool) -> Result<()> {
    let components = open_components(config)?;
    let worker = build_transcription_worker(config, &components);

    if once {
        let stats = components
            .broker
            .process_available::<TranscriptionJob, _>(TRANSCRIPTION_JOBS, worker, config.prefetch)
            .await?;
        println!(
            "Transcription: {} acked, {} requeued, {} dead-lettered",
            stats.acked, stats.requeued, stats.dead
        );
        return Ok(());
    }

    let handle = components.broker.start_consumer::<TranscriptionJob, _>(
        TRANSCRIPTION_JOBS,
        worker,
        config.prefetch,
        Duration::from_millis(config.poll_interval_ms),
    );
    tokio::signal::ctrl_c().await?;
    handle.stop().await?;
    Ok(())
}

async fn cmd_evaluate(config: &Config, once: bool) -> Result<()> {
    let components = open_components(config)?;
    let worker = build_evaluation_worker(config, &components);

    if once {
        let stats = components
            .broker
            .process_available::<EvaluationJob, _>(EVALUATION_JOBS, worker, config.prefetch)
            .await?;
        println!(
            "Evaluation: {} acked, {} requeued, {} dead-lettered",
            stats.acked, stats.requeued, stats.dead
        );
        return Ok(());
    }

    let handle = components.broker.start_consumer::<EvaluationJob, _>(
        EVALUATION_JOBS,
        worker,
        config.prefetch,
        Duration::from_millis(config.poll_interval_ms),
    );
    tokio::signal::ctrl_c().await?;
    handle.stop().await?;
    Ok(())
}

async fn cmd_run(config: &Config) -> Result<()> {
    let components = open_components(config)?;

    let watcher = build_watcher(config, &components).await?;
    let result = watcher.scan_once().await?;
    println!(
        "Scan: {} new, {} already seen, {} errors",
        result.new_calls, result.already_seen, result.errors
    );
    let watch_handle = watcher.watch().await?;

    let poll = Duration::from_millis(config.poll_interval_ms);
    let transcription = components.broker.start_consumer::<TranscriptionJob, _>(
        TRANSCRIPTION_JOBS,
        build_transcription_worker(config, &components),
        config.prefetch,
        poll,
    );
    let evaluation = components.broker.start_consumer::<EvaluationJob, _>(
        EVALUATION_JOBS,
        build_evaluation_worker(config, &components),
        config.prefetch,
        poll,
    );

    println!("Pipeline running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    watch_handle.stop().await?;
    transcription.stop().await?;
    evaluation.stop().await?;
    Ok(())
}

async fn cmd_status(config: &Config, call_id: Option<String>) -> Result<()> {
    let components = open_components(config)?;

    match call_id {
        Some(id) => {
            let call_id: Uuid = id.parse().context("Invalid call ID")?;
            let call = components
                .store
                .get_call(call_id)?
                .with_context(|| format!("No call found with id {}", call_id))?;
            print_call_detail(&components.store, &call)?;
        }
        None => {
            let calls = components.store.list_calls()?;
            if calls.is_empty() {
                println!("No calls yet");
                return Ok(());
            }
            for call in calls {
                println!(
                    "{}  {:<19}  {}",
                    call.id,
                    call.status,
                    call.audio_path.display()
                );
            }
        }
    }
    Ok(())
}

fn print_call_detail(store: &CallStore, call: &Call) -> Result<()> {
    println!("Call:     {}", call.id);
    println!("Audio:    {}", call.audio_path.display());
    println!("Status:   {}", call.status);
    println!("Created:  {}", call.created_at.to_rfc3339());
    if let Some(duration) = call.duration_seconds {
        println!("Duration: {:.1}s", duration);
    }
    if let Some(error) = &call.error_message {
        println!("Error:    {}", error);
    }

    if let Some(transcript) = store.get_transcript(call.id)? {
        println!(
            "Transcript: {} segments ({}, {})",
            transcript.segments.len(),
            transcript.model_name,
            transcript.language
        );
    }
    if let Some(eval) = store.get_evaluation(call.id)? {
        println!(
            "Evaluation: overall {}/5 ({} v{})",
            eval.overall_score, eval.evaluator_type, eval.evaluator_version
        );
        for (category, score) in &eval.category_scores {
            println!("  {:<32} {}/5", category, score.score);
        }
    }
    Ok(())
}

async fn cmd_failed(config: &Config) -> Result<()> {
    let components = open_components(config)?;

    for queue in [TRANSCRIPTION_JOBS, EVALUATION_JOBS] {
        let stats = components.broker.queue_stats(queue).await?;
        println!(
            "{:<20} {} pending, {} acked, {} dead",
            queue, stats.pending, stats.acked, stats.dead
        );

        for record in components.broker.dead_letters(queue).await? {
            let error = record.error.as_deref().unwrap_or("unknown");
            println!("  dead {}  {}", record.message_id, error);
        }
    }

    let failed = components.broker.pending(FAILED_JOBS).await?;
    println!("\n{} failed job(s)", failed.len());
    for delivery in failed {
        match serde_json::from_value::<FailedJob>(delivery.payload.clone()) {
            Ok(job) => println!("  {}  {}", job.call_id, job.error),
            Err(_) => println!("  {}  <malformed record>", delivery.message_id),
        }
    }
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    println!("Home:        {}", config.home.display());
    println!("Watch:       {}", config.watch_path.display());
    println!("Database:    {}", config.database_path.display());
    println!("Queues:      {}", config.queue_dir.display());
    println!("Ledger:      {}", config.ledger_path.display());
    println!("Whisper:     {} ({})", config.whisper_binary.display(), config.whisper_model);
    println!("Chat:        {} ({})", config.chat_base_url, config.chat_model);
    println!(
        "Retry:       {} attempts, {}ms initial, {}ms cap",
        config.retry.max_attempts, config.retry.initial_delay_ms, config.retry.max_delay_ms
    );
    println!("Prefetch:    {}", config.prefetch);
    println!("Redelivery:  max {}", config.max_redeliveries);
    Ok(())
}
