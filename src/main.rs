mod cli;

use mediaforge::{
    config, validation, BatchInput, BatchRequest, Input, Orchestrator, ResultView, StatusView,
    SubmitRequest, Submission,
};
use mf_av::{MediaEngine, ToolRegistry};
use mf_core::events::EventPayload;
use mf_core::{BlobRef, JobId, JobKind, JobState, Priority, RawParams};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "mediaforge=trace,mf_core=trace,mf_db=debug,mf_av=trace".to_string()
        } else {
            "mediaforge=debug,mf_core=info,mf_db=info,mf_av=debug".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Convert {
            input,
            kind,
            params,
            force_async,
            priority,
            idempotency_key,
            output,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(convert_file(
                cli.config.as_deref(),
                ConvertArgs {
                    input,
                    kind,
                    params: params.into_iter().collect(),
                    force_async,
                    priority,
                    idempotency_key,
                    output,
                },
            ))
        }
        Commands::Batch {
            inputs,
            kind,
            params,
            force_async,
            output_dir,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(convert_batch(
                cli.config.as_deref(),
                inputs,
                kind,
                params.into_iter().collect(),
                force_async,
                &output_dir,
            ))
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate { file } => {
            let path = file.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("mediaforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

struct ConvertArgs {
    input: PathBuf,
    kind: JobKind,
    params: RawParams,
    force_async: bool,
    priority: Priority,
    idempotency_key: Option<String>,
    output: Option<PathBuf>,
}

fn start(config_path: Option<&Path>) -> Result<Orchestrator> {
    let config = config::load_config_or_default(config_path)?;
    let engine = MediaEngine::discover(&config.tools);
    Orchestrator::from_config(config, Arc::new(engine)).context("Failed to start orchestrator")
}

/// Caller-supplied files are referenced in place, not read into memory.
fn file_input(path: &Path) -> Result<(Input, u64)> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("Input file does not exist: {:?}", path))?;
    if !meta.is_file() {
        anyhow::bail!("Input is not a file: {:?}", path);
    }
    Ok((Input::Blob(BlobRef::File(path.to_path_buf())), meta.len()))
}

fn output_path(
    orchestrator: &Orchestrator,
    kind: JobKind,
    params: &RawParams,
    input: &Path,
) -> Result<PathBuf> {
    let validated = validation::validate(kind, params, 0, &orchestrator.context().config)?;
    let ext = mf_av::ffmpeg::output_extension(kind, &validated);
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    Ok(PathBuf::from(format!("{stem}.{kind}.{ext}")))
}

async fn convert_file(config_path: Option<&Path>, args: ConvertArgs) -> Result<()> {
    let orchestrator = start(config_path)?;
    let mut events = orchestrator.subscribe();

    let (input, size) = file_input(&args.input)?;
    let output = match args.output {
        Some(path) => path,
        None => args
            .input
            .with_file_name(output_path(&orchestrator, args.kind, &args.params, &args.input)?),
    };

    let mut req = SubmitRequest::new(args.kind, input)
        .params(args.params)
        .size_hint(size)
        .force_async(args.force_async)
        .priority(args.priority);
    if let Some(key) = args.idempotency_key {
        req = req.idempotency_key(key);
    }

    tracing::info!("Submitting {:?} ({} bytes) as {}", args.input, size, args.kind);
    let result = match orchestrator.submit(req).await? {
        Submission::Completed { job_id, output } => {
            println!("Job {} completed inline", job_id);
            Some(output)
        }
        Submission::Accepted { job_id } => {
            println!("Job {} queued", job_id);
            wait_for(&orchestrator, &mut events, job_id).await?
        }
    };

    if let Some(bytes) = result {
        tokio::fs::write(&output, &bytes)
            .await
            .with_context(|| format!("Failed to write output: {:?}", output))?;
        println!("Output: {:?} ({} bytes)", output, bytes.len());
    }

    orchestrator.shutdown().await;
    Ok(())
}

/// Follow events until `job_id` settles, then fetch its result.
async fn wait_for(
    orchestrator: &Orchestrator,
    events: &mut broadcast::Receiver<mf_core::events::Event>,
    job_id: JobId,
) -> Result<Option<bytes::Bytes>> {
    loop {
        if orchestrator.job_status(job_id)?.state.is_terminal() {
            break;
        }
        match events.recv().await {
            Ok(event) if event.payload.job_id() == Some(job_id) => match &event.payload {
                EventPayload::JobProgress { progress, .. } => {
                    tracing::debug!("Job {} at {:.0}%", job_id, progress * 100.0);
                }
                EventPayload::JobRetrying { attempt, error, .. } => {
                    println!("Attempt {} failed ({}); retrying", attempt, error.message);
                }
                payload if payload.is_terminal() => break,
                _ => {}
            },
            Ok(_) => {}
            // Missed events; the status check at the top of the loop catches up.
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    let status = orchestrator.job_status(job_id)?;
    match orchestrator.get_result(job_id).await? {
        ResultView::Ready { output } => Ok(Some(output)),
        ResultView::NotReady { state } => {
            match (state, status.error) {
                (JobState::Failed, Some(error)) => {
                    anyhow::bail!("Job {} failed ({}): {}", job_id, error.kind, error.message)
                }
                (state, _) => println!("Job {} ended {}", job_id, state),
            }
            Ok(None)
        }
    }
}

async fn convert_batch(
    config_path: Option<&Path>,
    inputs: Vec<PathBuf>,
    kind: JobKind,
    params: RawParams,
    force_async: bool,
    output_dir: &Path,
) -> Result<()> {
    let orchestrator = start(config_path)?;
    let mut events = orchestrator.subscribe();
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output dir: {:?}", output_dir))?;

    let mut batch_inputs = Vec::with_capacity(inputs.len());
    for path in &inputs {
        let (input, size) = file_input(path)?;
        batch_inputs.push(BatchInput::new(input).with_size_hint(size));
    }

    let mut req = BatchRequest::new(kind, params.clone(), batch_inputs);
    req.force_async = force_async;
    let handle = orchestrator.submit_batch(req).await?;
    println!(
        "Batch {} with {} children",
        handle.batch_id,
        handle.child_ids.len()
    );

    for (path, job_id) in inputs.iter().zip(&handle.child_ids) {
        let output = output_dir.join(output_path(&orchestrator, kind, &params, path)?);
        match wait_for(&orchestrator, &mut events, *job_id).await {
            Ok(Some(bytes)) => {
                tokio::fs::write(&output, &bytes)
                    .await
                    .with_context(|| format!("Failed to write output: {:?}", output))?;
                println!("  ✓ {:?} -> {:?}", path, output);
            }
            Ok(None) => println!("  - {:?} produced no output", path),
            Err(e) => println!("  ✗ {:?}: {:#}", path, e),
        }
    }

    if let StatusView::Batch(status) = orchestrator.get_status(*handle.batch_id.as_uuid())? {
        println!("Batch {}: {}", status.id, status.state);
    }

    orchestrator.shutdown().await;
    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = config::load_config_or_default(config_path)?;
    let tools = ToolRegistry::discover(&config.tools).check_all();
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Image conversion still works; other kinds will fail.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            config::Config::default()
        }
    };

    println!(
        "  Queue: {} workers, {} attempts, {}ms retry backoff",
        config.queue.workers, config.queue.max_attempts, config.queue.retry_backoff_ms
    );
    println!("  Storage: {:?}", config.storage.backend);
    for kind in JobKind::ALL {
        let limits = config.limits(kind);
        println!(
            "  {}: inline up to {} bytes, max {} bytes, timeout {}s",
            kind, limits.sync_threshold_bytes, limits.max_input_bytes, limits.timeout_secs
        );
    }
    for warning in config.validate() {
        println!("  ⚠ {}", warning);
    }

    Ok(())
}
