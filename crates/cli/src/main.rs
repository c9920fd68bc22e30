use hearth_backends::{
    Manifest, MockBackend, NoGpuSource, NvidiaSmiSource, OllamaBackend, OllamaClient,
    OllamaModelStore, StaticGpuSource, DEFAULT_ENDPOINT,
};
use hearth_cli::cli::commands::{
    BackendArgs, BackendKind, CheckArgs, CliArgs, Commands, ConfigArgs, EmbedArgs, GenerateArgs,
    ModelsArgs, MonitorArgs, OutputFormatArg, PlacementArgs,
};
use hearth_cli::cli::output::{generation_summary, CheckReport, OutputFormatter};
use hearth_cli::logging::{init_logging, LoggingConfig};
use hearth_cli::{NAME, VERSION};
use hearth_core::{
    ChatMessage, EmbeddingRequest, GenerationRequest, GenerationResult, GpuDevice, GpuSource,
    InferenceBackend, LoadOptions, ModelStore, ResourceAlert, RuntimeConfig, SamplingParams,
};
use hearth_monitor::{AlertHandler, MonitorSettings, ResourceMonitor, RuntimeGauges, SysinfoProbe};
use hearth_runtime::{InferenceManager, LoggingHandler};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const EXIT_DOES_NOT_FIT: i32 = 2;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging(LoggingConfig::from_args(
        args.log_level.as_deref(),
        args.verbose,
        args.quiet,
    ));

    debug!("{} v{} starting", NAME, VERSION);
    debug!("Arguments: {:?}", args);

    let result = match &args.command {
        Commands::Models(a) => handle_models(a).await,
        Commands::Check(a) => handle_check(a).await,
        Commands::Monitor(a) => handle_monitor(a).await,
        Commands::Generate(a) => handle_generate(a).await,
        Commands::Embed(a) => handle_embed(a).await,
        Commands::Config(a) => handle_config(a),
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    };
    process::exit(exit_code);
}

fn endpoint(source: &BackendArgs) -> String {
    let raw = source
        .endpoint
        .clone()
        .or_else(|| env::var("OLLAMA_HOST").ok().filter(|h| !h.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw
    } else {
        format!("http://{}", raw)
    }
}

fn default_manifest() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("hearth").join("models.toml"))
        .filter(|path| path.is_file())
}

/// Everything a command needs to build a manager.
struct Setup {
    store: Arc<dyn ModelStore>,
    backend: Arc<dyn InferenceBackend>,
    declared_gpus: Vec<GpuDevice>,
}

fn setup(source: &BackendArgs) -> Result<Setup> {
    let client = Arc::new(OllamaClient::new(endpoint(source))?);

    let backend: Arc<dyn InferenceBackend> = match source.backend {
        BackendKind::Ollama => Arc::new(OllamaBackend::new(Arc::clone(&client))),
        BackendKind::Mock => Arc::new(MockBackend::new()),
    };

    let manifest = source.manifest.clone().or_else(default_manifest);
    let (store, declared_gpus): (Arc<dyn ModelStore>, Vec<GpuDevice>) = match manifest {
        Some(path) => {
            let manifest = Manifest::from_path(&path)
                .with_context(|| format!("Failed to load manifest {}", path.display()))?;
            info!(path = %path.display(), models = manifest.models.len(), "Using model manifest");
            let gpus = manifest.gpus.clone();
            (Arc::new(manifest.into_store()?), gpus)
        }
        None => match source.backend {
            BackendKind::Ollama => {
                debug!(endpoint = %client.endpoint(), "Using Ollama model store");
                (Arc::new(OllamaModelStore::new(client)), Vec::new())
            }
            BackendKind::Mock => bail!("The mock backend needs a model manifest (--manifest)"),
        },
    };

    Ok(Setup {
        store,
        backend,
        declared_gpus,
    })
}

/// Manifest-declared GPUs win; otherwise `nvidia-smi`, falling back to CPU only.
fn gpu_source(declared: Vec<GpuDevice>) -> Arc<dyn GpuSource> {
    if !declared.is_empty() {
        return Arc::new(StaticGpuSource::new(declared));
    }
    let nvidia = NvidiaSmiSource::new();
    match nvidia.list_gpus() {
        Ok(gpus) if !gpus.is_empty() => {
            debug!(gpus = gpus.len(), "Detected NVIDIA GPUs");
            Arc::new(nvidia)
        }
        Ok(_) => Arc::new(NoGpuSource),
        Err(e) => {
            debug!(error = %e, "No GPU source available, assuming CPU only");
            Arc::new(NoGpuSource)
        }
    }
}

fn build_manager(source: &BackendArgs) -> Result<InferenceManager> {
    let config = RuntimeConfig::from_env().context("Invalid HEARTH_* configuration")?;
    let setup = setup(source)?;
    let manager = InferenceManager::builder()
        .config(config)
        .backend(setup.backend)
        .default_backend(source.backend.as_str())
        .store(setup.store)
        .gpus(gpu_source(setup.declared_gpus))
        .build()?;
    manager.attach_handler(Arc::new(LoggingHandler));
    Ok(manager)
}

fn load_options(placement: &PlacementArgs) -> LoadOptions {
    LoadOptions {
        gpu_layers: placement.gpu_layers,
        context_size: placement.context_size,
        gpu_id: placement.gpu_id,
        ..Default::default()
    }
}

async fn handle_models(args: &ModelsArgs) -> Result<i32> {
    let setup = setup(&args.source)?;
    let mut models = setup
        .store
        .list()
        .await
        .context("Failed to list models")?;
    models.sort_by(|a, b| a.id.cmp(&b.id));

    let formatter = OutputFormatter::new(args.format.into());
    println!("{}", formatter.format_models(&models)?);
    Ok(0)
}

async fn handle_check(args: &CheckArgs) -> Result<i32> {
    let manager = build_manager(&args.source)?;
    let plan = manager
        .plan_load(&args.model, &load_options(&args.placement))
        .await?;

    let sufficient = plan.report.is_sufficient;
    let report = CheckReport::new(
        &args.model,
        plan.placement.gpu_layers,
        plan.placement.context_size,
        &plan.estimate,
        plan.report,
    );
    let formatter = OutputFormatter::new(args.format.into());
    println!("{}", formatter.format_check(&report)?);

    Ok(if sufficient { 0 } else { EXIT_DOES_NOT_FIT })
}

struct LogAlerts;

impl AlertHandler for LogAlerts {
    fn on_alert(&self, alert: &ResourceAlert) {
        warn!(kind = ?alert.kind, value = alert.value, threshold = alert.threshold, "{}", alert.message);
    }
}

async fn handle_monitor(args: &MonitorArgs) -> Result<i32> {
    let probe = match &args.model_dir {
        Some(dir) => SysinfoProbe::new(dir.clone()),
        None => SysinfoProbe::default(),
    };
    let config = RuntimeConfig::from_env().context("Invalid HEARTH_* configuration")?;
    let monitor = ResourceMonitor::new(
        Arc::new(probe),
        Some(gpu_source(Vec::new())),
        Arc::new(RuntimeGauges::new()),
        MonitorSettings {
            interval: Duration::from_millis(args.interval_ms),
            history_capacity: args.count as usize,
            retention: config.history_retention(),
            thresholds: config.alerts.clone(),
        },
    );
    monitor.add_alert_handler(Arc::new(LogAlerts));

    let formatter = OutputFormatter::new(args.format.into());
    let interval = Duration::from_millis(args.interval_ms);
    for i in 0..args.count {
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        let sample = monitor.tick();
        println!("{}", formatter.format_sample(&sample)?);
    }
    Ok(0)
}

fn generation_request(args: &GenerateArgs) -> GenerationRequest {
    let mut request = match &args.system {
        Some(system) => GenerationRequest::chat(vec![
            ChatMessage::system(system.clone()),
            ChatMessage::user(args.prompt.clone()),
        ]),
        None => GenerationRequest::prompt(args.prompt.clone()),
    }
    .with_model(args.model.clone())
    .with_sampling(SamplingParams {
        temperature: args.temperature,
        top_p: args.top_p,
        stop: args.stop.clone(),
        seed: args.seed,
        ..Default::default()
    });
    if let Some(max_tokens) = args.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }
    if let Some(secs) = args.timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }
    request
}

async fn stream_to_stdout(manager: &InferenceManager, request: GenerationRequest) -> Result<GenerationResult> {
    let mut stream = manager.generate_stream(request).await?;
    let request_id = stream.request_id().to_string();
    let model_id = stream.model_id().to_string();
    let mut stdout = std::io::stdout();
    let mut text = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if !chunk.text.is_empty() {
            write!(stdout, "{}", chunk.text)?;
            stdout.flush()?;
            text.push_str(&chunk.text);
        }
        if chunk.done {
            writeln!(stdout)?;
            return Ok(GenerationResult {
                request_id,
                model_id,
                text,
                usage: chunk.usage.unwrap_or_default(),
                finish_reason: chunk
                    .finish_reason
                    .ok_or_else(|| anyhow!("terminal chunk without a finish reason"))?,
                metrics: chunk.metrics.unwrap_or_default(),
            });
        }
    }
    bail!("generation stream ended before completion")
}

async fn handle_generate(args: &GenerateArgs) -> Result<i32> {
    let manager = build_manager(&args.source)?;
    manager
        .load_model(&args.model, load_options(&args.placement))
        .await
        .with_context(|| format!("Failed to load model '{}'", args.model))?;

    let request = generation_request(args);
    let outcome = if args.stream && args.format == OutputFormatArg::Human {
        stream_to_stdout(&manager, request).await.map(|result| {
            eprintln!("{}", generation_summary(&result));
        })
    } else {
        match manager.generate(request).await {
            Ok(result) => {
                let formatter = OutputFormatter::new(args.format.into());
                formatter.format_generation(&result).map(|out| println!("{}", out))
            }
            Err(e) => Err(e.into()),
        }
    };

    if let Err(e) = manager.shutdown().await {
        warn!(error = %e, "Shutdown did not complete cleanly");
    }
    outcome.map(|_| 0)
}

async fn handle_embed(args: &EmbedArgs) -> Result<i32> {
    let manager = build_manager(&args.source)?;
    manager
        .load_model(&args.model, load_options(&args.placement))
        .await
        .with_context(|| format!("Failed to load model '{}'", args.model))?;

    let mut request = EmbeddingRequest::new(args.inputs.clone()).with_model(args.model.clone());
    if args.normalize {
        request = request.normalized();
    }
    let outcome = manager.embed(request).await;

    if let Err(e) = manager.shutdown().await {
        warn!(error = %e, "Shutdown did not complete cleanly");
    }
    let result = outcome?;
    let formatter = OutputFormatter::new(args.format.into());
    println!("{}", formatter.format_embeddings(&result)?);
    Ok(0)
}

fn handle_config(args: &ConfigArgs) -> Result<i32> {
    let config = RuntimeConfig::from_env().context("Invalid HEARTH_* configuration")?;
    debug!(config = ?config, "Effective configuration");
    let formatter = OutputFormatter::new(args.format.into());
    println!("{}", formatter.format_config(&config)?);
    Ok(0)
}
