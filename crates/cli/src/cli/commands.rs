use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Local inference runtime: model lifecycle, generation, and host telemetry
#[derive(Parser, Debug)]
#[command(
    name = "hearth",
    about = "Local inference runtime: model lifecycle, generation, and host telemetry",
    version,
    author,
    long_about = "hearth loads local models through a pluggable backend after checking \
                  that the host has the RAM and VRAM for them, runs streaming generation \
                  and embedding requests, and reports resource usage while it works."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - only log errors"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "List installed models",
        long_about = "Lists the models the selected store knows about.\n\n\
                      Examples:\n  \
                      hearth models --manifest models.toml\n  \
                      hearth models --backend ollama --format json"
    )]
    Models(ModelsArgs),

    #[command(
        about = "Check whether a model fits on this host",
        long_about = "Estimates the RAM and VRAM a load would need and compares it with \
                      what the host has available right now.\n\n\
                      Examples:\n  \
                      hearth check llama3-8b --manifest models.toml\n  \
                      hearth check llama3:8b --backend ollama --gpu-layers 20 --context-size 4096"
    )]
    Check(CheckArgs),

    #[command(
        about = "Sample host resources",
        long_about = "Prints RAM, CPU, disk, and GPU readings at a fixed interval.\n\n\
                      Examples:\n  \
                      hearth monitor\n  \
                      hearth monitor --count 10 --interval-ms 500 --format json"
    )]
    Monitor(MonitorArgs),

    #[command(
        about = "Generate text with a model",
        long_about = "Loads the model, runs one generation request, and unloads it again.\n\n\
                      Examples:\n  \
                      hearth generate llama3-8b \"Why is the sky blue?\" --manifest models.toml\n  \
                      hearth generate llama3:8b \"Write a haiku\" --backend ollama --stream"
    )]
    Generate(GenerateArgs),

    #[command(
        about = "Compute embeddings",
        long_about = "Loads the model and prints one embedding vector per input text.\n\n\
                      Examples:\n  \
                      hearth embed nomic-embed-text \"first text\" \"second text\" --backend ollama"
    )]
    Embed(EmbedArgs),

    #[command(
        about = "Show the effective runtime configuration",
        long_about = "Prints the configuration assembled from HEARTH_* environment variables \
                      and defaults.\n\n\
                      Examples:\n  \
                      hearth config\n  \
                      hearth config --format json"
    )]
    Config(ConfigArgs),
}

/// Where models come from and what runs them.
#[derive(Args, Debug, Clone)]
pub struct BackendArgs {
    #[arg(
        short = 'b',
        long,
        value_enum,
        default_value = "ollama",
        help = "Inference backend"
    )]
    pub backend: BackendKind,

    #[arg(
        long,
        value_name = "FILE",
        help = "Model manifest (.toml or .json); defaults to <config dir>/hearth/models.toml when present"
    )]
    pub manifest: Option<PathBuf>,

    #[arg(
        long,
        value_name = "URL",
        help = "Ollama endpoint (defaults to OLLAMA_HOST, then http://localhost:11434)"
    )]
    pub endpoint: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct ModelsArgs {
    #[command(flatten)]
    pub source: BackendArgs,

    #[arg(short = 'f', long, value_enum, default_value = "human", help = "Output format")]
    pub format: OutputFormatArg,
}

#[derive(Args, Debug, Clone, Default)]
pub struct PlacementArgs {
    #[arg(long, value_name = "N", help = "Layers to offload to GPU")]
    pub gpu_layers: Option<u32>,

    #[arg(long, value_name = "TOKENS", help = "KV-cache size in tokens")]
    pub context_size: Option<u32>,

    #[arg(long, value_name = "ID", help = "Pin the model to one GPU")]
    pub gpu_id: Option<u32>,
}

#[derive(Parser, Debug, Clone)]
pub struct CheckArgs {
    #[arg(value_name = "MODEL", help = "Model id")]
    pub model: String,

    #[command(flatten)]
    pub placement: PlacementArgs,

    #[command(flatten)]
    pub source: BackendArgs,

    #[arg(short = 'f', long, value_enum, default_value = "human", help = "Output format")]
    pub format: OutputFormatArg,
}

#[derive(Parser, Debug, Clone)]
pub struct MonitorArgs {
    #[arg(
        short = 'n',
        long,
        default_value = "5",
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Number of samples to print"
    )]
    pub count: u32,

    #[arg(
        long,
        value_name = "MS",
        default_value = "1000",
        value_parser = clap::value_parser!(u64).range(10..),
        help = "Delay between samples"
    )]
    pub interval_ms: u64,

    #[arg(
        long,
        value_name = "DIR",
        help = "Report free disk space for this directory"
    )]
    pub model_dir: Option<PathBuf>,

    #[arg(short = 'f', long, value_enum, default_value = "human", help = "Output format")]
    pub format: OutputFormatArg,
}

#[derive(Parser, Debug, Clone)]
pub struct GenerateArgs {
    #[arg(value_name = "MODEL", help = "Model id")]
    pub model: String,

    #[arg(value_name = "PROMPT", help = "Prompt text")]
    pub prompt: String,

    #[arg(long, value_name = "TEXT", help = "System message; switches to chat mode")]
    pub system: Option<String>,

    #[arg(short = 's', long, help = "Print tokens as they arrive")]
    pub stream: bool,

    #[arg(long, value_name = "N", help = "Completion token budget")]
    pub max_tokens: Option<u32>,

    #[arg(short = 't', long, help = "Sampling temperature (0-2)")]
    pub temperature: Option<f32>,

    #[arg(long, help = "Nucleus sampling (0-1)")]
    pub top_p: Option<f32>,

    #[arg(long, value_name = "SEQ", help = "Stop sequence (repeatable)")]
    pub stop: Vec<String>,

    #[arg(long, help = "Sampling seed")]
    pub seed: Option<u64>,

    #[arg(long, value_name = "SECONDS", help = "Request timeout")]
    pub timeout: Option<u64>,

    #[command(flatten)]
    pub placement: PlacementArgs,

    #[command(flatten)]
    pub source: BackendArgs,

    #[arg(short = 'f', long, value_enum, default_value = "human", help = "Output format")]
    pub format: OutputFormatArg,
}

#[derive(Parser, Debug, Clone)]
pub struct EmbedArgs {
    #[arg(value_name = "MODEL", help = "Model id")]
    pub model: String,

    #[arg(value_name = "TEXT", required = true, help = "Input texts")]
    pub inputs: Vec<String>,

    #[arg(long, help = "Scale vectors to unit length")]
    pub normalize: bool,

    #[command(flatten)]
    pub placement: PlacementArgs,

    #[command(flatten)]
    pub source: BackendArgs,

    #[arg(short = 'f', long, value_enum, default_value = "human", help = "Output format")]
    pub format: OutputFormatArg,
}

#[derive(Parser, Debug, Clone)]
pub struct ConfigArgs {
    #[arg(short = 'f', long, value_enum, default_value = "human", help = "Output format")]
    pub format: OutputFormatArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Ollama,
    /// Scripted backend that answers every prompt with a fixed reply.
    Mock,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Ollama => "ollama",
            BackendKind::Mock => "mock",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormatArg {
    Human,
    Json,
}

impl From<OutputFormatArg> for crate::cli::output::OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Human => crate::cli::output::OutputFormat::Human,
            OutputFormatArg::Json => crate::cli::output::OutputFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_args_verify() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_generate_defaults() {
        let args = CliArgs::parse_from(["hearth", "generate", "llama3", "hello"]);
        match args.command {
            Commands::Generate(generate) => {
                assert_eq!(generate.model, "llama3");
                assert_eq!(generate.prompt, "hello");
                assert!(!generate.stream);
                assert!(generate.stop.is_empty());
                assert_eq!(generate.format, OutputFormatArg::Human);
                assert_eq!(generate.source.backend, BackendKind::Ollama);
                assert!(generate.placement.gpu_layers.is_none());
            }
            _ => panic!("Expected Generate command"),
        }
    }

    #[test]
    fn test_generate_with_options() {
        let args = CliArgs::parse_from([
            "hearth",
            "generate",
            "m",
            "hi",
            "--stream",
            "--max-tokens",
            "32",
            "--temperature",
            "0.2",
            "--stop",
            "###",
            "--stop",
            "END",
            "--backend",
            "mock",
            "--manifest",
            "/tmp/models.toml",
            "--context-size",
            "2048",
            "--format",
            "json",
        ]);
        match args.command {
            Commands::Generate(generate) => {
                assert!(generate.stream);
                assert_eq!(generate.max_tokens, Some(32));
                assert_eq!(generate.temperature, Some(0.2));
                assert_eq!(generate.stop, vec!["###", "END"]);
                assert_eq!(generate.source.backend, BackendKind::Mock);
                assert_eq!(
                    generate.source.manifest,
                    Some(PathBuf::from("/tmp/models.toml"))
                );
                assert_eq!(generate.placement.context_size, Some(2048));
                assert_eq!(generate.format, OutputFormatArg::Json);
            }
            _ => panic!("Expected Generate command"),
        }
    }

    #[test]
    fn test_embed_requires_input() {
        assert!(CliArgs::try_parse_from(["hearth", "embed", "m"]).is_err());
        let args = CliArgs::parse_from(["hearth", "embed", "m", "a", "b", "--normalize"]);
        match args.command {
            Commands::Embed(embed) => {
                assert_eq!(embed.inputs, vec!["a", "b"]);
                assert!(embed.normalize);
            }
            _ => panic!("Expected Embed command"),
        }
    }

    #[test]
    fn test_monitor_bounds() {
        assert!(CliArgs::try_parse_from(["hearth", "monitor", "--count", "0"]).is_err());
        assert!(CliArgs::try_parse_from(["hearth", "monitor", "--interval-ms", "1"]).is_err());
        let args = CliArgs::parse_from(["hearth", "monitor"]);
        match args.command {
            Commands::Monitor(monitor) => {
                assert_eq!(monitor.count, 5);
                assert_eq!(monitor.interval_ms, 1000);
            }
            _ => panic!("Expected Monitor command"),
        }
    }

    #[test]
    fn test_global_log_flags() {
        let args = CliArgs::parse_from(["hearth", "config", "-v"]);
        assert!(args.verbose);
        assert!(CliArgs::try_parse_from(["hearth", "config", "-v", "-q"]).is_err());

        let args = CliArgs::parse_from(["hearth", "--log-level", "trace", "config"]);
        assert_eq!(args.log_level.as_deref(), Some("trace"));
    }
}
