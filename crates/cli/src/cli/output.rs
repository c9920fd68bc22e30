//! Human and JSON renderings of command results.

use anyhow::{Context, Result};
use hearth_core::{
    EmbeddingResult, FeasibilityReport, GenerationResult, ModelDescriptor, ResourceSample,
    RuntimeConfig,
};
use hearth_runtime::MemoryEstimate;
use serde::Serialize;
use std::fmt::Write;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed JSON (machine-readable)
    Json,
    Human,
}

fn gib(bytes: u64) -> String {
    format!("{:.2} GiB", bytes as f64 / GIB)
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Feasibility verdict for one prospective load.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub model_id: String,
    pub gpu_layers: u32,
    pub context_size: u32,
    pub weights_bytes: u64,
    pub kv_cache_bytes: u64,
    pub ram_bytes: u64,
    pub vram_bytes: u64,
    #[serde(flatten)]
    pub feasibility: FeasibilityReport,
}

impl CheckReport {
    pub fn new(
        model_id: impl Into<String>,
        gpu_layers: u32,
        context_size: u32,
        estimate: &MemoryEstimate,
        feasibility: FeasibilityReport,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            gpu_layers,
            context_size,
            weights_bytes: estimate.weights_bytes,
            kv_cache_bytes: estimate.kv_cache_bytes,
            ram_bytes: estimate.ram_bytes,
            vram_bytes: estimate.vram_bytes,
            feasibility,
        }
    }
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    fn json<T: Serialize + ?Sized>(&self, value: &T, what: &str) -> Result<String> {
        serde_json::to_string_pretty(value).with_context(|| format!("Failed to serialize {} to JSON", what))
    }

    pub fn format_models(&self, models: &[ModelDescriptor]) -> Result<String> {
        if self.format == OutputFormat::Json {
            return self.json(models, "models");
        }
        if models.is_empty() {
            return Ok("No models installed".to_string());
        }

        let width = models.iter().map(|m| m.id.len()).max().unwrap_or(0).max(5);
        let mut out = String::new();
        writeln!(out, "{:<width$}  {:>10}  {:>8}  {:>6}  QUANT", "MODEL", "SIZE", "CONTEXT", "LAYERS")?;
        for model in models {
            writeln!(
                out,
                "{:<width$}  {:>10}  {:>8}  {:>6}  {}",
                model.id,
                gib(model.size_bytes),
                model.max_context_size,
                opt(model.layer_count),
                model.quantization.as_deref().unwrap_or("-"),
            )?;
        }
        Ok(out.trim_end().to_string())
    }

    pub fn format_check(&self, report: &CheckReport) -> Result<String> {
        if self.format == OutputFormat::Json {
            return self.json(report, "feasibility report");
        }

        let mut out = String::new();
        writeln!(out, "Model: {}", report.model_id)?;
        writeln!(
            out,
            "Placement: {} GPU layers, {} token context",
            report.gpu_layers, report.context_size
        )?;
        writeln!(
            out,
            "Estimate: weights {}, KV cache {}",
            gib(report.weights_bytes),
            gib(report.kv_cache_bytes)
        )?;
        writeln!(
            out,
            "Requires: RAM {}, VRAM {}",
            gib(report.ram_bytes),
            gib(report.vram_bytes)
        )?;
        if report.feasibility.is_sufficient {
            write!(out, "Verdict: fits")?;
        } else {
            writeln!(out, "Verdict: does not fit")?;
            for issue in &report.feasibility.issues {
                writeln!(out, "  - {}", issue.message)?;
            }
        }
        Ok(out.trim_end().to_string())
    }

    pub fn format_sample(&self, sample: &ResourceSample) -> Result<String> {
        if self.format == OutputFormat::Json {
            return serde_json::to_string(sample).context("Failed to serialize resource sample to JSON");
        }

        let mut out = format!(
            "{}  RAM {}/{} ({})  CPU {}  disk free {}",
            sample.timestamp.format("%H:%M:%S%.3f"),
            gib(sample.ram_used_bytes),
            gib(sample.ram_total_bytes),
            sample
                .ram_used_percent()
                .map(|p| format!("{:.1}%", p))
                .unwrap_or_else(|| "-".to_string()),
            sample
                .cpu_percent
                .map(|p| format!("{:.1}%", p))
                .unwrap_or_else(|| "-".to_string()),
            sample
                .disk_available_bytes
                .map(gib)
                .unwrap_or_else(|| "-".to_string()),
        );
        for gpu in &sample.gpus {
            write!(
                out,
                "\n  GPU {} {}: VRAM {}/{}  util {}  temp {}",
                gpu.id,
                gpu.name,
                gpu.vram_used_bytes.map(gib).unwrap_or_else(|| "-".to_string()),
                gib(gpu.vram_total_bytes),
                gpu.utilization_percent
                    .map(|p| format!("{:.0}%", p))
                    .unwrap_or_else(|| "-".to_string()),
                gpu.temperature_c
                    .map(|t| format!("{:.0}C", t))
                    .unwrap_or_else(|| "-".to_string()),
            )?;
        }
        Ok(out)
    }

    pub fn format_generation(&self, result: &GenerationResult) -> Result<String> {
        if self.format == OutputFormat::Json {
            return self.json(result, "generation result");
        }

        let mut out = String::new();
        writeln!(out, "{}", result.text.trim_end())?;
        writeln!(out)?;
        write!(out, "{}", generation_summary(result))?;
        Ok(out)
    }

    pub fn format_embeddings(&self, result: &EmbeddingResult) -> Result<String> {
        if self.format == OutputFormat::Json {
            return self.json(result, "embedding result");
        }

        let mut out = String::new();
        writeln!(
            out,
            "{} vectors, {} dimensions ({} prompt tokens, {}ms)",
            result.embeddings.len(),
            result.dimensions,
            result.prompt_tokens,
            result.total_time_ms
        )?;
        for (i, vector) in result.embeddings.iter().enumerate() {
            let head: Vec<String> = vector.iter().take(6).map(|v| format!("{:.4}", v)).collect();
            let ellipsis = if vector.len() > 6 { ", ..." } else { "" };
            writeln!(out, "  [{}] [{}{}]", i, head.join(", "), ellipsis)?;
        }
        Ok(out.trim_end().to_string())
    }

    pub fn format_config(&self, config: &RuntimeConfig) -> Result<String> {
        match self.format {
            OutputFormat::Json => {
                let map: std::collections::BTreeMap<_, _> = config.to_display_map().into_iter().collect();
                self.json(&map, "config")
            }
            OutputFormat::Human => Ok(config.to_string().trim_end().to_string()),
        }
    }
}

/// One-line usage and timing footer for a finished generation.
pub fn generation_summary(result: &GenerationResult) -> String {
    format!(
        "[{:?}] {} prompt + {} completion tokens, {:.1} tok/s, first token {}ms, total {}ms",
        result.finish_reason,
        result.usage.prompt_tokens,
        result.usage.completion_tokens,
        result.metrics.tokens_per_second,
        opt(result.metrics.time_to_first_token_ms),
        result.metrics.total_time_ms
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::{FinishReason, GenerationMetrics, ResourceIssue, ResourceKind, TokenUsage};

    fn result() -> GenerationResult {
        GenerationResult {
            request_id: "r1".to_string(),
            model_id: "m".to_string(),
            text: "hello there\n".to_string(),
            usage: TokenUsage {
                prompt_tokens: 4,
                completion_tokens: 2,
            },
            finish_reason: FinishReason::Stop,
            metrics: GenerationMetrics {
                time_to_first_token_ms: Some(12),
                generation_time_ms: 40,
                total_time_ms: 52,
                tokens_per_second: 50.0,
            },
        }
    }

    #[test]
    fn test_models_human_table() {
        let models = vec![
            ModelDescriptor::new("llama3-8b", 4 * 1024 * 1024 * 1024, 8192).with_layers(32),
            ModelDescriptor::new("tiny", 1024, 512),
        ];
        let out = OutputFormatter::new(OutputFormat::Human)
            .format_models(&models)
            .unwrap();

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("MODEL"));
        assert!(lines[1].contains("4.00 GiB"));
        assert!(lines[1].contains("32"));
        assert!(lines[2].starts_with("tiny"));
    }

    #[test]
    fn test_models_json_and_empty() {
        let json = OutputFormatter::new(OutputFormat::Json)
            .format_models(&[ModelDescriptor::new("m", 10, 512)])
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["id"], "m");

        let human = OutputFormatter::new(OutputFormat::Human)
            .format_models(&[])
            .unwrap();
        assert_eq!(human, "No models installed");
    }

    #[test]
    fn test_check_reports_issues() {
        let estimate = MemoryEstimate {
            weights_bytes: 8,
            kv_cache_bytes: 2,
            ram_bytes: 10,
            vram_bytes: 0,
        };
        let feasibility =
            FeasibilityReport::from_issues(vec![ResourceIssue::new(ResourceKind::Ram, None, 10, 4)], None);
        let report = CheckReport::new("m", 0, 512, &estimate, feasibility);

        let human = OutputFormatter::new(OutputFormat::Human)
            .format_check(&report)
            .unwrap();
        assert!(human.contains("does not fit"));
        assert!(human.contains("RAM insufficient"));

        let json = OutputFormatter::new(OutputFormat::Json)
            .format_check(&report)
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["is_sufficient"], false);
        assert_eq!(parsed["ram_bytes"], 10);
        assert_eq!(parsed["issues"][0]["kind"], "ram");
    }

    #[test]
    fn test_generation_output() {
        let human = OutputFormatter::new(OutputFormat::Human)
            .format_generation(&result())
            .unwrap();
        assert!(human.starts_with("hello there\n\n[Stop]"));
        assert!(human.contains("4 prompt + 2 completion"));

        let json = OutputFormatter::new(OutputFormat::Json)
            .format_generation(&result())
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["finish_reason"], "stop");
        assert_eq!(parsed["usage"]["completion_tokens"], 2);
    }

    #[test]
    fn test_embeddings_truncate_vectors() {
        let result = EmbeddingResult {
            model_id: "e".to_string(),
            embeddings: vec![vec![0.5; 8], vec![1.0, 0.0]],
            dimensions: 8,
            prompt_tokens: 3,
            total_time_ms: 5,
        };
        let out = OutputFormatter::new(OutputFormat::Human)
            .format_embeddings(&result)
            .unwrap();
        assert!(out.starts_with("2 vectors"));
        assert!(out.contains("0.5000, ...]"));
        assert!(out.contains("[1.0000, 0.0000]"));
    }

    #[test]
    fn test_config_json_is_sorted_map() {
        let json = OutputFormatter::new(OutputFormat::Json)
            .format_config(&RuntimeConfig::default())
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["monitor_interval_ms"], "100");
        assert_eq!(parsed["event_buffer"], "1024");
    }
}
