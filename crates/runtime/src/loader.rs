use crate::bus::EventBus;
use crate::context::ContextManager;
use crate::registry::{ModelRegistry, ModelSlot};
use crate::requirements::{self, MemoryEstimate};
use crate::singleflight::SingleFlight;
use chrono::Utc;
use hearth_core::{
    CancelReason, FeasibilityReport, GpuDevice, InferenceBackend, InferenceEvent, LoadOptions,
    LoadedModel, ModelDescriptor, ModelMetrics, ModelResources, ModelStatus, ModelStore, Result,
    RuntimeError, WeightLoadSpec,
};
use hearth_monitor::ResourceMonitor;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Layer count handed to backends for "offload everything" when the model
/// does not advertise its depth.
pub const ALL_LAYERS: u32 = 999;

/// Named backend families with a default.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: BTreeMap<String, Arc<dyn InferenceBackend>>,
    default: Option<String>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a backend. The first one registered becomes the default.
    pub fn register(&mut self, backend: Arc<dyn InferenceBackend>) {
        let name = backend.name().to_string();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.backends.insert(name, backend);
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(RuntimeError::invalid(format!("unknown backend: {}", name)));
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn select(&self, name: Option<&str>) -> Result<Arc<dyn InferenceBackend>> {
        let name = match name.or(self.default.as_deref()) {
            Some(name) => name,
            None => return Err(RuntimeError::invalid("no inference backend registered")),
        };
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::invalid(format!("unknown backend: {}", name)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderDefaults {
    pub batch_size: u32,
    pub threads: u32,
}

/// Turns a model id plus options into a registered, ready model.
pub struct ModelLoader {
    backends: BackendSet,
    store: Arc<dyn ModelStore>,
    monitor: ResourceMonitor,
    registry: Arc<ModelRegistry>,
    contexts: ContextManager,
    bus: EventBus,
    flights: SingleFlight<LoadedModel>,
    defaults: LoaderDefaults,
}

/// Placement decided for one load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub gpu_layers: u32,
    pub context_size: u32,
    /// VRAM is checked across every device rather than one.
    pub pooled: bool,
}

/// What a load would do and whether the host can take it right now.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadPlan {
    pub descriptor: ModelDescriptor,
    pub placement: Placement,
    pub estimate: MemoryEstimate,
    pub report: FeasibilityReport,
}

impl ModelLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backends: BackendSet,
        store: Arc<dyn ModelStore>,
        monitor: ResourceMonitor,
        registry: Arc<ModelRegistry>,
        contexts: ContextManager,
        bus: EventBus,
        defaults: LoaderDefaults,
    ) -> Self {
        Self {
            backends,
            store,
            monitor,
            registry,
            contexts,
            bus,
            flights: SingleFlight::new(),
            defaults,
        }
    }

    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }

    pub fn store(&self) -> &Arc<dyn ModelStore> {
        &self.store
    }

    /// Resolves, places, and sizes a load of `model_id` and checks it against
    /// the host without loading anything.
    pub async fn plan(&self, model_id: &str, options: &LoadOptions) -> Result<LoadPlan> {
        let descriptor = self
            .store
            .resolve(model_id)
            .await?
            .ok_or_else(|| RuntimeError::not_found(model_id))?;

        options.validate()?;
        let gpus = self.monitor.gpus();
        let placement = place(&descriptor, options, &gpus)?;

        let estimate = requirements::estimate(&descriptor, placement.gpu_layers, placement.context_size);
        let target_gpu = options.gpu_id.or(options.main_gpu);
        let needs = requirements::requirements(&estimate, target_gpu, placement.pooled);
        let report = self.monitor.check_feasible(&needs);

        Ok(LoadPlan {
            descriptor,
            placement,
            estimate,
            report,
        })
    }

    /// Loads `model_id`, or joins the load already in flight for it. Joining
    /// callers receive the first caller's result regardless of their options.
    pub async fn load(self: &Arc<Self>, model_id: &str, options: LoadOptions) -> Result<LoadedModel> {
        let loader = Arc::clone(self);
        let id = model_id.to_string();
        let (result, leader) = self
            .flights
            .run(model_id, move || async move { loader.load_once(id, options).await })
            .await;
        if !leader {
            debug!(model_id = %model_id, "Joined in-flight load");
        }
        result
    }

    async fn load_once(self: Arc<Self>, model_id: String, options: LoadOptions) -> Result<LoadedModel> {
        if let Some(existing) = self.registry.get(&model_id).await {
            match existing.status() {
                ModelStatus::Ready | ModelStatus::Busy => return Ok(existing.snapshot()),
                ModelStatus::Error => {
                    debug!(model_id = %model_id, "Discarding failed load before retry");
                    self.registry
                        .remove_instance(&model_id, &existing.instance_id())
                        .await;
                }
                status => {
                    return Err(RuntimeError::ModelUnavailable { model_id, status });
                }
            }
        }

        let plan = self.plan(&model_id, &options).await?;
        if !plan.report.is_sufficient {
            info!(model_id = %model_id, issues = plan.report.issues.len(), "Load refused: insufficient resources");
            return Err(RuntimeError::InsufficientResources {
                issues: plan.report.issues,
            });
        }
        let LoadPlan {
            descriptor,
            placement,
            estimate,
            ..
        } = plan;

        let backend_name = options
            .backend
            .as_deref()
            .or(descriptor.backend.as_deref());
        let backend = self.backends.select(backend_name)?;
        let capabilities = backend.capabilities();

        let spec = WeightLoadSpec {
            model_id: model_id.clone(),
            path: descriptor.path.clone(),
            gpu_layers: placement.gpu_layers,
            total_layers: descriptor.layer_count,
            context_size: placement.context_size,
            batch_size: options.batch_size.unwrap_or(self.defaults.batch_size),
            threads: options.threads.unwrap_or(self.defaults.threads),
            gpu_id: options.gpu_id,
            main_gpu: options.main_gpu,
            tensor_split: options.tensor_split.clone(),
        };

        let now = Utc::now();
        let record = LoadedModel {
            id: Uuid::new_v4().to_string(),
            model_id: model_id.clone(),
            descriptor: descriptor.clone(),
            options,
            backend: backend.name().to_string(),
            capabilities,
            status: ModelStatus::Loading,
            loaded_at: now,
            last_used_at: now,
            active_requests: 0,
            metrics: ModelMetrics::default(),
            resources: ModelResources {
                ram_bytes: 0,
                vram_bytes: 0,
                gpu_layers: placement.gpu_layers,
                total_layers: descriptor.layer_count,
                context_size: placement.context_size,
                context_used: 0,
            },
            last_error: None,
        };
        let instance_id = record.id.clone();
        let slot = Arc::new(ModelSlot::new(record));
        self.registry.insert(&model_id, Arc::clone(&slot)).await;

        self.bus.publish(InferenceEvent::ModelLoadStarted {
            model_id: model_id.clone(),
            backend: backend.name().to_string(),
        });
        let started = Instant::now();

        let handle = match backend.load_weights(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                let message = e.to_string();
                slot.update(|record| {
                    record.transition(ModelStatus::Error);
                    record.last_error = Some(message.clone());
                });
                self.bus.publish(InferenceEvent::ModelLoadFailed {
                    model_id: model_id.clone(),
                    error: message,
                });
                return Err(e.into());
            }
        };

        let reported = match handle.report_resources().await {
            Ok(r) => (r.ram_bytes, r.vram_bytes),
            Err(e) => {
                debug!(model_id = %model_id, error = %e, "Backend did not report resources, using estimate");
                (estimate.ram_bytes, estimate.vram_bytes)
            }
        };

        self.contexts.create(
            &model_id,
            placement.context_size,
            descriptor.kv_bytes_per_token_or_default(),
        );
        slot.set_handle(Arc::clone(&handle));

        let ready = slot.update(|record| {
            if record.status != ModelStatus::Loading {
                return false;
            }
            record.resources.ram_bytes = reported.0;
            record.resources.vram_bytes = reported.1;
            record.transition(ModelStatus::Ready)
        });

        if !ready {
            warn!(model_id = %model_id, "Model unloaded while loading, releasing weights");
            if let Err(e) = handle.unload().await {
                warn!(model_id = %model_id, error = %e, "Failed to release weights");
            }
            let replaced = self
                .registry
                .get(&model_id)
                .await
                .is_some_and(|s| s.instance_id() != instance_id);
            if !replaced {
                self.contexts.remove(&model_id);
            }
            let error = RuntimeError::Cancelled {
                reason: CancelReason::Unload,
            };
            self.bus.publish(InferenceEvent::ModelLoadFailed {
                model_id,
                error: error.to_string(),
            });
            return Err(error);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let loaded = slot.snapshot();
        self.monitor
            .gauges()
            .set_active_models(self.registry.loaded_count().await as u32);
        self.bus.publish(InferenceEvent::ModelLoadCompleted {
            model_id,
            instance_id,
            duration_ms,
            ram_bytes: loaded.resources.ram_bytes,
            vram_bytes: loaded.resources.vram_bytes,
            gpu_layers: loaded.resources.gpu_layers,
            context_size: loaded.resources.context_size,
        });
        Ok(loaded)
    }
}

/// Resolves defaults and validates placement against the model and the GPUs.
fn place(descriptor: &ModelDescriptor, options: &LoadOptions, gpus: &[GpuDevice]) -> Result<Placement> {
    let context_size = options.context_size.unwrap_or(descriptor.max_context_size);
    if context_size > descriptor.max_context_size {
        return Err(RuntimeError::invalid(format!(
            "context_size {} exceeds the model maximum of {}",
            context_size, descriptor.max_context_size
        )));
    }

    for (name, id) in [("gpu_id", options.gpu_id), ("main_gpu", options.main_gpu)] {
        if let Some(id) = id {
            if !gpus.iter().any(|g| g.id == id) {
                return Err(RuntimeError::invalid(format!("{} {} does not exist", name, id)));
            }
        }
    }
    if options.tensor_split.is_some() && gpus.is_empty() {
        return Err(RuntimeError::invalid(
            "tensor_split requires at least one GPU",
        ));
    }

    let gpu_layers = match (options.gpu_layers, descriptor.layer_count) {
        (Some(requested), Some(layers)) => requested.min(layers),
        (Some(requested), None) => requested,
        (None, _) if gpus.is_empty() => 0,
        (None, Some(layers)) => layers,
        (None, None) => ALL_LAYERS,
    };

    Ok(Placement {
        gpu_layers,
        context_size,
        pooled: options.tensor_split.is_some(),
    })
}
