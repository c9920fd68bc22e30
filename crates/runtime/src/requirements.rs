use hearth_core::{ModelDescriptor, ResourceRequirements};

/// Compute buffers and runtime bookkeeping charged to RAM on every load.
pub const RAM_OVERHEAD_BYTES: u64 = 256 * 1024 * 1024;
/// Scratch buffers charged to VRAM when any layer is offloaded.
pub const VRAM_OVERHEAD_BYTES: u64 = 256 * 1024 * 1024;

/// Memory split for one load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryEstimate {
    pub weights_bytes: u64,
    pub kv_cache_bytes: u64,
    pub ram_bytes: u64,
    pub vram_bytes: u64,
}

/// Splits weights and KV cache between RAM and VRAM in proportion to the
/// offloaded layers.
///
/// Without a layer count the model is treated as fully on GPU whenever any
/// layer is requested there.
pub fn estimate(descriptor: &ModelDescriptor, gpu_layers: u32, context_size: u32) -> MemoryEstimate {
    let weights_bytes = descriptor.size_bytes;
    let kv_cache_bytes = descriptor
        .kv_bytes_per_token_or_default()
        .saturating_mul(u64::from(context_size));
    let total = weights_bytes.saturating_add(kv_cache_bytes);

    let (on_gpu, layers) = match descriptor.layer_count {
        Some(layers) if layers > 0 => (u64::from(gpu_layers.min(layers)), u64::from(layers)),
        _ => (u64::from(gpu_layers > 0), 1),
    };

    let vram_share = (u128::from(total) * u128::from(on_gpu) / u128::from(layers)) as u64;
    let ram_share = total - vram_share;

    MemoryEstimate {
        weights_bytes,
        kv_cache_bytes,
        ram_bytes: ram_share + RAM_OVERHEAD_BYTES,
        vram_bytes: if on_gpu > 0 {
            vram_share + VRAM_OVERHEAD_BYTES
        } else {
            0
        },
    }
}

/// Feasibility requirements for a load. A single target GPU pins the VRAM
/// check to that device; a tensor split pools every device.
pub fn requirements(estimate: &MemoryEstimate, gpu_id: Option<u32>, pooled: bool) -> ResourceRequirements {
    ResourceRequirements::ram(estimate.ram_bytes)
        .with_vram(estimate.vram_bytes, if pooled { None } else { gpu_id })
}
