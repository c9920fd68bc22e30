use hearth_core::{
    FeasibilityReport, ResourceIssue, ResourceKind, ResourceRequirements, ResourceSample,
};

/// Compares requirements against one sample.
///
/// Metrics the sample does not carry (unknown CPU load, unknown disk) are not
/// checked. A VRAM requirement against a GPU id absent from the sample counts
/// as zero available.
pub fn check(sample: &ResourceSample, requirements: &ResourceRequirements) -> FeasibilityReport {
    let mut issues = Vec::new();

    if requirements.ram_bytes > sample.ram_available_bytes {
        issues.push(ResourceIssue::new(
            ResourceKind::Ram,
            None,
            requirements.ram_bytes,
            sample.ram_available_bytes,
        ));
    }

    if requirements.vram_bytes > 0 {
        let available = match requirements.gpu_id {
            Some(id) => sample.gpu(id).map(|g| g.vram_free_bytes()).unwrap_or(0),
            None => sample.vram_free_bytes(),
        };
        if requirements.vram_bytes > available {
            issues.push(ResourceIssue::new(
                ResourceKind::Vram,
                requirements.gpu_id,
                requirements.vram_bytes,
                available,
            ));
        }
    }

    if let (Some(required), Some(cpu)) = (requirements.cpu_headroom_percent, sample.cpu_percent) {
        let idle = (100.0 - cpu).clamp(0.0, 100.0).floor() as u64;
        if u64::from(required) > idle {
            issues.push(ResourceIssue::new(
                ResourceKind::Cpu,
                None,
                u64::from(required),
                idle,
            ));
        }
    }

    if requirements.disk_bytes > 0 {
        if let Some(available) = sample.disk_available_bytes {
            if requirements.disk_bytes > available {
                issues.push(ResourceIssue::new(
                    ResourceKind::Disk,
                    None,
                    requirements.disk_bytes,
                    available,
                ));
            }
        }
    }

    FeasibilityReport::from_issues(issues, Some(sample.timestamp))
}
