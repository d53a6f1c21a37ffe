use crate::error::{OrchestratorError, Result};
use crate::models::{CpuQuantity, EngineConfig, MemoryQuantity};
use crate::services::allocator::HostCapacity;

/// Used when physical memory cannot be queried.
const FALLBACK_MEMORY_BYTES: u64 = 4 << 30;

/// Cores and physical memory of this machine.
pub fn detect_capacity() -> HostCapacity {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(1);
    let memory = physical_memory().unwrap_or_else(|| {
        tracing::warn!("could not query physical memory, assuming 4g");
        FALLBACK_MEMORY_BYTES
    });
    HostCapacity {
        cpu_millis: cores * 1000,
        memory_bytes: memory,
    }
}

/// Capacity for a run: CLI flags, then `engine.capacity`, then detection.
pub fn resolve_capacity(
    engine: &EngineConfig,
    cpus: Option<CpuQuantity>,
    memory: Option<MemoryQuantity>,
) -> Result<HostCapacity> {
    let detected = detect_capacity();
    let configured = engine.capacity.clone().unwrap_or_default();

    let cpu_millis = match (cpus, configured.cpus.as_deref()) {
        (Some(cpu), _) => cpu.millis(),
        (None, Some(raw)) => raw
            .parse::<CpuQuantity>()
            .map_err(|e| OrchestratorError::invalid_field("engine.capacity.cpus", e))?
            .millis(),
        (None, None) => detected.cpu_millis,
    };
    let memory_bytes = match (memory, configured.memory.as_deref()) {
        (Some(mem), _) => mem.bytes(),
        (None, Some(raw)) => raw
            .parse::<MemoryQuantity>()
            .map_err(|e| OrchestratorError::invalid_field("engine.capacity.memory", e))?
            .bytes(),
        (None, None) => detected.memory_bytes,
    };

    Ok(HostCapacity {
        cpu_millis,
        memory_bytes,
    })
}

#[cfg(unix)]
fn physical_memory() -> Option<u64> {
    let (pages, page_size) = unsafe {
        (
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    (pages > 0 && page_size > 0).then(|| pages as u64 * page_size as u64)
}

#[cfg(windows)]
fn physical_memory() -> Option<u64> {
    use windows_sys::Win32::System::SystemInformation::{GlobalMemoryStatusEx, MEMORYSTATUSEX};

    unsafe {
        let mut status: MEMORYSTATUSEX = std::mem::zeroed();
        status.dwLength = std::mem::size_of::<MEMORYSTATUSEX>() as u32;
        (GlobalMemoryStatusEx(&mut status) != 0).then_some(status.ullTotalPhys)
    }
}

#[cfg(not(any(unix, windows)))]
fn physical_memory() -> Option<u64> {
    None
}
