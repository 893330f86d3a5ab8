//! Process limits a worker applies to itself before it reads any request.

use tracing::{info, warn};

use crate::worker::protocol::MAX_MEMORY_ENV;
use crate::worker::INTERPRETER_STACK_BYTES;

/// Workers only talk over stdio.
const MAX_OPEN_FILES: u64 = 64;

/// Smallest address-space cap a worker accepts: the interpreter stack plus
/// room for the binary, allocator arenas and a working heap.
pub const MIN_MEMORY_MB: u64 = (INTERPRETER_STACK_BYTES / (1024 * 1024)) as u64 + 128;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Address-space cap in MiB, never below [`MIN_MEMORY_MB`].
    pub max_memory_mb: Option<u64>,
}

impl ResourceLimits {
    /// A zero cap means no cap; caps below [`MIN_MEMORY_MB`] are raised to it.
    pub fn new(max_memory_mb: Option<u64>) -> Self {
        let max_memory_mb = max_memory_mb.filter(|mb| *mb > 0).map(|mb| {
            if mb < MIN_MEMORY_MB {
                warn!(requested = mb, floor = MIN_MEMORY_MB, "memory cap too small, raising it");
            }
            mb.max(MIN_MEMORY_MB)
        });
        Self { max_memory_mb }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var(MAX_MEMORY_ENV)
                .ok()
                .and_then(|value| value.trim().parse::<u64>().ok()),
        )
    }
}

/// Disable core dumps, bound open files, and cap the address space when
/// configured.
#[cfg(target_os = "linux")]
pub fn apply(limits: &ResourceLimits) -> std::io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    setrlimit(Resource::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES)?;
    if let Some(mb) = limits.max_memory_mb {
        let bytes = mb.saturating_mul(1024 * 1024);
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        info!(max_memory_mb = mb, "worker address space capped");
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn apply(limits: &ResourceLimits) -> std::io::Result<()> {
    if limits.max_memory_mb.is_some() {
        info!("memory limits are only enforced on linux");
    }
    let _ = MAX_OPEN_FILES;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_memory_caps_are_raised_to_the_floor() {
        assert_eq!(ResourceLimits::new(None).max_memory_mb, None);
        assert_eq!(ResourceLimits::new(Some(0)).max_memory_mb, None);
        assert_eq!(ResourceLimits::new(Some(100)).max_memory_mb, Some(MIN_MEMORY_MB));
        assert_eq!(ResourceLimits::new(Some(4096)).max_memory_mb, Some(4096));
    }
}
