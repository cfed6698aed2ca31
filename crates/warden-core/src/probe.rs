//! Memory probes
//!
//! A probe answers one question: how many bytes are in use right now.
//! The sampler bounds every call with a timeout, so probes may block on
//! IO or on the engine.

use crate::engine::EngineSlot;
use crate::error::EngineError;

/// Source of memory-usage readings
#[async_trait::async_trait]
pub trait MemoryProbe: Send + Sync {
    /// Bytes currently in use
    async fn used_bytes(&self) -> Result<u64, EngineError>;
}

/// Resident set size of this process, from `/proc/self/status`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemoryProbe;

impl ProcessMemoryProbe {
    fn parse_vm_rss(status: &str) -> Option<u64> {
        let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
        let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kib * 1024)
    }
}

#[async_trait::async_trait]
impl MemoryProbe for ProcessMemoryProbe {
    async fn used_bytes(&self) -> Result<u64, EngineError> {
        let status = tokio::fs::read_to_string("/proc/self/status")
            .await
            .map_err(|e| EngineError::Unsupported(format!("process memory: {e}")))?;
        Self::parse_vm_rss(&status)
            .ok_or_else(|| EngineError::Unsupported("VmRSS missing from /proc/self/status".into()))
    }
}

/// Asks the engine itself through a scalar query
#[derive(Debug, Clone)]
pub struct EngineMemoryProbe {
    engine: EngineSlot,
    query: String,
}

impl EngineMemoryProbe {
    /// Default statement for engines exposing a memory catalogue
    pub const DEFAULT_QUERY: &'static str =
        "SELECT COALESCE(SUM(memory_usage_bytes), 0) FROM duckdb_memory()";

    /// Probe running `query`, which must return one integer cell
    #[must_use]
    pub fn new(engine: EngineSlot, query: impl Into<String>) -> Self {
        Self {
            engine,
            query: query.into(),
        }
    }
}

#[async_trait::async_trait]
impl MemoryProbe for EngineMemoryProbe {
    async fn used_bytes(&self) -> Result<u64, EngineError> {
        let result = self.engine.current().execute(&self.query).await?;
        result
            .first_u64()
            .ok_or_else(|| EngineError::QueryFailed("memory query returned no integer".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vm_rss() {
        let status = "Name:\twarden\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\nThreads:\t4\n";
        assert_eq!(ProcessMemoryProbe::parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(ProcessMemoryProbe::parse_vm_rss("Name:\tx\n"), None);
    }
}
