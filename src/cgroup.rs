/// Memory-cgroup access for eviction pressure reads and lambda placement
use std::path::{Path, PathBuf};

use crate::types::{CacheError, Result};

/// One memory-cgroup directory (v1 layout).
///
/// The evictor polls `usage` on the parent cgroup containing all cache
/// sandboxes; `add_process` backs the cgroup-enter step of provisioning.
#[derive(Debug, Clone)]
pub struct MemCGroup {
    path: PathBuf,
}

impl MemCGroup {
    pub fn new(path: PathBuf) -> MemCGroup {
        MemCGroup { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current resident usage in bytes.
    pub fn usage(&self) -> Result<u64> {
        self.read_u64("memory.usage_in_bytes")
    }

    /// Configured limit in bytes.
    pub fn limit(&self) -> Result<u64> {
        self.read_u64("memory.limit_in_bytes")
    }

    /// Move a process into this cgroup.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        let tasks = self.path.join("tasks");
        std::fs::write(&tasks, pid.to_string()).map_err(|e| {
            CacheError::Sandbox(format!(
                "failed to add pid {} to cgroup {:?}: {}",
                pid, self.path, e
            ))
        })
    }

    fn read_u64(&self, file: &str) -> Result<u64> {
        let path = self.path.join(file);
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| CacheError::Sandbox(format!("failed to read {:?}: {}", path, e)))?;
        raw.trim()
            .parse()
            .map_err(|e| CacheError::Sandbox(format!("failed to parse {:?}: {}", path, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_and_limit_reads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("memory.usage_in_bytes"), "4096\n").unwrap();
        std::fs::write(dir.path().join("memory.limit_in_bytes"), "8192").unwrap();

        let cg = MemCGroup::new(dir.path().to_path_buf());
        assert_eq!(cg.usage().unwrap(), 4096);
        assert_eq!(cg.limit().unwrap(), 8192);
    }

    #[test]
    fn test_garbage_usage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("memory.usage_in_bytes"), "lots").unwrap();

        let cg = MemCGroup::new(dir.path().to_path_buf());
        assert!(cg.usage().is_err());
    }

    #[test]
    fn test_add_process_appends_to_tasks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tasks"), "").unwrap();

        let cg = MemCGroup::new(dir.path().to_path_buf());
        cg.add_process(1234).unwrap();

        let tasks = std::fs::read_to_string(dir.path().join("tasks")).unwrap();
        assert_eq!(tasks.trim(), "1234");
    }
}
