/// Sandbox driver capability surface consumed by the import cache
use std::path::{Path, PathBuf};

use crate::types::Result;

/// One namespaced container.
///
/// The cache only consumes the small capability set below; container
/// creation, image plumbing, and the rest of the driver lifecycle live with
/// the driver implementation. Implementations must be safe to share across
/// threads: provisioning, eviction, and shutdown all touch sandboxes.
pub trait ContainerSandbox: Send + Sync {
    /// Driver-assigned identifier, used in logs.
    fn id(&self) -> &str;

    /// Pid of the sandbox's init process, in the host pid namespace.
    fn ns_pid(&self) -> &str;

    /// Host path of the sandbox's root filesystem.
    fn root_dir(&self) -> &Path;

    /// Host-side working directory; holds the control socket and ready pipe.
    fn host_dir(&self) -> &Path;

    /// Path of this sandbox's memory cgroup.
    fn memory_cgroup_path(&self) -> PathBuf;

    /// Move a process into the sandbox's cgroups.
    fn cgroup_enter(&self, pid: u32) -> Result<()>;

    /// Tear the sandbox down. Must be idempotent.
    fn remove(&self) -> Result<()>;
}

/// Produces cache sandboxes: containers whose sole occupant is a fork server.
pub trait SandboxFactory: Send + Sync {
    /// Create a fresh cache sandbox whose init spawns the interpreter
    /// entrypoint.
    fn create(&self) -> Result<Box<dyn ContainerSandbox>>;

    /// Create the root fork-server sandbox.
    fn root(&self) -> Result<Box<dyn ContainerSandbox>>;

    /// Best-effort removal of anything the factory still tracks.
    fn cleanup(&self);
}

/// Control socket filename inside a sandbox's host directory.
pub const SOCK_FILE: &str = "fs.sock";

/// Ready-handshake pipe filename inside a sandbox's host directory.
pub const PIPE_FILE: &str = "pipe";

/// Path of the control socket for a given sandbox host directory.
pub fn sock_path(host_dir: &Path) -> PathBuf {
    host_dir.join(SOCK_FILE)
}

/// Path of the ready pipe for a given sandbox host directory.
pub fn pipe_path(host_dir: &Path) -> PathBuf {
    host_dir.join(PIPE_FILE)
}
