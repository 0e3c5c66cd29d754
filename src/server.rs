/// Fork server entity: one live interpreter with an imported package set
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::protocol;
use crate::sandbox::{self, ContainerSandbox};
use crate::types::{CacheError, Result};

/// Forest handle of a fork server; doubles as its creation sequence number.
pub type NodeId = u64;

/// Mutable runtime state of a fork server, guarded by the node lock.
///
/// Holding the guard serializes every operation against this server
/// (import-delta, fork-enter, kill), so per-node operations are totally
/// ordered. Fields are unset while the node is under construction and after
/// it is killed.
pub struct ServerState {
    pub(crate) sandbox: Option<Box<dyn ContainerSandbox>>,
    pub(crate) pid: Option<u32>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("sandbox", &self.sandbox.as_ref().map(|s| s.id().to_string()))
            .field("pid", &self.pid)
            .finish()
    }
}

/// A node in the fork-server forest.
///
/// `packages` is fixed at creation. `children` is only mutated under the
/// forest lock; `hits` is a plain atomic counter; `dead` is terminal. The
/// control-socket path sits in its own small mutex so siblings can be forked
/// through this server without taking its node lock.
#[derive(Debug)]
pub struct ForkServer {
    id: NodeId,
    parent: Option<NodeId>,
    packages: BTreeSet<String>,
    size_kb: u64,
    hits: AtomicU64,
    children: AtomicU32,
    dead: AtomicBool,
    sock_path: Mutex<Option<PathBuf>>,
    state: Mutex<ServerState>,
}

impl ForkServer {
    pub(crate) fn new(
        id: NodeId,
        parent: Option<NodeId>,
        packages: BTreeSet<String>,
        size_kb: u64,
    ) -> ForkServer {
        ForkServer {
            id,
            parent,
            packages,
            size_kb,
            hits: AtomicU64::new(0),
            children: AtomicU32::new(0),
            dead: AtomicBool::new(false),
            sock_path: Mutex::new(None),
            state: Mutex::new(ServerState {
                sandbox: None,
                pid: None,
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn packages(&self) -> &BTreeSet<String> {
        &self.packages
    }

    /// Approximate weight in kilobytes of this node's incremental package
    /// set.
    pub fn size_kb(&self) -> u64 {
        self.size_kb
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Record a match against this server.
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn children(&self) -> u32 {
        self.children.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_children(&self) {
        self.children.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec_children(&self) {
        self.children.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Mark this server dead. The caller must hold this server's node lock;
    /// the guard is demanded as proof so the flag can never flip while
    /// another thread is mid-operation on the node.
    pub(crate) fn mark_dead(&self, _state: &MutexGuard<'_, ServerState>) {
        self.dead.store(true, Ordering::SeqCst);
    }

    /// Path of this server's control socket, once it is live.
    pub fn sock(&self) -> Option<PathBuf> {
        match self.sock_path.lock() {
            Ok(sock) => sock.clone(),
            Err(_) => None,
        }
    }

    pub(crate) fn set_sock(&self, path: PathBuf) {
        if let Ok(mut sock) = self.sock_path.lock() {
            *sock = Some(path);
        }
    }

    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, ServerState>> {
        self.state
            .lock()
            .map_err(|_| CacheError::Lock(format!("fork server {} mutex poisoned", self.id)))
    }

    pub(crate) fn try_lock_state(&self) -> Option<MutexGuard<'_, ServerState>> {
        self.state.try_lock().ok()
    }

    /// Send a fork-enter through this server's control socket. The caller
    /// must hold the node lock.
    pub(crate) fn fork_enter(
        &self,
        target_root: &Path,
        target_ns_pid: &str,
        extra_packages: &[String],
        launch: bool,
        timeout: Duration,
    ) -> Result<u32> {
        let sock = self.sock().ok_or_else(|| {
            CacheError::Interpreter(format!("fork server {} has no control socket", self.id))
        })?;

        protocol::fork_request(&sock, target_root, target_ns_pid, extra_packages, launch, timeout)
    }

    /// Mark this server dead and release its resources: the sandbox handle
    /// is removed and the control socket unlinked. Idempotent; the caller
    /// must ensure no live children remain.
    pub fn kill(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        self.mark_dead(&state);

        let sandbox = state.sandbox.take();
        state.pid = None;
        let sock = match self.sock_path.lock() {
            Ok(mut sock) => sock.take(),
            Err(_) => None,
        };
        drop(state);

        if let Some(sock) = sock {
            if let Err(e) = std::fs::remove_file(&sock) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to unlink control socket {:?}: {}", sock, e);
                }
            }
        }

        if let Some(sandbox) = sandbox {
            log::info!("killing fork server {} (sandbox {})", self.id, sandbox.id());
            sandbox.remove()?;
        }

        Ok(())
    }
}

/// Block until a newly spawned fork server reports ready, up to `timeout`.
///
/// The interpreter writes exactly five bytes ("ready") to the named pipe in
/// its sandbox's host directory once its control socket is bound. Returns the
/// elapsed wait on success.
pub fn await_ready(host_dir: &Path, timeout: Duration) -> Result<Duration> {
    let pipe = sandbox::pipe_path(host_dir);
    let start = Instant::now();
    let (tx, rx) = crossbeam_channel::bounded(1);

    std::thread::spawn(move || {
        let _ = tx.send(read_ready(&pipe));
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(())) => Ok(start.elapsed()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(CacheError::Timeout(format!(
            "fork server failed to initialize after {:?}",
            timeout
        ))),
    }
}

fn read_ready(pipe: &Path) -> Result<()> {
    // Open read-write so the open does not block waiting for a writer.
    let mut file = std::fs::File::options().read(true).write(true).open(pipe)?;

    let mut buf = [0u8; 5];
    file.read_exact(&mut buf)?;
    if &buf != b"ready" {
        return Err(CacheError::Interpreter(format!(
            "unexpected ready handshake {:?}",
            String::from_utf8_lossy(&buf)
        )));
    }

    Ok(())
}
