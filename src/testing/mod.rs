//! Test doubles for the import cache
//!
//! A directory-backed sandbox factory and an in-process fake interpreter
//! that speaks the control-socket protocol, so the full provisioning path
//! (match, fork-enter, ready handshake, cgroup files, eviction pressure) can
//! be exercised without containers.

use std::fs::File;
use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crate::cgroup::MemCGroup;
use crate::protocol;
use crate::sandbox::{self, ContainerSandbox, SandboxFactory};
use crate::types::{CacheError, Result};

/// Shared world of fake interpreters.
///
/// Knobs let tests force the failure paths: rejected fork requests and
/// children that never report ready.
pub struct FakeRuntime {
    /// Reply a non-zero status to every fork request.
    pub fail_forks: AtomicBool,
    /// Forked fork-servers never bind a socket nor write the ready pipe.
    pub silent_ready: AtomicBool,
    next_pid: AtomicU32,
    servers: Mutex<Vec<FakeInterpreter>>,
}

impl FakeRuntime {
    fn new() -> Arc<FakeRuntime> {
        Arc::new(FakeRuntime {
            fail_forks: AtomicBool::new(false),
            silent_ready: AtomicBool::new(false),
            next_pid: AtomicU32::new(1000),
            servers: Mutex::new(Vec::new()),
        })
    }

    fn allocate_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    fn register(&self, server: FakeInterpreter) {
        if let Ok(mut servers) = self.servers.lock() {
            servers.push(server);
        }
    }

    fn stop_all(&self) {
        // Take the list out first: a server thread may be registering a
        // freshly forked child and must not be joined while we hold the lock.
        let mut drained = match self.servers.lock() {
            Ok(mut servers) => std::mem::take(&mut *servers),
            Err(_) => return,
        };
        for server in drained.iter_mut() {
            server.stop();
        }
    }
}

/// One fake fork server: a thread accepting fork requests on `fs.sock`.
///
/// On a non-launch request it "forks" a new fake interpreter into the target
/// sandbox (binding that sandbox's socket and writing its ready pipe), the
/// same dance the production interpreter does from inside the namespace.
struct FakeInterpreter {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    // Held open so handshake bytes survive until the cache reads them.
    _pipe: Option<File>,
}

impl FakeInterpreter {
    fn spawn(
        runtime: &Arc<FakeRuntime>,
        host_dir: &Path,
        announce_ready: bool,
    ) -> Result<FakeInterpreter> {
        let listener = UnixListener::bind(sandbox::sock_path(host_dir))?;

        let pipe = if announce_ready {
            let mut pipe = File::options()
                .read(true)
                .write(true)
                .open(sandbox::pipe_path(host_dir))?;
            pipe.write_all(b"ready")?;
            Some(pipe)
        } else {
            None
        };

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            let weak = Arc::downgrade(runtime);
            std::thread::spawn(move || accept_loop(listener, stop, weak))
        };

        Ok(FakeInterpreter {
            stop,
            thread: Some(thread),
            _pipe: pipe,
        })
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for FakeInterpreter {
    fn drop(&mut self) {
        self.stop();
    }
}

// Polling accept: the control socket may be unlinked underneath us when the
// fork server is killed, so a blocking accept could never wake for shutdown.
fn accept_loop(listener: UnixListener, stop: Arc<AtomicBool>, runtime: Weak<FakeRuntime>) {
    if listener.set_nonblocking(true).is_err() {
        return;
    }

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let mut conn = match listener.accept() {
            Ok((conn, _)) => conn,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(5));
                continue;
            }
            Err(_) => break,
        };
        if conn.set_nonblocking(false).is_err() {
            continue;
        }
        let runtime = match runtime.upgrade() {
            Some(runtime) => runtime,
            None => break,
        };
        if let Err(e) = handle_conn(&runtime, &mut conn) {
            log::debug!("fake interpreter: request failed: {}", e);
        }
    }
}

fn handle_conn(runtime: &Arc<FakeRuntime>, conn: &mut UnixStream) -> Result<()> {
    let request = protocol::read_request(conn)?;

    if runtime.fail_forks.load(Ordering::SeqCst) {
        return protocol::write_error(conn, 1, "import failed");
    }

    let pid = runtime.allocate_pid();
    if !request.launch && !runtime.silent_ready.load(Ordering::SeqCst) {
        // The new fork server lives in the target sandbox; its host dir
        // sits beside the root dir it was asked to enter.
        let host_dir = Path::new(&request.target_root)
            .parent()
            .map(|dir| dir.join("host"))
            .ok_or_else(|| {
                CacheError::Interpreter(format!(
                    "malformed target root {:?}",
                    request.target_root
                ))
            })?;
        let child = FakeInterpreter::spawn(runtime, &host_dir, true)?;
        runtime.register(child);
    }

    protocol::write_pid(conn, pid)
}

struct Track {
    id: String,
    removed: AtomicBool,
}

/// A directory-backed stand-in for one container.
pub struct TmpSandbox {
    id: String,
    ns_pid: String,
    root_dir: PathBuf,
    host_dir: PathBuf,
    cgroup_dir: PathBuf,
    entered: Mutex<Vec<u32>>,
    track: Arc<Track>,
}

impl TmpSandbox {
    fn build(dir: &Path, id: String, ns_pid: String) -> Result<TmpSandbox> {
        let root_dir = dir.join("root");
        let host_dir = dir.join("host");
        let cgroup_dir = dir.join("cgroup");
        std::fs::create_dir_all(&root_dir)?;
        std::fs::create_dir_all(&host_dir)?;
        std::fs::create_dir_all(&cgroup_dir)?;

        std::fs::write(cgroup_dir.join("memory.usage_in_bytes"), "0")?;
        std::fs::write(
            cgroup_dir.join("memory.limit_in_bytes"),
            u64::MAX.to_string(),
        )?;
        std::fs::write(cgroup_dir.join("tasks"), "")?;

        nix::unistd::mkfifo(
            &sandbox::pipe_path(&host_dir),
            nix::sys::stat::Mode::from_bits_truncate(0o600),
        )?;

        Ok(TmpSandbox {
            track: Arc::new(Track {
                id: id.clone(),
                removed: AtomicBool::new(false),
            }),
            id,
            ns_pid,
            root_dir,
            host_dir,
            cgroup_dir,
            entered: Mutex::new(Vec::new()),
        })
    }

    /// Pids moved into this sandbox's cgroup.
    pub fn entered_pids(&self) -> Vec<u32> {
        match self.entered.lock() {
            Ok(entered) => entered.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl ContainerSandbox for TmpSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn ns_pid(&self) -> &str {
        &self.ns_pid
    }

    fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn host_dir(&self) -> &Path {
        &self.host_dir
    }

    fn memory_cgroup_path(&self) -> PathBuf {
        self.cgroup_dir.clone()
    }

    fn cgroup_enter(&self, pid: u32) -> Result<()> {
        MemCGroup::new(self.cgroup_dir.clone()).add_process(pid)?;
        if let Ok(mut entered) = self.entered.lock() {
            entered.push(pid);
        }
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        self.track.removed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Sandbox factory over a scratch directory, wired to the fake runtime.
pub struct TmpSandboxFactory {
    base: PathBuf,
    runtime: Arc<FakeRuntime>,
    next_ns_pid: AtomicU32,
    /// Refuse `create` calls, simulating a driver failure.
    pub fail_create: AtomicBool,
    tracks: Mutex<Vec<Arc<Track>>>,
}

impl TmpSandboxFactory {
    /// The caller owns `base` (usually a tempdir) and its lifetime.
    pub fn new(base: &Path) -> Result<TmpSandboxFactory> {
        std::fs::create_dir_all(base)?;
        Ok(TmpSandboxFactory {
            base: base.to_path_buf(),
            runtime: FakeRuntime::new(),
            next_ns_pid: AtomicU32::new(100),
            fail_create: AtomicBool::new(false),
            tracks: Mutex::new(Vec::new()),
        })
    }

    pub fn runtime(&self) -> &Arc<FakeRuntime> {
        &self.runtime
    }

    /// Memory-cgroup directory of the root sandbox; tests write usage
    /// values here to drive the evictor.
    pub fn root_cgroup_dir(&self) -> PathBuf {
        self.base.join("sb-root").join("cgroup")
    }

    /// A destination sandbox for a lambda, outside the cache's bookkeeping.
    pub fn create_dest(&self) -> Result<TmpSandbox> {
        let id = format!("dest-{}", uuid::Uuid::new_v4());
        let ns_pid = self.next_ns_pid.fetch_add(1, Ordering::SeqCst);
        TmpSandbox::build(&self.base.join(&id), id.clone(), ns_pid.to_string())
    }

    /// Count of cache sandboxes created and not yet removed.
    pub fn live_sandboxes(&self) -> usize {
        match self.tracks.lock() {
            Ok(tracks) => tracks
                .iter()
                .filter(|track| !track.removed.load(Ordering::SeqCst))
                .count(),
            Err(_) => 0,
        }
    }

    fn track(&self, sandbox: &TmpSandbox) {
        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.push(Arc::clone(&sandbox.track));
        }
    }

    fn build_cache_sandbox(&self, id: String) -> Result<TmpSandbox> {
        let ns_pid = self.next_ns_pid.fetch_add(1, Ordering::SeqCst);
        let sandbox = TmpSandbox::build(&self.base.join(&id), id, ns_pid.to_string())?;
        self.track(&sandbox);
        Ok(sandbox)
    }
}

impl SandboxFactory for TmpSandboxFactory {
    fn create(&self) -> Result<Box<dyn ContainerSandbox>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(CacheError::Sandbox("driver refused create".to_string()));
        }
        let sandbox = self.build_cache_sandbox(format!("sb-{}", uuid::Uuid::new_v4()))?;
        Ok(Box::new(sandbox))
    }

    fn root(&self) -> Result<Box<dyn ContainerSandbox>> {
        let sandbox = self.build_cache_sandbox("sb-root".to_string())?;
        let root = FakeInterpreter::spawn(&self.runtime, sandbox.host_dir(), false)?;
        self.runtime.register(root);
        Ok(Box::new(sandbox))
    }

    fn cleanup(&self) {
        self.runtime.stop_all();
        if let Ok(tracks) = self.tracks.lock() {
            for track in tracks.iter() {
                if !track.removed.load(Ordering::SeqCst) {
                    log::warn!("cache sandbox {} was never removed", track.id);
                }
            }
        }
    }
}
