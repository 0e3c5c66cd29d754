/// Cache manager: owns the fork-server forest and serves provisioning
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::cgroup::MemCGroup;
use crate::config::{CacheLimits, Config};
use crate::evictor::{Evictor, EvictorHandle};
use crate::matcher;
use crate::protocol;
use crate::sandbox::{self, ContainerSandbox, SandboxFactory};
use crate::server::{self, ForkServer, NodeId, ServerState};
use crate::sizes::SizeTable;
use crate::types::{CacheError, Result};

/// The fork-server forest. The owning mutex guards the node list, children
/// counts, and parent links; it is never held across sandbox or interpreter
/// I/O.
pub(crate) struct Forest {
    nodes: HashMap<NodeId, Arc<ForkServer>>,
    next_id: NodeId,
}

impl Forest {
    fn new() -> Forest {
        Forest {
            nodes: HashMap::new(),
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert(&mut self, node: Arc<ForkServer>) {
        self.nodes.insert(node.id(), node);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<ForkServer>> {
        self.nodes.values()
    }

    /// Unlink a node and credit its parent's children count. Idempotent:
    /// returns false when the node was already gone.
    fn detach(&mut self, id: NodeId) -> bool {
        match self.nodes.remove(&id) {
            Some(node) => {
                if let Some(parent_id) = node.parent() {
                    if let Some(parent) = self.nodes.get(&parent_id) {
                        parent.dec_children();
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Any node without live descendants, for leaves-first teardown.
    fn any_leaf(&self) -> Option<Arc<ForkServer>> {
        self.nodes
            .values()
            .find(|node| node.children() == 0)
            .map(Arc::clone)
    }
}

/// Owns the fork-server forest, serves provisioning requests, and
/// coordinates the evictor.
pub struct CacheManager {
    forest: Mutex<Forest>,
    full: AtomicBool,
    sizes: SizeTable,
    factory: Arc<dyn SandboxFactory>,
    limits: CacheLimits,
    timing: bool,
    evictor: Mutex<Option<EvictorHandle>>,
}

impl CacheManager {
    /// Bring up the cache: size table, root fork server, evictor. Returns
    /// `None` when the configured budget is zero (cache disabled).
    pub fn init(
        config: &Config,
        factory: Arc<dyn SandboxFactory>,
    ) -> Result<Option<Arc<CacheManager>>> {
        Self::init_with_limits(config, factory, CacheLimits::default())
    }

    /// `init` with explicit operational bounds; tests shorten them.
    pub fn init_with_limits(
        config: &Config,
        factory: Arc<dyn SandboxFactory>,
        limits: CacheLimits,
    ) -> Result<Option<Arc<CacheManager>>> {
        if config.import_cache_size == 0 {
            return Ok(None);
        }

        let sizes = SizeTable::load_or_empty(&config.pkg_sizes_path())?;

        let root_sandbox = factory.root()?;
        let root_sock = sandbox::sock_path(root_sandbox.host_dir());
        if let Err(e) = wait_for_sock(&root_sock, limits.root_sock_timeout) {
            if let Err(remove_err) = root_sandbox.remove() {
                log::error!("failed to remove root sandbox: {}", remove_err);
            }
            return Err(e);
        }
        let mem_cgroup = MemCGroup::new(root_sandbox.memory_cgroup_path());

        let mut forest = Forest::new();
        let root_id = forest.allocate_id();
        let root = Arc::new(ForkServer::new(root_id, None, BTreeSet::new(), 1));
        root.set_sock(root_sock);
        root.lock_state()?.sandbox = Some(root_sandbox);
        forest.insert(root);

        let manager = Arc::new(CacheManager {
            forest: Mutex::new(forest),
            full: AtomicBool::new(false),
            sizes,
            factory,
            limits,
            timing: config.timing,
            evictor: Mutex::new(None),
        });

        let handle = Evictor::spawn(
            Arc::downgrade(&manager),
            mem_cgroup,
            config.import_cache_size,
        );
        *manager
            .evictor
            .lock()
            .map_err(|_| CacheError::Lock("evictor mutex poisoned".to_string()))? = Some(handle);

        Ok(Some(manager))
    }

    /// Serve one invocation: pick the best ancestor for `packages`, extend
    /// the forest if needed, and fork-enter a lambda process into `dest`.
    /// Returns the fork server used and whether the request was an exact hit.
    pub fn provision(
        &self,
        dest: &dyn ContainerSandbox,
        packages: &[String],
    ) -> Result<(Arc<ForkServer>, bool)> {
        let request = normalize(packages);
        let start = Instant::now();

        let mut forest = self.lock_forest()?;
        let m = matcher::find_best(forest.iter(), &request).ok_or_else(|| {
            CacheError::Interpreter("no fork server matches the request".to_string())
        })?;
        let hit = m.hit;
        let delta = m.delta;

        let node: Arc<ForkServer>;
        let mut state: MutexGuard<'_, ServerState>;
        if hit {
            node = m.node;
            state = node.lock_state()?;
            drop(forest);
            if node.is_dead() {
                return Err(CacheError::Interpreter(format!(
                    "fork server {} died before use",
                    node.id()
                )));
            }
        } else {
            if self.full() {
                return Err(CacheError::Capacity(format!(
                    "import cache is full, refusing to cache {:?}",
                    delta
                )));
            }

            let parent = m.node;
            let parent_sock = parent.sock().ok_or_else(|| {
                CacheError::Interpreter(format!(
                    "fork server {} is not initialized yet",
                    parent.id()
                ))
            })?;

            let mut child_packages = parent.packages().clone();
            child_packages.extend(delta.iter().cloned());
            let size_kb = self.sizes.total(&delta);

            let id = forest.allocate_id();
            node = Arc::new(ForkServer::new(
                id,
                Some(parent.id()),
                child_packages,
                size_kb,
            ));
            parent.inc_children();
            forest.insert(Arc::clone(&node));
            state = node.lock_state()?;
            drop(forest);

            if let Err(e) = self.setup_child(&node, &parent_sock, &delta, &mut state) {
                drop(state);
                self.discard_failed_child(&node);
                return Err(e);
            }
        }

        node.hit();

        let pid = match node.fork_enter(
            dest.root_dir(),
            dest.ns_pid(),
            &[],
            true,
            self.limits.fork_timeout,
        ) {
            Ok(pid) => pid,
            Err(CacheError::Io(e)) => {
                // The control socket is gone; the server is unusable.
                let msg = format!("fork server {} socket unreachable: {}", node.id(), e);
                self.retire_unreachable(&node, state);
                return Err(CacheError::Interpreter(msg));
            }
            Err(e) => return Err(e),
        };

        dest.cgroup_enter(pid)?;
        drop(state);

        if self.timing {
            log::info!(
                "provisioned lambda pid {} from fork server {} in {:?} (hit={})",
                pid,
                node.id(),
                start.elapsed(),
                hit
            );
        }

        Ok((node, hit))
    }

    /// Whether memory pressure has the cache refusing new nodes. Callers may
    /// use this to shed load upstream.
    pub fn full(&self) -> bool {
        self.full.load(Ordering::SeqCst)
    }

    pub(crate) fn set_full(&self, full: bool) {
        self.full.store(full, Ordering::SeqCst);
    }

    /// Snapshot of the live forest, for introspection and tests.
    pub fn servers(&self) -> Vec<Arc<ForkServer>> {
        match self.lock_forest() {
            Ok(forest) => forest.iter().map(Arc::clone).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Tear down every fork server (leaves first) and the sandboxes behind
    /// them, then stop the evictor and run factory cleanup.
    pub fn cleanup(&self) {
        if let Ok(mut evictor) = self.evictor.lock() {
            if let Some(handle) = evictor.take() {
                handle.stop();
            }
        }

        loop {
            let victim = match self.lock_forest() {
                Ok(mut forest) => match forest.any_leaf() {
                    Some(node) => {
                        forest.detach(node.id());
                        Some(node)
                    }
                    None => None,
                },
                Err(e) => {
                    log::error!("shutdown: {}", e);
                    None
                }
            };

            match victim {
                Some(node) => {
                    if let Err(e) = node.kill() {
                        log::error!("shutdown: failed to kill fork server {}: {}", node.id(), e);
                    }
                }
                None => break,
            }
        }

        self.factory.cleanup();
    }

    /// Pick and unlink the least useful evictable server: a leaf, not the
    /// root, whose lock is free, with the lowest hits-per-kilobyte. The
    /// caller kills it asynchronously.
    pub(crate) fn evict_one(&self) -> Option<Arc<ForkServer>> {
        let mut forest = self.lock_forest().ok()?;

        let mut best: Option<(Arc<ForkServer>, f64)> = None;
        for node in forest.iter() {
            if node.parent().is_none() || node.children() > 0 || node.is_dead() {
                continue;
            }
            // A held lock means the server is mid-operation; skip it.
            let probe = match node.try_lock_state() {
                Some(guard) => guard,
                None => continue,
            };
            drop(probe);

            let ratio = node.hits() as f64 / node.size_kb().max(1) as f64;
            let better = match &best {
                None => true,
                Some((_, incumbent)) => ratio < *incumbent,
            };
            if better {
                best = Some((Arc::clone(node), ratio));
            }
        }

        let (victim, ratio) = best?;
        // The dead store happens under both locks: the forest lock is held
        // for the whole selection, and the node lock is re-taken here (still
        // free, since acquiring it requires the forest lock we hold).
        let state = victim.try_lock_state()?;
        victim.mark_dead(&state);
        drop(state);
        forest.detach(victim.id());
        drop(forest);

        log::info!(
            "evicting fork server {} ({} hits, {} kb, ratio {:.4})",
            victim.id(),
            victim.hits(),
            victim.size_kb(),
            ratio
        );
        Some(victim)
    }

    fn setup_child(
        &self,
        child: &Arc<ForkServer>,
        parent_sock: &Path,
        delta: &[String],
        state: &mut MutexGuard<'_, ServerState>,
    ) -> Result<()> {
        let sandbox = self.factory.create()?;
        let host_dir = sandbox.host_dir().to_path_buf();
        let root_dir = sandbox.root_dir().to_path_buf();
        let ns_pid = sandbox.ns_pid().to_string();
        // Owned by the node from here on; kill() releases it on any failure.
        state.sandbox = Some(sandbox);

        let pid = protocol::fork_request(
            parent_sock,
            &root_dir,
            &ns_pid,
            delta,
            false,
            self.limits.fork_timeout,
        )?;

        let waited = server::await_ready(&host_dir, self.limits.ready_timeout)?;
        if self.timing {
            log::info!("wait for fork server {} took {:?}", child.id(), waited);
        }

        state.pid = Some(pid);
        child.set_sock(sandbox::sock_path(&host_dir));
        Ok(())
    }

    /// Undo a failed child creation: unlink it from the forest (restoring
    /// the parent's children count) and release its resources.
    fn discard_failed_child(&self, child: &Arc<ForkServer>) {
        match self.lock_forest() {
            Ok(mut forest) => {
                forest.detach(child.id());
            }
            Err(e) => log::error!("failed to unlink fork server {}: {}", child.id(), e),
        }
        if let Err(e) = child.kill() {
            log::error!("failed to kill fork server {}: {}", child.id(), e);
        }
    }

    /// A server whose socket is unreachable cannot serve again. It is marked
    /// dead while its node lock is still held, so the matcher stops routing
    /// to it before any other request can pick it up; only then is the lock
    /// released and the node unlinked.
    fn retire_unreachable(&self, node: &Arc<ForkServer>, state: MutexGuard<'_, ServerState>) {
        if node.parent().is_none() {
            // The root is never retired; without it nothing can be matched.
            return;
        }
        node.mark_dead(&state);
        drop(state);

        let removed = match self.lock_forest() {
            Ok(mut forest) => {
                if node.children() == 0 {
                    forest.detach(node.id())
                } else {
                    // Children keep the node linked; it is reclaimed once
                    // they are gone, at the latest during shutdown.
                    log::warn!(
                        "fork server {} is unreachable but has children, deferring removal",
                        node.id()
                    );
                    false
                }
            }
            Err(e) => {
                log::error!("failed to unlink fork server {}: {}", node.id(), e);
                false
            }
        };

        if removed {
            if let Err(e) = node.kill() {
                log::error!("failed to kill fork server {}: {}", node.id(), e);
            }
        }
    }

    fn lock_forest(&self) -> Result<MutexGuard<'_, Forest>> {
        self.forest
            .lock()
            .map_err(|_| CacheError::Lock("forest mutex poisoned".to_string()))
    }
}

/// Lowercase and dedupe a request's package names, preserving order.
fn normalize(packages: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for package in packages {
        let package = package.to_lowercase();
        if seen.insert(package.clone()) {
            out.push(package);
        }
    }
    out
}

fn wait_for_sock(sock: &Path, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    while !sock.exists() {
        if start.elapsed() > timeout {
            return Err(CacheError::Timeout(format!(
                "root fork server failed to start after {:?}",
                timeout
            )));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}
