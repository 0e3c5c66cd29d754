// Provisioning latency benchmark against the in-process fake interpreters.
// Measures warm-hit round trips (match + fork-enter + cgroup-enter) and the
// pure matcher over a grown forest.

use std::sync::Arc;
use std::time::{Duration, Instant};

use forkcache::config::{CacheLimits, Config};
use forkcache::manager::CacheManager;
use forkcache::sandbox::SandboxFactory;
use forkcache::testing::TmpSandboxFactory;

const WARMUP_ITERATIONS: usize = 10;
const ITERATIONS: usize = 200;

struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    min: Duration,
    max: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();
        Self {
            p50: samples[len / 2],
            p95: samples[(len as f64 * 0.95) as usize],
            p99: samples[(len as f64 * 0.99) as usize],
            min: samples[0],
            max: samples[len - 1],
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  p99: {:?}", self.p99);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
    }
}

fn main() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("sizes.txt"), "a:100\nb:50\nc:25\n").unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        r#"{
            "import_cache_size": 1048576,
            "import_cache_dir": "cache",
            "olcontainer_cache_base": "base",
            "pkg_sizes_file": "sizes.txt"
        }"#,
    )
    .unwrap();

    let config = Config::load(&dir.path().join("config.json")).unwrap();
    let factory = Arc::new(TmpSandboxFactory::new(&dir.path().join("sandboxes")).unwrap());
    let dyn_factory: Arc<dyn SandboxFactory> = factory.clone();
    let manager = CacheManager::init_with_limits(&config, dyn_factory, CacheLimits::default())
        .unwrap()
        .expect("cache enabled");

    let request: Vec<String> = vec!["a".to_string(), "b".to_string()];
    let dest = factory.create_dest().unwrap();

    // Cold provision once so every further iteration is a warm hit.
    let (_, hit) = manager.provision(&dest, &request).unwrap();
    assert!(!hit);

    for _ in 0..WARMUP_ITERATIONS {
        manager.provision(&dest, &request).unwrap();
    }

    let mut samples = Vec::with_capacity(ITERATIONS);
    for _ in 0..ITERATIONS {
        let start = Instant::now();
        let (_, hit) = manager.provision(&dest, &request).unwrap();
        samples.push(start.elapsed());
        assert!(hit);
    }
    LatencyStats::from_samples(samples).print("warm-hit provision");

    // Grow a few branches, then measure extension provisions that fork a
    // new server each time.
    let mut samples = Vec::with_capacity(ITERATIONS / 10);
    for i in 0..ITERATIONS / 10 {
        let request: Vec<String> = vec!["a".to_string(), "b".to_string(), format!("pkg{}", i)];
        let start = Instant::now();
        let (_, hit) = manager.provision(&dest, &request).unwrap();
        samples.push(start.elapsed());
        assert!(!hit);
    }
    LatencyStats::from_samples(samples).print("extension provision (new fork server)");

    manager.cleanup();
}
