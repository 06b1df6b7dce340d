use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use engine_broker::{EnginePool, PoolConfig, RespawnPolicy, WorkerSpec};
use tempfile::TempDir;

/// Respawn delay used by the fixture pools.
pub(crate) const RESPAWN_DELAY: Duration = Duration::from_millis(300);

/// A started pool of mock engines plus the scratch files they load.
pub(crate) struct TestPool {
    pub(crate) pool: Arc<EnginePool>,
    _dir: TempDir,
}

impl TestPool {
    pub(crate) fn pid(&self, name: &str) -> Option<u32> {
        self.pool.engine(name).and_then(|e| e.supervisor().pid())
    }

    pub(crate) fn pending(&self, name: &str) -> usize {
        self.pool
            .engine(name)
            .map(|e| e.supervisor().multiplexer().pending_count())
            .unwrap_or(0)
    }
}

pub(crate) fn mock_engine() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mock-engine"))
}

/// Spec for a mock engine whose model and config files live in `dir`.
pub(crate) fn mock_spec(dir: &Path, name: &str) -> WorkerSpec {
    let model = dir.join(format!("{}-b6c96.bin.gz", name));
    let config = dir.join("analysis.cfg");
    std::fs::write(&model, b"weights").expect("write model file");
    std::fs::write(&config, b"numSearchThreads = 1\n").expect("write config file");
    WorkerSpec::new(name, mock_engine(), model, config)
}

pub(crate) fn fast_respawn() -> RespawnPolicy {
    RespawnPolicy {
        delay_ms: RESPAWN_DELAY.as_millis() as u64,
        ..Default::default()
    }
}

/// Build and start a pool of mock engines; the default engine is the first name
/// unless "normal" is among them.
pub(crate) fn start_pool(names: &[&str]) -> TestPool {
    start_pool_with(names, |_| {})
}

pub(crate) fn start_pool_with(names: &[&str], tweak: impl FnOnce(&mut PoolConfig)) -> TestPool {
    let dir = tempfile::tempdir().expect("create temp dir");
    let specs = names.iter().map(|n| mock_spec(dir.path(), n)).collect();

    let default = if names.contains(&"normal") {
        "normal"
    } else {
        names[0]
    };
    let mut config = PoolConfig::new(specs).with_default_engine(default);
    config.respawn = fast_respawn();
    config.shutdown_grace_ms = 2_000;
    tweak(&mut config);

    let pool = EnginePool::new(config).expect("build pool");
    let failures = pool.start_all();
    assert!(failures.is_empty(), "start failures: {:?}", failures);

    TestPool {
        pool: Arc::new(pool),
        _dir: dir,
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub(crate) async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
