use kiln::engine::{EngineConfig, MemoryEngine};
use kiln::errors::KilnResult;
use kiln::Store;
use std::time::Duration;

/// A store bound to a fresh database for a single test.
#[derive(Clone, Debug)]
pub struct TestContext {
    engine: MemoryEngine,
    store: Store,
}

impl TestContext {
    pub fn engine(&self) -> &MemoryEngine {
        &self.engine
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }
}

pub fn random_db() -> String {
    format!("test_{}", uuid::Uuid::new_v4().simple())
}

/// Returns an engine tuned for tests: change streams notice cancellation
/// quickly.
pub fn test_engine(oplog_capacity: usize) -> MemoryEngine {
    MemoryEngine::with_config(
        EngineConfig::new()
            .with_oplog_capacity(oplog_capacity)
            .with_poll_interval(Duration::from_millis(5)),
    )
}

pub fn create_test_context() -> KilnResult<TestContext> {
    create_test_context_with_capacity(1024)
}

pub fn create_test_context_with_capacity(oplog_capacity: usize) -> KilnResult<TestContext> {
    let engine = test_engine(oplog_capacity);
    let store = Store::open(Some(engine.clone()), &random_db())?;
    Ok(TestContext { engine, store })
}

pub fn cleanup(ctx: TestContext) -> KilnResult<()> {
    ctx.store().close()?;
    ctx.engine().close();
    Ok(())
}

/// Runs a test between a setup and a teardown step. The teardown runs even
/// if the test fails; a failure of any step fails the test.
pub fn run_test<B, T, A>(before: B, test: T, after: A)
where
    B: Fn() -> KilnResult<TestContext>,
    T: Fn(TestContext) -> KilnResult<()>,
    A: Fn(TestContext) -> KilnResult<()>,
{
    let ctx = match before() {
        Ok(ctx) => ctx,
        Err(err) => panic!("Before run failed: {:?}", err),
    };

    let result = test(ctx.clone());
    let teardown = after(ctx);
    if let Err(err) = result {
        panic!("Test failed: {:?}", err);
    }
    if let Err(err) = teardown {
        panic!("After run failed: {:?}", err);
    }
}

/// Waits until the check passes or the timeout elapses.
pub fn wait_for<F>(timeout: Duration, check: F)
where
    F: Fn() -> bool,
{
    awaitility::at_most(timeout).until(check);
}

#[ctor::ctor]
fn init_logging() {
    colog::init();
}
