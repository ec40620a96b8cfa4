use std::time::Duration;

use squall::{JobPool, LockMode, LockSet, PoolConfig, Resource, SleepTask};

#[tokio::main]
async fn main() {
    let mut pool = JobPool::init(PoolConfig::default()).await;

    let db = Resource::Database("factbook".to_string());
    let writer = pool.submit(SleepTask::new(
        LockSet::new().write(db.clone()),
        Duration::from_millis(400),
    ));
    let reader = pool.submit(SleepTask::new(
        LockSet::new().read(db),
        Duration::from_millis(100),
    ));
    let global = pool.submit(SleepTask::new(
        LockSet::global(LockMode::Read),
        Duration::from_millis(100),
    ));
    let free = pool.submit(SleepTask::non_locking(Duration::from_secs(3600)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    for job in pool.list() {
        println!("{job}");
    }

    pool.stop(free).unwrap();
    for id in [writer, reader, global, free] {
        let state = pool.wait(id).await.unwrap();
        println!("{id} settled as {state}");
    }

    pool.shutdown().await;
}
