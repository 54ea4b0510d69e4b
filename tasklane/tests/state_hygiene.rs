//! Reference-count hygiene: the live-state gauge returns to baseline after
//! every completed or canceled operation.
//!
//! Kept in its own test binary so no sibling test perturbs the gauge.

use std::time::Duration;

use tasklane::{
    AsyncBlock, AsyncProvider, AsyncQueue, DispatchMode, Error, ProviderData,
    active_state_count, begin_async, cancel_async, complete_async, get_async_status, run_async,
    schedule_async,
};

struct Completing;

impl AsyncProvider for Completing {
    fn do_work(&self, data: &ProviderData) -> tasklane::Result<()> {
        complete_async(data.block(), Ok(()), 0);
        Ok(())
    }
}

struct Parked;

impl AsyncProvider for Parked {
    fn do_work(&self, _data: &ProviderData) -> tasklane::Result<()> {
        Err(Error::Pending)
    }
}

fn wait_for_baseline(baseline: usize) {
    // Completion callbacks release their state reference asynchronously;
    // give the queues a moment to drain.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while active_state_count() != baseline {
        assert!(
            std::time::Instant::now() < deadline,
            "state count stuck at {} (baseline {})",
            active_state_count(),
            baseline
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn states_drain_after_every_outcome() {
    let baseline = active_state_count();
    let queue = AsyncQueue::new(DispatchMode::ThreadPool, DispatchMode::ThreadPool);

    // Completed operations.
    for _ in 0..16 {
        let block = AsyncBlock::new(Some(queue.clone()));
        begin_async(&block, 1, "hygiene_complete", Completing).unwrap();
        schedule_async(&block, Duration::ZERO).unwrap();
        assert_eq!(get_async_status(&block, true), Ok(()));
        drop(block);
    }
    wait_for_baseline(baseline);

    // Canceled before their work dispatched.
    let manual = AsyncQueue::new(DispatchMode::Manual, DispatchMode::Manual);
    for _ in 0..16 {
        let block = AsyncBlock::new(Some(manual.clone()));
        begin_async(&block, 1, "hygiene_cancel", Parked).unwrap();
        schedule_async(&block, Duration::ZERO).unwrap();
        cancel_async(&block);
        assert_eq!(get_async_status(&block, true), Err(Error::Aborted));
        drop(block);
    }
    wait_for_baseline(baseline);

    // Canceled while a delay timer was armed.
    for _ in 0..8 {
        let block = AsyncBlock::new(Some(queue.clone()));
        begin_async(&block, 1, "hygiene_timer", Parked).unwrap();
        schedule_async(&block, Duration::from_secs(60)).unwrap();
        cancel_async(&block);
        drop(block);
    }
    wait_for_baseline(baseline);

    // Run-async round trips with completion callbacks.
    for _ in 0..16 {
        let block = AsyncBlock::with_callback(Some(queue.clone()), |_block| {});
        run_async(&block, |_block| Ok(())).unwrap();
        assert_eq!(get_async_status(&block, true), Ok(()));
        drop(block);
    }
    wait_for_baseline(baseline);

    // A reset of a terminal block releases whatever it still held.
    let block = AsyncBlock::new(Some(queue.clone()));
    begin_async(&block, 1, "hygiene_reset", Completing).unwrap();
    schedule_async(&block, Duration::ZERO).unwrap();
    assert_eq!(get_async_status(&block, true), Ok(()));
    block.reset().unwrap();
    drop(block);
    wait_for_baseline(baseline);
}
