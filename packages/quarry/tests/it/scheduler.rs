//! Dispatcher queue scenarios.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use pretty_assertions::assert_eq;
use quarry::{
    context::BuildContext,
    pip::PipId,
    scheduler::{DispatchStage, DispatcherQueue, RunnablePip, ScheduleConfig, StepOutcome},
};

fn queue_with_cpu(degree: usize) -> Arc<DispatcherQueue> {
    let config = ScheduleConfig::builder().cpu(degree).build();
    Arc::new(DispatcherQueue::new(BuildContext::new(), config))
}

#[test_log::test(tokio::test)]
async fn cancellation_discards_queued_pips_and_drains_the_running_set() {
    let queue = queue_with_cpu(4);
    let started = Arc::new(AtomicUsize::new(0));

    for i in 0..100 {
        let started = Arc::clone(&started);
        queue.enqueue(RunnablePip::new(PipId(i), DispatchStage::Cpu, move || {
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                // Long enough that cancellation lands while work is in
                // flight.
                tokio::time::sleep(Duration::from_millis(20)).await;
                StepOutcome::Completed
            }
        }));
    }

    let drainer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.drain().await })
    };

    // Wait until at least 10 steps have started, then cancel.
    for _ in 0..500 {
        if started.load(Ordering::SeqCst) >= 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(started.load(Ordering::SeqCst) >= 10);

    queue.cancel().await;
    assert_eq!(queue.num_running_or_queued(), 0);

    drainer.await.expect("drain loop panicked");

    // The queued remainder was discarded: nothing else ever starts.
    let at_cancel = started.load(Ordering::SeqCst);
    assert!(at_cancel < 100, "only the running set may have started");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(started.load(Ordering::SeqCst), at_cancel);
}

#[test_log::test(tokio::test)]
async fn enqueues_after_cancellation_are_dropped_silently() {
    let queue = queue_with_cpu(2);
    queue.cancel().await;

    queue.enqueue(RunnablePip::new(PipId(1), DispatchStage::Cpu, || async {
        StepOutcome::Completed
    }));
    assert_eq!(queue.num_running_or_queued(), 0);

    // Drain returns immediately: cancelled with nothing running.
    queue.drain().await;
}

#[test_log::test(tokio::test)]
async fn a_single_slot_stage_runs_fifo() {
    let queue = queue_with_cpu(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..8 {
        let order = Arc::clone(&order);
        queue.enqueue(RunnablePip::new(PipId(i), DispatchStage::Cpu, move || {
            async move {
                order.lock().unwrap().push(i);
                StepOutcome::Completed
            }
        }));
    }
    queue.set_finalized();
    queue.drain().await;

    assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
}

#[test_log::test(tokio::test)]
async fn finalized_queue_completes_when_empty() {
    let queue = queue_with_cpu(2);
    let ran = Arc::new(AtomicUsize::new(0));

    for i in 0..10 {
        let ran = Arc::clone(&ran);
        queue.enqueue(RunnablePip::new(PipId(i), DispatchStage::Cpu, move || {
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                StepOutcome::Completed
            }
        }));
    }
    queue.set_finalized();
    queue.drain().await;

    assert_eq!(ran.load(Ordering::SeqCst), 10);
    assert_eq!(queue.num_running_or_queued(), 0);
}

#[test_log::test(tokio::test)]
async fn concurrency_never_exceeds_the_stage_degree() {
    let queue = queue_with_cpu(3);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for i in 0..30 {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        queue.enqueue(RunnablePip::new(PipId(i), DispatchStage::Cpu, move || {
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(3)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                StepOutcome::Completed
            }
        }));
    }
    queue.set_finalized();
    queue.drain().await;

    assert!(peak.load(Ordering::SeqCst) <= 3, "peak {}", peak.load(Ordering::SeqCst));
}
