//! Execution container behaviour: dependency blocking, failure propagation,
//! cancellation and node-pool multiplexing.

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use calcgrid::cache::InMemoryCacheSource;
use calcgrid::config::ContainerConfig;
use calcgrid::function::InMemoryFunctionRepository;
use calcgrid::job::CalculationJob;

use test_harness::{
    assert_eventually, container_with, job_level_failing_job, job_spec, one_item_job,
    register_constant, vspec, CollectingInvocationReceiver, SleepingInvoker,
};

fn empty_job(job_id: u64) -> CalculationJob {
    CalculationJob::new(job_spec(job_id), vec![])
}

#[tokio::test]
async fn absent_requirement_counts_as_already_completed() {
    let container = container_with(
        1,
        Arc::new(InMemoryCacheSource::new()),
        Arc::new(InMemoryFunctionRepository::new()),
        ContainerConfig::default(),
    );
    let receiver = CollectingInvocationReceiver::new();

    container.add_job(empty_job(1).with_required([99]), receiver.clone());

    assert_eventually(
        || async { receiver.completed_count() == 1 },
        Duration::from_secs(2),
        "A requirement absent from the bookkeeping must not block the job",
    )
    .await;
}

#[tokio::test]
async fn dependent_job_runs_after_its_requirement() {
    let cache_source = Arc::new(InMemoryCacheSource::new());
    let functions = Arc::new(InMemoryFunctionRepository::new());
    functions.register(
        "fn-slow",
        Arc::new(SleepingInvoker {
            delay: Duration::from_millis(100),
        }),
    );
    register_constant(&functions, "fn-b");
    let container = container_with(2, cache_source, functions, ContainerConfig::default());
    let receiver = CollectingInvocationReceiver::new();

    let cycle = job_spec(1);
    let produced = vspec("Upstream", "fn-slow");
    let job_a = one_item_job(cycle.clone(), "fn-slow", vec![], produced.clone());
    let job_b = one_item_job(
        cycle.with_job_id(2),
        "fn-b",
        vec![produced],
        vspec("Downstream", "fn-b"),
    )
    .with_required([1]);

    container.add_job(job_a, receiver.clone());
    container.add_job(job_b, receiver.clone());

    assert_eventually(
        || async { receiver.completed_count() == 2 },
        Duration::from_secs(2),
        "Both jobs should complete",
    )
    .await;

    // B ran after A's write, so its input was present.
    for result in receiver.completed.lock().unwrap().iter() {
        assert_eq!(
            result.failed_items(),
            0,
            "job {} should have no failed items",
            result.spec.job_id
        );
    }
}

#[tokio::test]
async fn requirement_that_already_failed_fails_submission_immediately() {
    let container = container_with(
        1,
        Arc::new(InMemoryCacheSource::new()),
        Arc::new(InMemoryFunctionRepository::new()),
        ContainerConfig::default(),
    );
    let receiver = CollectingInvocationReceiver::new();

    container.add_job(job_level_failing_job(job_spec(1)), receiver.clone());
    assert_eventually(
        || async { receiver.failed_count() == 1 },
        Duration::from_secs(2),
        "The poisoned job should fail",
    )
    .await;

    container.add_job(empty_job(2).with_required([1]), receiver.clone());
    assert_eventually(
        || async { receiver.failed_count() == 2 },
        Duration::from_secs(2),
        "A dependent of a failed job fails without being queued",
    )
    .await;
    assert_eq!(receiver.completed_count(), 0);

    let failed = receiver.failed.lock().unwrap().clone();
    assert_eq!(failed[1].0, 2);
    assert!(failed[1].1.contains("required job failed"));
}

#[tokio::test]
async fn failure_while_dependent_is_blocked_propagates_exactly_once() {
    let functions = Arc::new(InMemoryFunctionRepository::new());
    functions.register(
        "fn-slow",
        Arc::new(SleepingInvoker {
            delay: Duration::from_millis(100),
        }),
    );
    let container = container_with(
        2,
        Arc::new(InMemoryCacheSource::new()),
        functions,
        ContainerConfig::default(),
    );
    let receiver = CollectingInvocationReceiver::new();

    // Sleeps, then fails at the job level on its second item.
    let mut poisoned = job_level_failing_job(job_spec(1));
    let mut slow_item = poisoned.items[0].clone();
    slow_item.function_id = "fn-slow".to_string();
    slow_item.outputs = calcgrid::job::ValueIdents::Specs(vec![vspec("Slow", "fn-slow")]);
    poisoned.items.insert(0, slow_item);

    container.add_job(poisoned, receiver.clone());
    // Registers as blocked while the poisoned job is still sleeping.
    container.add_job(empty_job(2).with_required([1]), receiver.clone());

    assert_eventually(
        || async { receiver.failed_count() == 2 },
        Duration::from_secs(2),
        "The blocked job must fail when its requirement fails",
    )
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(receiver.failed_count(), 2, "each job fails exactly once");
    assert_eq!(receiver.completed_count(), 0);
}

#[tokio::test]
async fn cancelled_job_stops_mid_flight() {
    let functions = Arc::new(InMemoryFunctionRepository::new());
    functions.register(
        "fn-slow",
        Arc::new(SleepingInvoker {
            delay: Duration::from_secs(10),
        }),
    );
    let container = container_with(
        1,
        Arc::new(InMemoryCacheSource::new()),
        functions,
        ContainerConfig::default(),
    );
    let receiver = CollectingInvocationReceiver::new();

    let spec = job_spec(1);
    let job = one_item_job(spec.clone(), "fn-slow", vec![], vspec("Out", "fn-slow"));
    container.add_job(job, receiver.clone());

    assert_eventually(
        || async { container.is_alive(&spec) },
        Duration::from_secs(1),
        "Job should be tracked once submitted",
    )
    .await;
    container.cancel(&spec);

    assert_eventually(
        || async { receiver.failed_count() == 1 },
        Duration::from_secs(2),
        "Cancellation interrupts the sleeping item",
    )
    .await;
    assert!(!container.is_alive(&spec));
}

#[tokio::test]
async fn single_node_drains_a_wave_of_jobs() {
    let container = container_with(
        1,
        Arc::new(InMemoryCacheSource::new()),
        Arc::new(InMemoryFunctionRepository::new()),
        ContainerConfig::default(),
    );
    let receiver = CollectingInvocationReceiver::new();

    for job_id in 1..=8 {
        container.add_job(empty_job(job_id), receiver.clone());
    }

    assert_eventually(
        || async { receiver.completed_count() == 8 },
        Duration::from_secs(2),
        "One node should work through the whole runnable queue",
    )
    .await;
}

#[tokio::test]
async fn is_alive_reflects_tracking() {
    let functions = Arc::new(InMemoryFunctionRepository::new());
    functions.register(
        "fn-slow",
        Arc::new(SleepingInvoker {
            delay: Duration::from_millis(100),
        }),
    );
    let container = container_with(
        1,
        Arc::new(InMemoryCacheSource::new()),
        functions,
        ContainerConfig::default(),
    );
    let receiver = CollectingInvocationReceiver::new();

    let spec = job_spec(1);
    container.add_job(
        one_item_job(spec.clone(), "fn-slow", vec![], vspec("Out", "fn-slow")),
        receiver.clone(),
    );
    assert!(container.is_alive(&spec));

    assert_eventually(
        || async { receiver.completed_count() == 1 },
        Duration::from_secs(2),
        "Job should finish",
    )
    .await;
    assert!(!container.is_alive(&spec));
}
