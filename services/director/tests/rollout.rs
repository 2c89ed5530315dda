mod common;

use std::time::Duration;

use common::{plan, Harness, DEPLOYMENT};
use drydock_director::plan::spec::PlanSpec;
use drydock_director::sim::CloudCall;
use drydock_director::{DirectorConfig, DirectorError};
use drydock_reconcile::Cancellation;
use rstest::rstest;

fn with_policy(instances: u32, max_errors: i32) -> PlanSpec {
    let mut plan = plan(instances, instances as usize);
    plan.update.max_errors = Some(max_errors);
    plan
}

fn rollback_root(err: &DirectorError) -> &DirectorError {
    match err {
        DirectorError::Rollback { job, .. } => {
            assert_eq!(job, "web");
            err.root()
        }
        other => panic!("expected rollback, got {other:?}"),
    }
}

#[rstest]
#[case::no_tolerance(0)]
#[case::generous(10)]
#[case::halt_first(-1)]
#[tokio::test(start_paused = true)]
async fn test_canary_failure_halts_regardless_of_max_errors(#[case] max_errors: i32) {
    let harness = Harness::new();
    harness.agents.fail_apply("web", 0);

    let err = harness.run(&with_policy(3, max_errors)).await.unwrap_err();
    assert!(matches!(rollback_root(&err), DirectorError::ApplyFailed { .. }));

    let creates = harness
        .cloud
        .calls()
        .iter()
        .filter(|c| matches!(c, CloudCall::CreateVm { .. }))
        .count();
    assert_eq!(creates, 1, "no instance may start after a canary fails");
    assert!(harness.records.instance(DEPLOYMENT, "web", 1).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_bulk_failure_beyond_max_errors_halts() {
    let harness = Harness::new();
    harness.agents.fail_apply("web", 1);
    harness.agents.fail_apply("web", 2);

    let err = harness.run(&with_policy(4, 1)).await.unwrap_err();
    assert!(matches!(rollback_root(&err), DirectorError::ApplyFailed { .. }));
    let DirectorError::Rollback { source, .. } = &err else {
        unreachable!()
    };
    assert!(source.to_string().starts_with("web/2:"), "{source}");

    assert!(harness.records.instance(DEPLOYMENT, "web", 2).is_some());
    assert!(harness.records.instance(DEPLOYMENT, "web", 3).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_bulk_failures_within_max_errors_are_tolerated() {
    let harness = Harness::new();
    harness.agents.fail_apply("web", 1);
    harness.agents.fail_apply("web", 2);

    let report = harness.run(&with_policy(4, 2)).await.unwrap();
    let job = &report.jobs[0];
    assert_eq!(job.update_errors, 2);
    assert_eq!(job.updated, 2);
    assert!(job.halt_reason.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_negative_max_errors_halts_on_first_bulk_failure() {
    let harness = Harness::new();
    harness.agents.fail_apply("web", 1);

    let err = harness.run(&with_policy(3, -1)).await.unwrap_err();
    assert!(err.is_rollback());
    assert!(harness.records.instance(DEPLOYMENT, "web", 2).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_job_not_running_after_watch_fails_the_canary() {
    let harness = Harness::new();
    harness.agents.never_running("web", 0);

    let err = harness.run(&with_policy(2, 5)).await.unwrap_err();
    assert!(matches!(rollback_root(&err), DirectorError::AgentJobNotRunning));
}

#[tokio::test(start_paused = true)]
async fn test_bulk_respects_max_in_flight() {
    let harness = Harness::new();
    harness.agents.set_apply_delay(Duration::from_secs(2));
    let mut plan = plan(5, 5);
    plan.update.max_in_flight = Some(2);
    plan.update.update_watch_time = Some("1000-5000".into());

    let report = harness.run(&plan).await.unwrap();
    assert_eq!(report.jobs[0].updated, 5);
    for index in 0..5 {
        assert!(harness.records.instance(DEPLOYMENT, "web", index).is_some());
    }
    assert_eq!(harness.agents.peak_applying(), 2);
}

#[rstest]
#[case::at_limit(2, false)]
#[case::over_limit(3, true)]
#[tokio::test(start_paused = true)]
async fn test_without_canaries_max_errors_bounds_bulk_failures(
    #[case] failures: u32,
    #[case] halts: bool,
) {
    let harness = Harness::new();
    for index in 0..failures {
        harness.agents.fail_apply("web", index);
    }
    let mut plan = with_policy(5, 2);
    plan.update.canaries = Some(0);

    let result = harness.run(&plan).await;
    if halts {
        let err = result.unwrap_err();
        assert!(matches!(rollback_root(&err), DirectorError::ApplyFailed { .. }));
        assert!(harness.records.instance(DEPLOYMENT, "web", 4).is_none());
    } else {
        let job = &result.unwrap().jobs[0];
        assert_eq!(job.update_errors, 2);
        assert_eq!(job.updated, 3);
        assert!(job.halt_reason.is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn test_drain_polls_status_until_done() {
    let harness = Harness::new();
    let mut plan = plan(1, 1);
    harness.run(&plan).await.unwrap();
    let agent = harness.agent_of("web", 0).unwrap();
    harness.clear_calls();

    harness.agents.set_drain_reply(-5);
    harness.agents.push_status_replies([5, 0]);
    plan.jobs[0].properties = serde_json::json!({"port": 81});
    harness.run(&plan).await.unwrap();

    let ops = harness.agent_ops(agent);
    assert_eq!(
        &ops[..4],
        ["drain:update", "drain:status", "drain:status", "stop"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_interrupts_drain_polling() {
    let harness = Harness::new();
    let mut plan = plan(1, 1);
    harness.run(&plan).await.unwrap();

    harness.agents.set_drain_reply(-5);
    harness.agents.push_status_replies(std::iter::repeat(5).take(100));
    plan.jobs[0].properties = serde_json::json!({"port": 81});

    let (handle, cancellation) = Cancellation::pair();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        handle.cancel();
    });
    let err = harness
        .reconciler(DirectorConfig::default(), cancellation)
        .run(&plan)
        .await
        .unwrap_err();
    assert!(matches!(err, DirectorError::Cancelled), "{err:?}");

    let agent = harness.agent_of("web", 0).unwrap();
    assert!(!harness.agent_ops(agent).contains(&"stop".to_string()));
}
