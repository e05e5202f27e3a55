mod support;

use std::sync::Arc;
use std::time::Duration;

use harvester_core::{HarvestRequest, NewSubscription, RuleKind, SaveSummary};
use harvester_engine::{
    CycleReport, DeliveryEngine, DeliverySettings, HarvestReport, ManualHarvestError, MemoryStore,
    RateLimiter, Scheduler, SchedulerSettings, SchedulerState, Store, SweepReport, TriggerOutcome,
};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use support::{init_logging, FakeHarvester, FakeTransport, Sent};

struct Fixture {
    harvester: Arc<FakeHarvester>,
    store: Arc<MemoryStore>,
    transport: Arc<FakeTransport>,
    scheduler: Arc<Scheduler>,
}

fn settings() -> SchedulerSettings {
    SchedulerSettings {
        initial_delay: Duration::from_secs(5),
        interval: Duration::from_secs(60),
        pages: 2,
    }
}

fn fixture(harvester: Arc<FakeHarvester>) -> Fixture {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let transport = FakeTransport::new();
    let delivery = Arc::new(DeliveryEngine::new(
        store.clone(),
        transport.clone(),
        RateLimiter::new(1_000_000.0).expect("limiter"),
        DeliverySettings::default(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        harvester.clone(),
        store.clone(),
        delivery,
        settings(),
    ));
    Fixture {
        harvester,
        store,
        transport,
        scheduler,
    }
}

#[tokio::test]
async fn cycle_harvests_saves_and_delivers() {
    let fx = fixture(FakeHarvester::returning(&["ABC-001", "not a code"]));
    fx.store
        .upsert_subscription(NewSubscription::new(1, "private", RuleKind::All, ""))
        .await
        .expect("subscribe");

    let outcome = fx.scheduler.try_run(2, &CancellationToken::new()).await;

    assert_eq!(
        outcome,
        TriggerOutcome::Accepted(CycleReport {
            found: 2,
            invalid: 1,
            save: Some(SaveSummary {
                saved: 1,
                duplicates: 0
            }),
            delivery: Some(SweepReport {
                records: 1,
                marked_delivered: 1,
                sent: 1,
                ..SweepReport::default()
            }),
            cancelled: false,
        })
    );
    assert!(matches!(fx.transport.sent()[..], [Sent::Markdown(1, _)]));
}

#[tokio::test]
async fn repeated_cycles_count_duplicates() {
    let fx = fixture(FakeHarvester::returning(&["ABC-001", "ABC-002"]));
    let cancel = CancellationToken::new();

    fx.scheduler.try_run(2, &cancel).await;
    let TriggerOutcome::Accepted(second) = fx.scheduler.try_run(2, &cancel).await else {
        panic!("second cycle skipped");
    };

    assert_eq!(
        second.save,
        Some(SaveSummary {
            saved: 0,
            duplicates: 2
        })
    );
    assert_eq!(fx.store.count_videos().await.expect("count"), 2);
}

#[tokio::test]
async fn concurrent_triggers_run_exactly_one_cycle() {
    let fx = fixture(FakeHarvester::holding(&["ABC-001"]));
    let cancel = CancellationToken::new();

    let first = {
        let scheduler = fx.scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.try_run(2, &cancel).await })
    };
    fx.harvester.wait_started().await;

    assert!(fx.scheduler.is_running());
    assert_eq!(fx.scheduler.state(), SchedulerState::Running);
    assert_eq!(fx.scheduler.try_run(2, &cancel).await, TriggerOutcome::Skipped);
    assert_eq!(fx.scheduler.try_run(2, &cancel).await, TriggerOutcome::Skipped);

    fx.harvester.release();
    let outcome = first.await.expect("join");

    assert!(matches!(outcome, TriggerOutcome::Accepted(_)));
    assert_eq!(fx.harvester.calls(), 1);
    assert_eq!(fx.harvester.max_in_flight(), 1);
    assert_eq!(fx.scheduler.state(), SchedulerState::Idle);
}

#[tokio::test]
async fn manual_harvest_shares_the_gate() {
    let fx = fixture(FakeHarvester::holding(&["ABC-001", "ABC-002", "ABC-003"]));
    let cancel = CancellationToken::new();

    let cycle = {
        let scheduler = fx.scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.try_run(2, &cancel).await })
    };
    fx.harvester.wait_started().await;

    let request = HarvestRequest::Actor {
        name: "Someone".to_string(),
        limit: 2,
    };
    assert!(fx
        .scheduler
        .spawn_harvest(request.clone(), cancel.clone())
        .is_none());

    fx.harvester.release();
    cycle.await.expect("join");

    let report = fx
        .scheduler
        .spawn_harvest(request.clone(), cancel.clone())
        .expect("gate free")
        .await
        .expect("join")
        .expect("harvest");

    assert_eq!(report.request, request);
    assert_eq!((report.found, report.saved, report.duplicates), (2, 0, 2));
    assert_eq!(fx.harvester.calls(), 2);
    assert_eq!(fx.harvester.max_in_flight(), 1);
}

#[tokio::test]
async fn manual_harvest_leaves_delivery_to_the_next_cycle() {
    let fx = fixture(FakeHarvester::returning(&["ABC-001"]));
    fx.store
        .upsert_subscription(NewSubscription::new(1, "private", RuleKind::All, ""))
        .await
        .expect("subscribe");

    let report = fx
        .scheduler
        .spawn_harvest(
            HarvestRequest::Code {
                code: "ABC-001".to_string(),
            },
            CancellationToken::new(),
        )
        .expect("gate free")
        .await
        .expect("join")
        .expect("harvest");

    assert_eq!(report.saved, 1);
    assert!(fx.transport.sent().is_empty());
    assert_eq!(fx.store.undelivered_videos().await.expect("list").len(), 1);
    assert!(!fx.scheduler.is_running());
}

#[tokio::test]
async fn cancelled_manual_harvest_keeps_what_it_collected() {
    let fx = fixture(FakeHarvester::holding(&["ABC-001", "ABC-002", "ABC-003"]));
    fx.harvester.keep_on_cancel(2);
    let cancel = CancellationToken::new();
    let request = HarvestRequest::Keyword {
        keyword: "abc".to_string(),
        limit: 20,
    };

    let handle = fx
        .scheduler
        .spawn_harvest(request.clone(), cancel.clone())
        .expect("gate free");
    fx.harvester.wait_started().await;
    cancel.cancel();

    let err = handle.await.expect("join").expect_err("cancelled");
    match err {
        ManualHarvestError::Cancelled(report) => assert_eq!(
            report,
            HarvestReport {
                request,
                found: 2,
                invalid: 0,
                saved: 2,
                duplicates: 0,
            }
        ),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(fx.store.count_videos().await.expect("count"), 2);
    assert!(!fx.scheduler.is_running());
}

#[tokio::test]
async fn failed_save_skips_delivery() {
    let fx = fixture(FakeHarvester::returning(&["ABC-001"]));
    fx.store.set_unavailable(true);

    let outcome = fx.scheduler.try_run(2, &CancellationToken::new()).await;

    assert_eq!(
        outcome,
        TriggerOutcome::Accepted(CycleReport {
            found: 1,
            ..CycleReport::default()
        })
    );
    assert!(fx.transport.sent().is_empty());
}

#[tokio::test]
async fn cancelled_cycle_skips_delivery() {
    let fx = fixture(FakeHarvester::holding(&["ABC-001"]));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let TriggerOutcome::Accepted(report) = fx.scheduler.try_run(2, &cancel).await else {
        panic!("cycle skipped");
    };

    assert!(report.cancelled);
    assert_eq!(report.delivery, None);
    assert!(!fx.scheduler.is_running());
}

#[tokio::test(start_paused = true)]
async fn timer_runs_after_the_initial_delay_then_every_interval() {
    let fx = fixture(FakeHarvester::returning(&["ABC-001"]));
    let cancel = CancellationToken::new();
    fx.scheduler.start(&cancel);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(fx.harvester.calls(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fx.harvester.calls(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(fx.harvester.calls(), 2);

    fx.scheduler.stop().await;
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(fx.harvester.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_during_the_initial_delay_runs_nothing() {
    let fx = fixture(FakeHarvester::returning(&["ABC-001"]));
    fx.scheduler.start(&CancellationToken::new());

    tokio::time::sleep(Duration::from_secs(1)).await;
    fx.scheduler.stop().await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(fx.harvester.calls(), 0);
    assert_eq!(fx.scheduler.state(), SchedulerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn shutdown_token_ends_the_loop() {
    let fx = fixture(FakeHarvester::returning(&["ABC-001"]));
    let cancel = CancellationToken::new();
    fx.scheduler.start(&cancel);

    tokio::time::sleep(Duration::from_secs(6)).await;
    cancel.cancel();
    tokio::time::sleep(Duration::from_secs(600)).await;

    assert_eq!(fx.harvester.calls(), 1);
    fx.scheduler.stop().await;
}
