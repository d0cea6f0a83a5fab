use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use forgegen_jobs::{
    FamilyToken, Job, JobError, JobState, Rule, Scheduler, SchedulerConfig, TypedJob,
};

const LONG_WAIT: Duration = Duration::from_secs(10);

fn scheduler(name: &str, workers: usize) -> Scheduler {
    forgegen_observability::init_for_tests();
    Scheduler::start(
        SchedulerConfig::default()
            .with_name(name)
            .with_workers(workers)
            .with_poll_interval(Duration::from_millis(5)),
    )
    .expect("scheduler starts")
}

/// Tracks how many bodies are inside a critical section at once.
#[derive(Default)]
struct Overlap {
    active: AtomicUsize,
    max: AtomicUsize,
}

impl Overlap {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[test]
fn conflicting_rules_never_run_concurrently() {
    let scheduler = scheduler("exclusion", 4);
    let overlap = Arc::new(Overlap::default());
    let paths = ["/demo", "/demo/src", "/demo/src-gen", "/demo/src/model"];

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let overlap = Arc::clone(&overlap);
            let rule = Rule::resource(paths[i % paths.len()]);
            scheduler.schedule(
                Job::new(format!("gen-{i}"), move |_| {
                    overlap.enter();
                    thread::sleep(Duration::from_millis(3));
                    overlap.exit();
                    Ok(())
                })
                .with_rule(rule),
            )
        })
        .collect();

    for handle in &handles {
        handle.join(Some(LONG_WAIT)).unwrap();
        assert_eq!(handle.state(), JobState::Succeeded);
    }
    // "/demo/src" and "/demo/src-gen" do not conflict with each other, but both
    // conflict with "/demo", which is in the mix; only sibling pairs may overlap.
    assert!(overlap.max.load(Ordering::SeqCst) <= 2);
    scheduler.shutdown();
}

#[test]
fn identical_keys_are_fully_serialized() {
    let scheduler = scheduler("keys", 4);
    let overlap = Arc::new(Overlap::default());
    let handles: Vec<_> = (0..12)
        .map(|i| {
            let overlap = Arc::clone(&overlap);
            scheduler.schedule(
                Job::new(format!("index-{i}"), move |_| {
                    overlap.enter();
                    thread::sleep(Duration::from_millis(2));
                    overlap.exit();
                    Ok(())
                })
                .with_rule(Rule::multi([Rule::key("index"), Rule::key(format!("unique-{i}"))])),
            )
        })
        .collect();

    for handle in &handles {
        handle.join(Some(LONG_WAIT)).unwrap();
    }
    assert_eq!(overlap.max.load(Ordering::SeqCst), 1);
    scheduler.shutdown();
}

#[test]
fn result_is_computed_once_for_many_concurrent_callers() {
    let scheduler = scheduler("lazy", 2);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let future = scheduler.schedule_with_future(
        Job::new("model", |_| {
            thread::sleep(Duration::from_millis(20));
            Ok(())
        }),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            Ok(vec!["Entity.java".to_string(), "Repository.java".to_string()])
        },
    );

    let seen: Vec<Vec<String>> = thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let future = future.clone();
                scope.spawn(move || {
                    let mut last = Vec::new();
                    for _ in 0..10 {
                        last = future.get_timeout(LONG_WAIT).unwrap();
                    }
                    last
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(seen.iter().all(|value| value == &seen[0]));
    assert_eq!(seen[0].len(), 2);
    scheduler.shutdown();
}

#[test]
fn canceling_before_start_skips_the_body() {
    let scheduler = scheduler("cancel-early", 1);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let gate = scheduler.schedule(Job::new("gate", move |_| {
        release_rx.recv().ok();
        Ok(())
    }));

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let future = scheduler.submit(TypedJob::new("never", move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(1u8)
    }));
    assert_eq!(future.job().state(), JobState::Waiting);

    assert!(future.cancel(true));
    assert!(future.is_cancelled());
    assert!(future.is_done());
    assert_eq!(future.job().state(), JobState::Canceled);

    release_tx.send(()).unwrap();
    gate.join(Some(LONG_WAIT)).unwrap();
    assert!(future.result().unwrap_err().is_canceled());
    assert!(!ran.load(Ordering::SeqCst));
    scheduler.shutdown();
}

#[test]
fn canceling_a_waiting_job_through_the_scheduler_reports_canceled() {
    let scheduler = scheduler("cancel-handle", 1);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let gate = scheduler.schedule(Job::new("gate", move |_| {
        release_rx.recv().ok();
        Ok(())
    }));
    let future = scheduler.submit(TypedJob::new("queued", |_| Ok("value")));

    assert!(scheduler.cancel(future.job()));
    release_tx.send(()).unwrap();
    gate.join(Some(LONG_WAIT)).unwrap();

    let err = future.get().unwrap_err();
    assert!(matches!(err, JobError::Canceled { .. }));
    assert!(future.is_completed_exceptionally());
    scheduler.shutdown();
}

#[test]
fn bodies_that_ignore_cancellation_finish_normally() {
    let scheduler = scheduler("cancel-late", 1);
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let job = scheduler.schedule(Job::new("stubborn", move |_| {
        started_tx.send(()).ok();
        release_rx.recv().ok();
        Ok(())
    }));
    started_rx.recv_timeout(LONG_WAIT).unwrap();

    assert!(scheduler.cancel(&job));
    assert!(job.is_cancel_requested());
    assert_eq!(job.state(), JobState::Running);

    release_tx.send(()).unwrap();
    job.join(Some(LONG_WAIT)).unwrap();
    assert_eq!(job.state(), JobState::Succeeded);
    assert!(!scheduler.cancel(&job));
    scheduler.shutdown();
}

#[test]
fn family_wait_blocks_until_the_slowest_member_finishes() {
    let scheduler = scheduler("family", 3);
    let finished = Arc::new(AtomicUsize::new(0));
    let family = FamilyToken::new("codegen.*");

    for (name, millis) in [("quick", 5u64), ("slow", 150)] {
        let finished = Arc::clone(&finished);
        scheduler.schedule(
            Job::new(name, move |_| {
                thread::sleep(Duration::from_millis(millis));
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .in_family(format!("codegen.{name}")),
        );
    }
    let outsider = scheduler.schedule(
        Job::new("outsider", |ctx| {
            while !ctx.is_canceled() {
                thread::sleep(Duration::from_millis(2));
            }
            Ok(())
        })
        .in_family("validation"),
    );

    let started = Instant::now();
    scheduler.wait_for_family(&family).unwrap();
    let waited = started.elapsed();

    assert_eq!(finished.load(Ordering::SeqCst), 2);
    assert!(waited >= Duration::from_millis(100), "returned after {waited:?}");
    assert!(waited < Duration::from_secs(5), "returned after {waited:?}");
    assert!(scheduler.find(&family).is_empty());
    assert_eq!(outsider.state(), JobState::Running);

    outsider.cancel();
    outsider.join(Some(LONG_WAIT)).unwrap();
    scheduler.shutdown();
}

#[test]
fn family_wait_from_inside_a_member_skips_itself() {
    let scheduler = scheduler("family-inside", 2);
    let sibling_done = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&sibling_done);
    scheduler.schedule(
        Job::new("sibling", move |_| {
            thread::sleep(Duration::from_millis(40));
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .in_family("build"),
    );

    let flag = Arc::clone(&sibling_done);
    let waiter = scheduler.submit(
        TypedJob::new("waiter", move |ctx| {
            let scheduler = ctx.scheduler().ok_or_else(|| anyhow!("no scheduler"))?;
            scheduler.wait_for_family_with(&FamilyToken::new("build"), Some(LONG_WAIT), None)?;
            Ok(flag.load(Ordering::SeqCst))
        })
        .in_family("build"),
    );

    assert!(waiter.get_timeout(LONG_WAIT).unwrap());
    scheduler.shutdown();
}

#[test]
fn family_wait_can_time_out_or_be_abandoned() {
    let scheduler = scheduler("family-bounded", 1);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let member = scheduler.schedule(
        Job::new("blocked", move |_| {
            release_rx.recv().ok();
            Ok(())
        })
        .in_family("index"),
    );
    let family = FamilyToken::new("index");

    let err = scheduler
        .wait_for_family_with(&family, Some(Duration::from_millis(30)), None)
        .unwrap_err();
    assert!(err.is_timed_out());

    let token = forgegen_jobs::CancellationToken::new();
    token.cancel();
    let err = scheduler
        .wait_for_family_with(&family, None, Some(&token))
        .unwrap_err();
    assert!(matches!(err, JobError::WaitAbandoned { .. }));
    assert!(!member.is_cancel_requested());

    release_tx.send(()).unwrap();
    scheduler.wait_for_family(&family).unwrap();
    scheduler.shutdown();
}

#[test]
fn waiting_on_a_job_that_needs_our_rule_fails_fast() {
    let scheduler = scheduler("deadlock", 2);
    let (report_tx, report_rx) = mpsc::channel();

    let holder = scheduler.schedule(
        Job::new("holder", move |ctx| {
            let scheduler = ctx.scheduler().ok_or_else(|| anyhow!("no scheduler"))?;
            let inner = scheduler.submit(
                TypedJob::new("needs-the-rule", |_| Ok(7u32)).with_rule(Rule::resource("/demo/src")),
            );
            let started = Instant::now();
            let outcome = inner.get();
            report_tx.send((outcome, started.elapsed(), inner)).ok();
            Ok(())
        })
        .with_rule(Rule::resource("/demo")),
    );

    let (outcome, elapsed, inner) = report_rx.recv_timeout(LONG_WAIT).unwrap();
    let err = outcome.unwrap_err();
    assert!(err.is_deadlock(), "unexpected error: {err}");
    assert!(elapsed < Duration::from_secs(1));

    holder.join(Some(LONG_WAIT)).unwrap();
    assert_eq!(holder.state(), JobState::Succeeded);
    // Once the holder released the rule, the inner job runs normally.
    assert_eq!(inner.get_timeout(LONG_WAIT).unwrap(), 7);
    scheduler.shutdown();
}

#[test]
fn family_wait_that_needs_our_rule_fails_fast() {
    let scheduler = scheduler("deadlock-family", 2);
    let (report_tx, report_rx) = mpsc::channel();

    scheduler.schedule(
        Job::new("holder", move |ctx| {
            let scheduler = ctx.scheduler().ok_or_else(|| anyhow!("no scheduler"))?;
            scheduler.schedule(
                Job::new("indexer", |_| Ok(()))
                    .with_rule(Rule::key("index"))
                    .in_family("index"),
            );
            report_tx
                .send(scheduler.wait_for_family(&FamilyToken::new("index")))
                .ok();
            Ok(())
        })
        .with_rule(Rule::key("index")),
    );

    let err = report_rx.recv_timeout(LONG_WAIT).unwrap().unwrap_err();
    assert!(err.is_deadlock());
    scheduler.wait_for_family(&FamilyToken::any()).unwrap();
    scheduler.shutdown();
}

#[test]
fn timeout_is_reported_before_the_failure_exists() {
    let scheduler = scheduler("timeouts", 1);
    let future = scheduler.submit(TypedJob::<String>::new("slow-failure", |_| {
        thread::sleep(Duration::from_millis(400));
        Err(anyhow!("template not found"))
    }));

    let started = Instant::now();
    let err = future.get_timeout(Duration::from_millis(100)).unwrap_err();
    assert!(err.is_timed_out());
    assert!(started.elapsed() < Duration::from_millis(390));
    assert!(!future.is_done());

    let err = future.get().unwrap_err();
    assert!(err.is_failed());
    assert!(err.to_string().contains("template not found"));
    assert_eq!(future.job().state(), JobState::Failed);
    scheduler.shutdown();
}
