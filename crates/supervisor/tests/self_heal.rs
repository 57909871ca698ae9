mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use jobmesh_core::{InstanceId, JobScope, ManualClock, RoleKey};
use jobmesh_lease::{
    HeartbeatStore, InMemoryStore, JobStatus, LeaseStore, NewJob, WorkerCounters,
    WorkerHeartbeat, WorkerStatus,
};
use jobmesh_supervisor::{
    RestartPolicy, RoleError, RoleRegistry, RoleSpec, StaticRoleSource, Supervisor,
    SupervisorConfig,
};
use jobmesh_worker::{JobContext, JobError, JobHandler, RuntimeState, WorkerConfig, handler_fn};

use common::{LiveCount, eventually};

fn echo(_: &RoleSpec) -> Result<Arc<dyn JobHandler>, RoleError> {
    Ok(Arc::new(handler_fn(|ctx: JobContext| async move {
        Ok::<_, JobError>(json!({ "echo": ctx.payload }))
    })))
}

fn registry() -> RoleRegistry {
    let mut registry = RoleRegistry::new();
    registry.register("event-process", echo).register("csv-process", echo);
    registry
}

fn config() -> SupervisorConfig {
    jobmesh_observability::init_with_filter("info");
    SupervisorConfig::default()
        .with_monitor_interval(Duration::from_secs(60))
        .with_restart(RestartPolicy::fixed(Duration::from_secs(5)))
        .with_worker_defaults(
            WorkerConfig::default()
                .with_idle_interval(Duration::from_secs(1))
                .with_lease_timeout(Duration::from_secs(60)),
        )
}

fn instance_of(supervisor: &Supervisor<InMemoryStore>, key: &RoleKey) -> Option<InstanceId> {
    supervisor
        .tracked_roles()
        .into_iter()
        .find(|r| &r.key == key)
        .map(|r| r.instance_id)
}

#[tokio::test(start_paused = true)]
async fn terminated_role_comes_back_under_a_new_instance() {
    let store = InMemoryStore::arc();
    let spec = RoleSpec::new("event-process", None);
    let source = Arc::new(StaticRoleSource::new(vec![spec.clone()]));
    let supervisor = Supervisor::new(store.clone(), registry(), source, config()).unwrap();

    supervisor.start().await;
    let first = instance_of(&supervisor, &spec.key).expect("role tracked after start");

    let terminated_at = Instant::now();
    assert!(supervisor.terminate_role(&spec.key));

    eventually(|| {
        let supervisor = supervisor.clone();
        let key = spec.key.clone();
        async move { instance_of(&supervisor, &key).is_some_and(|id| id != first) }
    })
    .await;

    assert!(terminated_at.elapsed() <= Duration::from_secs(5 + 60));

    let second = instance_of(&supervisor, &spec.key).unwrap();
    let handle = supervisor.role_handle(&spec.key).unwrap();
    assert_eq!(handle.instance_id(), second);

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn terminating_a_busy_role_never_runs_its_job_twice() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
    let job = store.enqueue(NewJob::new(json!({ "row": 1 }))).await.unwrap();

    let live = LiveCount::default();
    let mut registry = RoleRegistry::new();
    {
        let live = live.clone();
        registry.register("csv-process", move |_spec: &RoleSpec| {
            let live = live.clone();
            let handler: Arc<dyn JobHandler> = Arc::new(handler_fn(move |ctx: JobContext| {
                let live = live.clone();
                async move {
                    let _live = live.enter();
                    if ctx.attempts < 2 {
                        tokio::time::sleep(Duration::from_secs(1_000)).await;
                    }
                    Ok::<_, JobError>(json!({ "attempt": ctx.attempts }))
                }
            }));
            Ok(handler)
        });
    }

    let spec = RoleSpec::new("csv-process", None);
    let source = Arc::new(StaticRoleSource::new(vec![spec.clone()]));
    let supervisor = Supervisor::new(store.clone(), registry, source, config()).unwrap();
    supervisor.start().await;

    eventually(|| {
        let live = live.clone();
        async move { live.live() == 1 }
    })
    .await;
    let first = instance_of(&supervisor, &spec.key).unwrap();

    assert!(supervisor.terminate_role(&spec.key));
    eventually(|| {
        let supervisor = supervisor.clone();
        let key = spec.key.clone();
        async move { instance_of(&supervisor, &key).is_some_and(|id| id != first) }
    })
    .await;

    // The old handler went down with its runtime; its lease is left to expire.
    assert_eq!(live.live(), 0);
    let held = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(held.status, JobStatus::Processing);
    assert_eq!(held.claimed_by, Some(first));

    clock.advance(Duration::from_secs(61));
    eventually(|| {
        let store = store.clone();
        async move {
            store.get(job.id).await.unwrap().unwrap().status == JobStatus::Completed
        }
    })
    .await;

    let done = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(done.attempts, 2);
    assert_eq!(done.result, Some(json!({ "attempt": 2 })));
    assert_eq!(live.peak(), 1);

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn quick_supervisor_restart_does_not_count_as_a_crash() {
    let store = InMemoryStore::arc();
    let spec = RoleSpec::new("event-process", None);
    let source = Arc::new(StaticRoleSource::new(vec![spec.clone()]));
    let config = config()
        .with_monitor_interval(Duration::from_secs(3_600))
        .with_restart(RestartPolicy::exponential(
            Duration::from_secs(5),
            Duration::from_secs(60),
        ));
    let supervisor = Supervisor::new(store, registry(), source, config).unwrap();

    supervisor.start().await;
    supervisor.stop().await;
    supervisor.start().await;
    let current = instance_of(&supervisor, &spec.key).unwrap();

    // The first generation exits while the supervisor is running again.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(instance_of(&supervisor, &spec.key), Some(current));

    let terminated_at = Instant::now();
    assert!(supervisor.terminate_role(&spec.key));
    eventually(|| {
        let supervisor = supervisor.clone();
        let key = spec.key.clone();
        async move { instance_of(&supervisor, &key).is_some_and(|id| id != current) }
    })
    .await;

    // First failure of the streak: base delay, not the doubled one.
    assert!(terminated_at.elapsed() < Duration::from_secs(10));

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn startup_faults_are_retried_after_the_restart_delay() {
    let store = InMemoryStore::arc();
    let attempts = Arc::new(AtomicUsize::new(0));

    let mut registry = RoleRegistry::new();
    {
        let attempts = attempts.clone();
        registry.register("jira-fetch", move |spec: &RoleSpec| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(RoleError::Construction("api token not loaded".into()));
            }
            echo(spec)
        });
    }

    let spec = RoleSpec::new("jira-fetch", None);
    let source = Arc::new(StaticRoleSource::new(vec![spec.clone()]));
    let config = config()
        .with_monitor_interval(Duration::from_secs(3_600))
        .with_restart(RestartPolicy::fixed(Duration::from_secs(10)));
    let supervisor = Supervisor::new(store, registry, source, config).unwrap();

    let started = Instant::now();
    supervisor.start().await;
    assert!(supervisor.tracked_roles().is_empty());

    eventually(|| {
        let supervisor = supervisor.clone();
        let key = spec.key.clone();
        async move { instance_of(&supervisor, &key).is_some() }
    })
    .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_secs(20));

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_marks_roles_stopped_and_forgets_them() {
    let store = InMemoryStore::arc();
    let roles = vec![
        RoleSpec::new("event-process", None),
        RoleSpec::new("csv-process", Some(JobScope::from("batch-7"))).with_max_concurrency(4),
    ];
    let source = Arc::new(StaticRoleSource::new(roles.clone()));
    let supervisor = Supervisor::new(store.clone(), registry(), source, config()).unwrap();

    supervisor.start().await;
    assert_eq!(supervisor.tracked_roles().len(), 2);

    for spec in &roles {
        let handle = supervisor.role_handle(&spec.key).unwrap();
        handle.wait_for_state(RuntimeState::Idle).await;
    }

    supervisor.stop().await;
    assert!(!supervisor.is_running());
    assert!(supervisor.tracked_roles().is_empty());

    eventually(|| {
        let store = store.clone();
        async move {
            let workers = store.list_workers(None).await.unwrap();
            workers.len() == 2 && workers.iter().all(|w| w.status == WorkerStatus::Stopped)
        }
    })
    .await;

    let scoped = store
        .list_workers(Some(&RoleKey::from("csv-process:batch-7")))
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);

    // Nothing comes back once stopped.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(supervisor.tracked_roles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconcile_restarts_missing_roles_and_cleans_up() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));

    // A crashed process left a lease and a registration behind.
    let ghost = InstanceId::new();
    let job = store.enqueue(NewJob::new(json!({ "row": 1 }))).await.unwrap();
    store
        .claim_next(ghost, None, Duration::from_secs(60))
        .await
        .unwrap()
        .expect("ghost claims the job");
    store
        .upsert_heartbeat(&WorkerHeartbeat {
            instance_id: ghost,
            role: RoleKey::from("event-process"),
            status: WorkerStatus::Processing,
            counters: WorkerCounters::default(),
        })
        .await
        .unwrap();
    clock.advance(Duration::from_secs(20 * 60));

    // Scoped roles never touch the ghost's unscoped job.
    let scope = JobScope::from("alpha");
    let running = RoleSpec::new("event-process", Some(scope.clone()));
    let added = RoleSpec::new("csv-process", Some(scope));

    let source = Arc::new(StaticRoleSource::new(vec![running.clone()]));
    let config = config()
        .with_monitor_interval(Duration::from_secs(3_600))
        .with_global_lease_timeout(Duration::from_secs(5 * 60))
        .with_worker_stale_after(Duration::from_secs(15 * 60));
    let supervisor = Supervisor::new(store.clone(), registry(), source.clone(), config).unwrap();

    supervisor.start().await;
    source.set_roles(vec![added.clone()]);

    let report = supervisor.reconcile().await;
    assert_eq!(report.restarted, vec![added.key.clone()]);
    assert_eq!(report.unexpected, vec![running.key.clone()]);
    assert_eq!(report.expired_leases, 1);
    assert_eq!(report.removed_workers, 1);

    let job = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.claimed_by, None);
    assert!(store.get_worker(ghost).await.unwrap().is_none());

    // Roles no longer expected keep running.
    assert_eq!(supervisor.tracked_roles().len(), 2);

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn start_is_idempotent_and_duplicate_roles_are_ignored() {
    let store = InMemoryStore::arc();
    let spec = RoleSpec::new("event-process", None);
    let source = Arc::new(StaticRoleSource::new(vec![spec.clone()]));
    let supervisor = Supervisor::new(store, registry(), source, config()).unwrap();

    supervisor.start().await;
    let first = instance_of(&supervisor, &spec.key).unwrap();

    supervisor.start().await;
    assert!(!supervisor.start_role(spec.clone()));
    assert_eq!(supervisor.tracked_roles().len(), 1);
    assert_eq!(instance_of(&supervisor, &spec.key), Some(first));

    supervisor.stop().await;
    assert!(!supervisor.start_role(spec));
}
