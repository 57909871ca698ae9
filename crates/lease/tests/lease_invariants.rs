use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;

use jobmesh_core::{InstanceId, JobScope, ManualClock};
use jobmesh_lease::{InMemoryStore, JobStatus, LeaseStore, NewJob};

const LEASE: Duration = Duration::from_secs(30);

fn store_with_clock() -> (Arc<InMemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
    (store, clock)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_never_share_a_job() {
    let store = InMemoryStore::arc();
    for i in 0..50 {
        store.enqueue(NewJob::new(json!({ "row": i }))).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let me = InstanceId::new();
            let mut mine = Vec::new();
            while let Some(job) = store.claim_next(me, None, LEASE).await.unwrap() {
                mine.push(job.id);
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {id} was claimed twice");
        }
    }
    assert_eq!(seen.len(), 50);
}

#[tokio::test]
async fn expired_lease_is_reclaimed_and_old_holder_loses_writes() {
    let (store, clock) = store_with_clock();
    let job = store.enqueue(NewJob::new(json!({"file": "a.csv"}))).await.unwrap();

    let crashed = InstanceId::new();
    let survivor = InstanceId::new();

    let claimed = store.claim_next(crashed, None, LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    assert!(store.claim_next(survivor, None, LEASE).await.unwrap().is_none());

    clock.advance(LEASE + Duration::from_secs(1));

    let reclaimed = store.claim_next(survivor, None, LEASE).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.claimed_by, Some(survivor));
    assert_eq!(reclaimed.attempts, 2);

    assert!(!store.renew(job.id, crashed, LEASE).await.unwrap());
    assert!(!store.complete(job.id, crashed, json!("late")).await.unwrap());
    assert!(store.complete(job.id, survivor, json!("done")).await.unwrap());

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.result, Some(json!("done")));
}

#[tokio::test]
async fn terminal_state_is_written_once() {
    let (store, _clock) = store_with_clock();
    let job = store.enqueue(NewJob::new(json!({}))).await.unwrap();
    let me = InstanceId::new();
    store.claim_next(me, None, LEASE).await.unwrap().unwrap();

    assert!(store.complete(job.id, me, json!(1)).await.unwrap());
    assert!(!store.complete(job.id, me, json!(2)).await.unwrap());
    assert!(!store.fail(job.id, me, "too late").await.unwrap());

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.result, Some(json!(1)));
    assert!(stored.error.is_none());
}

#[tokio::test]
async fn renewal_keeps_the_lease_alive_past_the_original_expiry() {
    let (store, clock) = store_with_clock();
    let job = store.enqueue(NewJob::new(json!({}))).await.unwrap();
    let me = InstanceId::new();
    store.claim_next(me, None, LEASE).await.unwrap().unwrap();

    for _ in 0..5 {
        clock.advance(LEASE / 2);
        assert!(store.renew(job.id, me, LEASE).await.unwrap());
    }

    assert!(store.claim_next(InstanceId::new(), None, LEASE).await.unwrap().is_none());
    assert!(store.complete(job.id, me, json!("ok")).await.unwrap());
}

#[tokio::test]
async fn scoped_claims_only_see_their_scope() {
    let (store, _clock) = store_with_clock();
    let batch_a = JobScope::from("batch-a");
    let batch_b = JobScope::from("batch-b");
    store.enqueue(NewJob::new(json!(1)).with_scope(batch_a.clone())).await.unwrap();
    let b = store.enqueue(NewJob::new(json!(2)).with_scope(batch_b.clone())).await.unwrap();

    let me = InstanceId::new();
    let claimed = store.claim_next(me, Some(&batch_b), LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.id, b.id);
    assert!(store.claim_next(me, Some(&batch_b), LEASE).await.unwrap().is_none());

    let stats = store.stats(Some(&batch_a)).await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.processing, 0);
}

#[tokio::test]
async fn global_expiry_only_touches_leases_past_the_grace_period() {
    let (store, clock) = store_with_clock();
    let old = store.enqueue(NewJob::new(json!("old"))).await.unwrap();
    clock.advance(Duration::from_millis(1));
    let fresh = store.enqueue(NewJob::new(json!("fresh"))).await.unwrap();

    let a = InstanceId::new();
    let b = InstanceId::new();
    store.claim_next(a, None, LEASE).await.unwrap().unwrap();
    clock.advance(Duration::from_secs(20));
    store.claim_next(b, None, LEASE).await.unwrap().unwrap();

    // old expired ~40s ago, fresh expired 20s ago.
    clock.advance(Duration::from_secs(50));
    let reset = store.expire_stale_leases(Duration::from_secs(30)).await.unwrap();
    assert_eq!(reset, 1);

    let old = store.get(old.id).await.unwrap().unwrap();
    assert_eq!(old.status, JobStatus::Pending);
    assert!(old.claimed_by.is_none());

    let fresh = store.get(fresh.id).await.unwrap().unwrap();
    assert_eq!(fresh.status, JobStatus::Processing);
    assert_eq!(fresh.claimed_by, Some(b));
}

#[derive(Debug, Clone)]
enum Op {
    Enqueue,
    Claim(usize),
    Renew(usize, usize),
    Complete(usize, usize),
    Fail(usize, usize),
    Release(usize, usize),
    Advance(u64),
    Expire(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Enqueue),
        (0..3usize).prop_map(Op::Claim),
        (0..3usize, 0..8usize).prop_map(|(w, j)| Op::Renew(w, j)),
        (0..3usize, 0..8usize).prop_map(|(w, j)| Op::Complete(w, j)),
        (0..3usize, 0..8usize).prop_map(|(w, j)| Op::Fail(w, j)),
        (0..3usize, 0..8usize).prop_map(|(w, j)| Op::Release(w, j)),
        (1..60u64).prop_map(Op::Advance),
        (0..30u64).prop_map(Op::Expire),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn lease_invariants_hold_for_any_operation_sequence(ops in proptest::collection::vec(op(), 1..60)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async move {
            let (store, clock) = store_with_clock();
            let workers = [InstanceId::new(), InstanceId::new(), InstanceId::new()];
            let mut jobs = Vec::new();
            let mut finished = HashSet::new();

            for op in ops {
                match op {
                    Op::Enqueue => {
                        let job = store.enqueue(NewJob::new(json!(jobs.len()))).await.unwrap();
                        jobs.push(job.id);
                    }
                    Op::Claim(w) => {
                        if let Some(job) = store.claim_next(workers[w], None, LEASE).await.unwrap() {
                            assert!(!finished.contains(&job.id), "terminal job handed out again");
                            assert_eq!(job.claimed_by, Some(workers[w]));
                        }
                    }
                    Op::Renew(w, j) | Op::Release(w, j) | Op::Complete(w, j) | Op::Fail(w, j)
                        if j >= jobs.len() =>
                    {
                        let _ = w;
                    }
                    Op::Renew(w, j) => {
                        let before = store.get(jobs[j]).await.unwrap().unwrap();
                        let held = before.is_held_by(workers[w], clock_now(&clock));
                        assert_eq!(store.renew(jobs[j], workers[w], LEASE).await.unwrap(), held);
                    }
                    Op::Complete(w, j) => {
                        let before = store.get(jobs[j]).await.unwrap().unwrap();
                        let held = before.is_held_by(workers[w], clock_now(&clock));
                        let wrote = store.complete(jobs[j], workers[w], json!("ok")).await.unwrap();
                        assert_eq!(wrote, held);
                        if wrote {
                            assert!(finished.insert(jobs[j]));
                        }
                    }
                    Op::Fail(w, j) => {
                        let before = store.get(jobs[j]).await.unwrap().unwrap();
                        let held = before.is_held_by(workers[w], clock_now(&clock));
                        let wrote = store.fail(jobs[j], workers[w], "boom").await.unwrap();
                        assert_eq!(wrote, held);
                        if wrote {
                            assert!(finished.insert(jobs[j]));
                        }
                    }
                    Op::Release(w, j) => {
                        let before = store.get(jobs[j]).await.unwrap().unwrap();
                        let held = before.is_held_by(workers[w], clock_now(&clock));
                        assert_eq!(store.release(jobs[j], workers[w]).await.unwrap(), held);
                    }
                    Op::Advance(secs) => clock.advance(Duration::from_secs(secs)),
                    Op::Expire(secs) => {
                        store.expire_stale_leases(Duration::from_secs(secs)).await.unwrap();
                    }
                }

                for id in &jobs {
                    let job = store.get(*id).await.unwrap().unwrap();
                    match job.status {
                        JobStatus::Pending => {
                            assert!(job.claimed_by.is_none());
                            assert!(job.lease_expiry.is_none());
                        }
                        JobStatus::Processing => {
                            assert!(job.claimed_by.is_some());
                            assert!(job.lease_expiry.is_some());
                        }
                        JobStatus::Completed => {
                            assert!(finished.contains(id));
                            assert!(job.result.is_some() && job.error.is_none());
                        }
                        JobStatus::Failed => {
                            assert!(finished.contains(id));
                            assert!(job.error.is_some() && job.result.is_none());
                        }
                    }
                }
            }
        });
    }
}

fn clock_now(clock: &ManualClock) -> chrono::DateTime<chrono::Utc> {
    use jobmesh_core::Clock;
    clock.now()
}
