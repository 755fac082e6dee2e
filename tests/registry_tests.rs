use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use render_farm::config::FarmConfig;
use render_farm::error::FarmError;
use render_farm::farm::protocol::{
    AddJobRequest, HeartbeatRequest, JobOutcome, JobProgress, NodeState, RegisterRequest,
};
use render_farm::farm::FarmRegistry;
use render_farm::render::RenderSettings;
use render_farm::scheduler::{JobId, JobStatus, NodeId};

fn registry() -> Arc<FarmRegistry> {
    Arc::new(FarmRegistry::new(&FarmConfig::default()))
}

async fn register(reg: &FarmRegistry, host: &str, capacity: usize) -> NodeId {
    reg.register(
        RegisterRequest {
            hostname: host.to_string(),
            port: 0,
            capacity,
        },
        host,
    )
    .await
    .node_id
}

async fn add(reg: &FarmRegistry, name: &str) -> JobId {
    reg.add_job(AddJobRequest {
        job_id: None,
        project: PathBuf::from(format!("/share/{}.moho", name)),
        settings: RenderSettings::default(),
        bundled: false,
        pinned_to: None,
    })
    .await
    .unwrap()
}

async fn heartbeat(reg: &FarmRegistry, node: &NodeId, jobs: &[JobId]) -> Vec<JobId> {
    reg.heartbeat(HeartbeatRequest {
        node_id: node.clone(),
        jobs: jobs
            .iter()
            .map(|id| JobProgress {
                job_id: *id,
                progress: 0.25,
            })
            .collect(),
    })
    .await
    .unwrap()
    .cancel_jobs
}

#[tokio::test]
async fn test_concurrent_get_job_never_double_assigns() {
    let reg = registry();
    let mut nodes = Vec::new();
    for i in 0..8 {
        nodes.push(register(&reg, &format!("10.0.0.{}", i + 1), 4).await);
    }
    for i in 0..20 {
        add(&reg, &format!("shot{}", i)).await;
    }

    let mut tasks = Vec::new();
    for node in nodes {
        let reg = Arc::clone(&reg);
        tasks.push(tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(job) = reg.get_job(&node).await.unwrap() {
                got.push(job.id);
            }
            got
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        let got = task.await.unwrap();
        assert!(got.len() <= 4);
        all.extend(got);
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(unique.len(), all.len(), "a job was handed out twice");
    assert_eq!(all.len(), 20);
    assert_eq!(reg.queue().await.pending.len(), 0);
}

#[tokio::test]
async fn test_full_lifecycle_updates_node_counters() {
    let reg = registry();
    let node = register(&reg, "10.0.0.1", 1).await;
    let ok = add(&reg, "ok").await;
    let bad = add(&reg, "bad").await;

    let job = reg.get_job(&node).await.unwrap().unwrap();
    assert_eq!(job.id, ok);
    assert_eq!(job.status, JobStatus::Reserved);
    // At capacity until the first job ends.
    assert!(reg.get_job(&node).await.unwrap().is_none());

    heartbeat(&reg, &node, &[ok]).await;
    assert_eq!(reg.get(&ok).await.unwrap().status, JobStatus::Rendering);
    assert_eq!(reg.get(&ok).await.unwrap().progress, 0.25);
    assert!(reg.job_complete(&node, &ok, JobOutcome::Completed).await.unwrap());

    let job = reg.get_job(&node).await.unwrap().unwrap();
    assert_eq!(job.id, bad);
    let outcome = JobOutcome::Failed {
        error: "Renderer exited with code Some(1)".to_string(),
    };
    assert!(reg.job_complete(&node, &bad, outcome).await.unwrap());

    let status = reg.status().await;
    assert_eq!(status.service, "render-farm");
    let info = &status.nodes[0];
    assert_eq!(info.jobs_completed, 1);
    assert_eq!(info.jobs_failed, 1);
    assert_eq!(info.state, NodeState::Online);
    let failed = reg.get(&bad).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.unwrap().contains("code Some(1)"));

    reg.retry(&bad).await.unwrap();
    let retried = reg.get(&bad).await.unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert_eq!(retried.retry_count, 1);
    assert!(retried.assigned_node.is_none());
}

#[tokio::test]
async fn test_silent_node_goes_offline_and_loses_its_jobs() {
    let reg = registry();
    let dead = register(&reg, "10.0.0.1", 2).await;
    let job = add(&reg, "shot").await;

    reg.get_job(&dead).await.unwrap().unwrap();
    heartbeat(&reg, &dead, &[job]).await;

    let report = reg.sweep_at(Instant::now() + Duration::from_secs(31)).await;
    assert_eq!(report.offline, vec![dead.clone()]);
    assert_eq!(report.released, vec![job]);
    let released = reg.get(&job).await.unwrap();
    assert_eq!(released.status, JobStatus::Pending);
    assert!(released.assigned_node.is_none());
    assert_eq!(reg.status().await.nodes[0].state, NodeState::Offline);

    // The offline node is told so and must register again.
    assert!(matches!(
        reg.heartbeat(HeartbeatRequest {
            node_id: dead.clone(),
            jobs: vec![],
        })
        .await,
        Err(FarmError::NodeOffline(_))
    ));
    assert!(matches!(
        reg.get_job(&dead).await,
        Err(FarmError::NodeOffline(_))
    ));

    let other = register(&reg, "10.0.0.2", 2).await;
    let retaken = reg.get_job(&other).await.unwrap().unwrap();
    assert_eq!(retaken.id, job);
    assert_eq!(retaken.assigned_node, Some(other));

    // The lost node's late report changes nothing.
    assert!(!reg.job_complete(&dead, &job, JobOutcome::Completed).await.unwrap());
    assert_eq!(reg.get(&job).await.unwrap().status, JobStatus::Reserved);
}

#[tokio::test]
async fn test_node_back_from_offline_is_told_to_drop_lost_jobs() {
    let reg = registry();
    let a = register(&reg, "10.0.0.1", 1).await;
    let job = add(&reg, "shot").await;
    reg.get_job(&a).await.unwrap().unwrap();
    heartbeat(&reg, &a, &[job]).await;

    reg.sweep_at(Instant::now() + Duration::from_secs(31)).await;
    let b = register(&reg, "10.0.0.2", 1).await;
    assert_eq!(reg.get_job(&b).await.unwrap().unwrap().id, job);

    // Node A comes back under a new id, still rendering the job it lost.
    let a_again = register(&reg, "10.0.0.1", 1).await;
    assert_eq!(heartbeat(&reg, &a_again, &[job]).await, vec![job]);

    // B keeps the job and its report is not treated as stale.
    let held = reg.get(&job).await.unwrap();
    assert_eq!(held.assigned_node, Some(b.clone()));
    assert!(heartbeat(&reg, &b, &[job]).await.is_empty());
    assert_eq!(reg.get(&job).await.unwrap().status, JobStatus::Rendering);
    assert!(reg.status().await.nodes.iter().any(|n| n.node_id == a_again && n.current_jobs.is_empty()));
}

#[tokio::test]
async fn test_released_job_still_pending_returns_to_its_renderer() {
    let reg = registry();
    let a = register(&reg, "10.0.0.1", 1).await;
    let job = add(&reg, "shot").await;
    reg.get_job(&a).await.unwrap().unwrap();

    // Re-registration released the reservation and nobody took it since.
    let a_again = register(&reg, "10.0.0.1", 1).await;
    assert_eq!(reg.get(&job).await.unwrap().status, JobStatus::Pending);
    assert!(heartbeat(&reg, &a_again, &[job]).await.is_empty());

    let resumed = reg.get(&job).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Rendering);
    assert_eq!(resumed.assigned_node, Some(a_again.clone()));
    assert!(reg.job_complete(&a_again, &job, JobOutcome::Completed).await.unwrap());
}

#[tokio::test]
async fn test_lost_job_finished_elsewhere_or_removed_is_cancelled() {
    let reg = registry();
    let a = register(&reg, "10.0.0.1", 1).await;
    let b = register(&reg, "10.0.0.2", 1).await;
    let job = add(&reg, "shot").await;
    reg.get_job(&b).await.unwrap().unwrap();
    reg.job_complete(&b, &job, JobOutcome::Completed).await.unwrap();

    assert_eq!(heartbeat(&reg, &a, &[job]).await, vec![job]);
    reg.remove(&job).await.unwrap();
    assert_eq!(heartbeat(&reg, &a, &[job]).await, vec![job]);
    assert_eq!(reg.status().await.nodes[0].jobs_completed, 0);
}

#[tokio::test]
async fn test_status_reads_alongside_reservations() {
    let reg = registry();
    let mut nodes = Vec::new();
    for i in 0..4 {
        nodes.push(register(&reg, &format!("10.0.1.{}", i + 1), 2).await);
    }
    for i in 0..8 {
        add(&reg, &format!("shot{}", i)).await;
    }

    let mut tasks = Vec::new();
    for node in nodes {
        let reg = Arc::clone(&reg);
        tasks.push(tokio::spawn(async move {
            let mut got = 0;
            while reg.get_job(&node).await.unwrap().is_some() {
                got += 1;
            }
            got
        }));
    }
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move {
                for _ in 0..20 {
                    let status = reg.status().await;
                    assert_eq!(status.pending + status.active, 8);
                    let queue = reg.queue().await;
                    assert_eq!(queue.pending.len() + queue.active.len(), 8);
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    let mut total = 0;
    for task in tasks {
        total += task.await.unwrap();
    }
    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(total, 8);
    assert_eq!(reg.status().await.active, 8);
}

#[tokio::test]
async fn test_reregistration_replaces_old_record() {
    let reg = registry();
    let first = register(&reg, "10.0.0.1", 1).await;
    let job = add(&reg, "shot").await;
    reg.get_job(&first).await.unwrap().unwrap();

    let second = register(&reg, "10.0.0.1", 1).await;
    assert_ne!(first, second);
    assert_eq!(reg.status().await.nodes.len(), 1);
    assert_eq!(reg.get(&job).await.unwrap().status, JobStatus::Pending);
    assert!(matches!(
        reg.get_job(&first).await,
        Err(FarmError::NodeNotFound(_))
    ));
}

#[tokio::test]
async fn test_cancel_of_job_on_lost_node_ends_cancelled() {
    let reg = registry();
    let node = register(&reg, "10.0.0.1", 1).await;
    let job = add(&reg, "shot").await;
    reg.get_job(&node).await.unwrap().unwrap();
    heartbeat(&reg, &node, &[job]).await;

    reg.request_cancel(&job).await.unwrap();
    reg.sweep_at(Instant::now() + Duration::from_secs(60)).await;
    assert_eq!(reg.get(&job).await.unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_reaches_node_through_heartbeat() {
    let reg = registry();
    let node = register(&reg, "10.0.0.1", 1).await;
    let job = add(&reg, "shot").await;
    reg.get_job(&node).await.unwrap().unwrap();

    assert!(heartbeat(&reg, &node, &[job]).await.is_empty());
    reg.request_cancel(&job).await.unwrap();
    assert_eq!(heartbeat(&reg, &node, &[job]).await, vec![job]);

    assert!(reg.job_complete(&node, &job, JobOutcome::Cancelled).await.unwrap());
    assert_eq!(reg.get(&job).await.unwrap().status, JobStatus::Cancelled);
    assert!(heartbeat(&reg, &node, &[]).await.is_empty());
}

#[tokio::test]
async fn test_assign_pins_and_unpins() {
    let reg = registry();
    let a = register(&reg, "10.0.0.1", 1).await;
    let b = register(&reg, "10.0.0.2", 1).await;
    let job = add(&reg, "shot").await;

    reg.assign(&job, Some(b.clone())).await.unwrap();
    assert!(reg.get_job(&a).await.unwrap().is_none());

    reg.assign(&job, None).await.unwrap();
    assert_eq!(reg.get_job(&a).await.unwrap().unwrap().id, job);

    // Only pending jobs can be pinned.
    assert!(matches!(
        reg.assign(&job, Some(b)).await,
        Err(FarmError::InvalidState { .. })
    ));
    assert!(matches!(
        reg.assign(&job, Some(NodeId("nobody".to_string()))).await,
        Err(FarmError::NodeNotFound(_))
    ));
}

#[tokio::test]
async fn test_add_job_validation() {
    let reg = registry();
    let bad_settings = AddJobRequest {
        job_id: None,
        project: PathBuf::from("/share/a.moho"),
        settings: RenderSettings {
            depth: Some(16),
            ..Default::default()
        },
        bundled: false,
        pinned_to: None,
    };
    assert!(matches!(
        reg.add_job(bad_settings).await,
        Err(FarmError::Validation(_))
    ));

    let id = JobId::new();
    let req = AddJobRequest {
        job_id: Some(id),
        project: PathBuf::from("/share/a.moho"),
        settings: RenderSettings::default(),
        bundled: false,
        pinned_to: None,
    };
    assert_eq!(reg.add_job(req.clone()).await.unwrap(), id);
    assert!(matches!(
        reg.add_job(req).await,
        Err(FarmError::DuplicateJob(_))
    ));
}

#[tokio::test]
async fn test_unknown_node_is_rejected() {
    let reg = registry();
    let ghost = NodeId("10.9.9.9:0-deadbeef".to_string());
    assert!(matches!(
        reg.get_job(&ghost).await,
        Err(FarmError::NodeNotFound(_))
    ));
    assert!(matches!(
        reg.heartbeat(HeartbeatRequest {
            node_id: ghost,
            jobs: vec![],
        })
        .await,
        Err(FarmError::NodeNotFound(_))
    ));
}
