//! End-to-end sync scenarios: offline rebase with conflict recovery, and
//! the achievement saga reacting to remote edits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use momentum_local::domain::{Aggregate, ProjectStatus};
use momentum_local::event_store::SnapshotStore;
use momentum_local::handlers::{
    CommandDispatcher, CommandMeta, CreateGoalCommand, CreateProjectCommand,
    TransitionProjectStatusCommand,
};
use momentum_local::projection::{ProjectionCacheStore, ProjectionOrdering, ProjectionRuntime};
use momentum_local::saga::{GoalAchievementSaga, ProcessManagerStore, GOAL_ACHIEVEMENT_PM_ID};
use momentum_local::sync::{
    InMemorySyncServer, PullRequest, PullResponse, PushOutcome, PushRequest, SyncTransport,
    TransportError,
};

mod common;

/// Transport wrapper that can serve stale pulls (emulating a pull that
/// raced the server) and counts observed push conflicts.
struct FlakyTransport {
    inner: Arc<InMemorySyncServer>,
    stale_pulls: AtomicUsize,
    conflicts_seen: AtomicUsize,
}

impl FlakyTransport {
    fn new(inner: Arc<InMemorySyncServer>) -> Self {
        Self {
            inner,
            stale_pulls: AtomicUsize::new(0),
            conflicts_seen: AtomicUsize::new(0),
        }
    }

    fn serve_stale_pulls(&self, count: usize) {
        self.stale_pulls.store(count, Ordering::SeqCst);
    }

    fn conflicts_seen(&self) -> usize {
        self.conflicts_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncTransport for FlakyTransport {
    async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError> {
        let stale = self
            .stale_pulls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stale {
            return Ok(PullResponse {
                head: request.since,
                events: Vec::new(),
                has_more: false,
                next_since: None,
            });
        }
        self.inner.pull(request).await
    }

    async fn push(&self, request: PushRequest) -> Result<PushOutcome, TransportError> {
        let outcome = self.inner.push(request).await?;
        if matches!(outcome, PushOutcome::Conflict { .. }) {
            self.conflicts_seen.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }
}

async fn event_rows(db: &momentum_local::LocalDb) -> Vec<(String, String, i64)> {
    sqlx::query_as::<_, (String, String, i64)>(
        "SELECT id, aggregate_id, version FROM events ORDER BY id",
    )
    .fetch_all(db.pool())
    .await
    .unwrap()
}

async fn saga_runtime(
    client: &common::TestClient,
) -> ProjectionRuntime<GoalAchievementSaga> {
    let store = ProcessManagerStore::new(
        GOAL_ACHIEVEMENT_PM_ID,
        client.decoder.clone(),
        ProjectionCacheStore::new(client.db.clone()),
        ProjectionOrdering::EffectiveTotalOrder,
    );
    let saga = GoalAchievementSaga::new(
        client.decoder.clone(),
        store,
        client.goals.clone() as Arc<dyn CommandDispatcher>,
    );

    let runtime = ProjectionRuntime::new(
        client.db.clone(),
        None,
        ProjectionOrdering::EffectiveTotalOrder,
        250,
        saga,
    );

    momentum_local::saga::bootstrap_runtime(&runtime).await.unwrap();
    runtime
}

#[tokio::test]
async fn test_offline_edit_rebases_and_converges() {
    let server = Arc::new(InMemorySyncServer::new());
    let master_key = common::master_key();

    let a_transport = Arc::new(FlakyTransport::new(server.clone()));
    let a = common::client("store-a", a_transport.clone(), master_key.clone()).await;
    let b = common::client("store-b", server.clone(), master_key).await;

    // Both clients in sync at head 1 with one goal.
    a.goals
        .create(
            CreateGoalCommand::new("goal-1", "Run a marathon", "health", "2026-10"),
            CommandMeta::new(),
        )
        .await
        .unwrap();
    a.engine.push_once().await.unwrap();
    b.engine.pull_once(None).await.unwrap();
    assert_eq!(server.head().await, 1);

    // A goes offline and edits twice.
    a.goals
        .rename("goal-1", "A first edit", CommandMeta::new())
        .await
        .unwrap();
    a.goals
        .rename("goal-1", "A second edit", CommandMeta::new())
        .await
        .unwrap();

    // B edits online and pushes first.
    b.goals
        .rename("goal-1", "B online edit", CommandMeta::new())
        .await
        .unwrap();
    b.engine.push_once().await.unwrap();
    assert_eq!(server.head().await, 2);

    // A reconnects; its first pull races the server and comes back stale,
    // so the push runs against the old head and must hit a 409.
    let mut rebase_rx = a.engine.subscribe_rebase();
    a_transport.serve_stale_pulls(1);
    a.engine.push_once().await.unwrap();

    assert!(a_transport.conflicts_seen() >= 1, "a 409 must be observed");
    assert!(rebase_rx.try_recv().is_ok(), "rebase must fire on A");
    assert_eq!(server.head().await, 4);
    assert!(!a.map.has_pending().await.unwrap());

    // The rewrite invalidated A's snapshot for the goal.
    let snapshot = SnapshotStore::new(a.db.clone())
        .get("goal", "goal-1")
        .await
        .unwrap();
    assert!(snapshot.is_none());

    // B pulls and both clients converge on A's latest edit.
    b.engine.pull_once(None).await.unwrap();

    let goal_on_a = a.goal_repository().load("goal-1").await.unwrap().unwrap();
    let goal_on_b = b.goal_repository().load("goal-1").await.unwrap().unwrap();
    assert_eq!(goal_on_a.title(), "A second edit");
    assert_eq!(goal_on_b.title(), "A second edit");
    assert_eq!(goal_on_a.version(), 4);
    assert_eq!(goal_on_b.version(), 4);

    assert_eq!(a.meta.last_pulled_global_seq("store-a").await.unwrap(), 4);
    assert_eq!(b.meta.last_pulled_global_seq("store-b").await.unwrap(), 4);
    assert_eq!(event_rows(&a.db).await, event_rows(&b.db).await);
}

#[tokio::test]
async fn test_remote_project_unachieves_goal() {
    let server = Arc::new(InMemorySyncServer::new());
    let master_key = common::master_key();

    let a = common::client("store-a", server.clone(), master_key.clone()).await;
    let b = common::client("store-b", server.clone(), master_key).await;

    let saga_a = saga_runtime(&a).await;

    // A creates a goal with one linked project and completes it.
    a.goals
        .create(
            CreateGoalCommand::new("goal-1", "Run a marathon", "health", "2026-10"),
            CommandMeta::new(),
        )
        .await
        .unwrap();
    a.projects
        .create(
            CreateProjectCommand::new("proj-1", "Weekly long runs").with_goal("goal-1"),
            CommandMeta::new(),
        )
        .await
        .unwrap();
    a.projects
        .complete("proj-1", CommandMeta::new())
        .await
        .unwrap();

    // The saga sees the completion and achieves the goal.
    saga_a.catch_up().await.unwrap();
    saga_a.catch_up().await.unwrap();

    let goal = a.goal_repository().load("goal-1").await.unwrap().unwrap();
    assert!(goal.is_achieved());
    assert_eq!(goal.version(), 2);

    a.engine.push_once().await.unwrap();

    // B pulls, sees the achieved goal, and links a new in-progress project.
    b.engine.pull_once(None).await.unwrap();
    let goal_on_b = b.goal_repository().load("goal-1").await.unwrap().unwrap();
    assert!(goal_on_b.is_achieved());

    b.projects
        .create(
            CreateProjectCommand::new("proj-2", "Strength training").with_goal("goal-1"),
            CommandMeta::new(),
        )
        .await
        .unwrap();
    b.projects
        .transition_status(
            TransitionProjectStatusCommand {
                project_id: "proj-2".to_string(),
                to: ProjectStatus::InProgress,
            },
            CommandMeta::new(),
        )
        .await
        .unwrap();
    b.engine.push_once().await.unwrap();

    // A pulls; the saga sees an incomplete linked project and unachieves.
    a.engine.pull_once(None).await.unwrap();
    saga_a.catch_up().await.unwrap();
    saga_a.catch_up().await.unwrap();

    let goal = a.goal_repository().load("goal-1").await.unwrap().unwrap();
    assert!(!goal.is_achieved());

    let state = saga_a.processor().await;
    let pm = state.goal_state("goal-1").unwrap().clone();
    drop(state);
    assert_eq!(pm.linked_project_ids.len(), 2);
    assert_eq!(pm.completed_project_ids, vec!["proj-1".to_string()]);

    // Push the unachievement back and converge.
    a.engine.push_once().await.unwrap();
    b.engine.pull_once(None).await.unwrap();

    let goal_on_b = b.goal_repository().load("goal-1").await.unwrap().unwrap();
    assert!(!goal_on_b.is_achieved());
    assert_eq!(event_rows(&a.db).await, event_rows(&b.db).await);
}

#[tokio::test]
async fn test_two_writers_eventually_converge() {
    let server = Arc::new(InMemorySyncServer::new());
    let master_key = common::master_key();

    let a = common::client("store-a", server.clone(), master_key.clone()).await;
    let b = common::client("store-b", server.clone(), master_key).await;

    a.goals
        .create(
            CreateGoalCommand::new("goal-a", "Run a marathon", "health", "2026-10"),
            CommandMeta::new(),
        )
        .await
        .unwrap();
    b.goals
        .create(
            CreateGoalCommand::new("goal-b", "Read twelve books", "learning", "2026-12"),
            CommandMeta::new(),
        )
        .await
        .unwrap();

    // Interleaved sync rounds until both stop editing.
    a.engine.push_once().await.unwrap();
    b.engine.push_once().await.unwrap();
    a.engine.pull_once(None).await.unwrap();
    b.engine.pull_once(None).await.unwrap();

    let head = server.head().await;
    assert_eq!(head, 2);
    assert_eq!(
        a.meta.last_pulled_global_seq("store-a").await.unwrap(),
        head
    );
    assert_eq!(
        b.meta.last_pulled_global_seq("store-b").await.unwrap(),
        head
    );
    assert_eq!(event_rows(&a.db).await, event_rows(&b.db).await);

    assert!(a.goal_repository().load("goal-b").await.unwrap().is_some());
    assert!(b.goal_repository().load("goal-a").await.unwrap().is_some());
}
