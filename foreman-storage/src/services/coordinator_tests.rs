#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::memory::MemoryStore;
    use crate::store::{open_store, StoreConfig};
    use chrono::Duration;
    use foreman_core::agent::AgentStatus;
    use foreman_core::message::MessageStatus;
    use serde_json::json;

    struct Harness {
        coordinator: SupervisorCoordinator,
        registry: Arc<AgentRegistry>,
        queue: Arc<MessageQueue>,
        store: Arc<dyn CoordinationStore>,
    }

    async fn setup(config: CoordinationConfig) -> Harness {
        setup_over(Arc::new(MemoryStore::new()), config).await
    }

    async fn setup_over(store: Arc<dyn CoordinationStore>, config: CoordinationConfig) -> Harness {
        let events = EventBus::default();
        let registry = Arc::new(AgentRegistry::new(
            store.clone(),
            config.clone(),
            events.clone(),
        ));
        let queue = Arc::new(MessageQueue::new(
            store.clone(),
            config.clone(),
            events.clone(),
        ));
        let coordinator = SupervisorCoordinator::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
            config,
            events,
        );
        coordinator.start().await.expect("supervisor start");
        Harness {
            coordinator,
            registry,
            queue,
            store,
        }
    }

    async fn enroll_worker(harness: &Harness, id: &str) {
        let agent = Agent::builder()
            .id(id)
            .role(AgentRole::Worker)
            .capability("demo")
            .max_concurrent_tasks(4)
            .build()
            .expect("valid agent");
        harness.registry.register(agent).await.expect("registered");
    }

    fn demo_spec() -> TaskSpec {
        TaskSpec {
            task_type: "research".into(),
            description: "Summarize the nightly failures".into(),
            parameters: json!({"build": 42}),
            required_capabilities: vec!["demo".into()],
            ..Default::default()
        }
    }

    async fn delegate(harness: &Harness, spec: TaskSpec) -> Task {
        harness
            .coordinator
            .assign_task(spec)
            .await
            .expect("assignment settled")
            .expect("an agent qualified")
    }

    async fn current_load(harness: &Harness, agent_id: &str) -> u32 {
        harness
            .registry
            .get(agent_id)
            .await
            .unwrap()
            .unwrap()
            .current_tasks
    }

    /// Pull the worker's pending task request and answer it with `response`
    async fn respond_to_request(harness: &Harness, worker: &str, response: TaskResponse) {
        let inbox = harness.queue.receive(worker, 10).await.unwrap();
        let request = inbox
            .into_iter()
            .find(|m| matches!(m.payload, MessagePayload::TaskRequest(_)))
            .expect("task request delivered");
        let reply = request
            .response_to(worker, MessagePayload::TaskResponse(response))
            .unwrap();
        harness.queue.send(reply).await.unwrap();
        harness
            .queue
            .ack(worker, request.id, AckDisposition::Processed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_task_lifecycle_end_to_end() {
        let harness = setup(CoordinationConfig::default()).await;
        enroll_worker(&harness, "worker-1").await;

        let task = delegate(&harness, demo_spec()).await;
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_agent.as_deref(), Some("worker-1"));
        assert_eq!(current_load(&harness, "worker-1").await, 1);

        respond_to_request(
            &harness,
            "worker-1",
            TaskResponse {
                task_id: task.id,
                status: ReportedStatus::InProgress,
                progress: Some(0.4),
                result: None,
                error_message: None,
                next_steps: None,
            },
        )
        .await;
        assert_eq!(harness.coordinator.process_incoming().await.unwrap(), 1);

        let running = harness.coordinator.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::InProgress);
        assert!((running.progress - 0.4).abs() < f64::EPSILON);

        let done = Message::builder()
            .from("worker-1")
            .to(&harness.coordinator.config.supervisor_id)
            .payload(MessagePayload::TaskResponse(TaskResponse {
                task_id: task.id,
                status: ReportedStatus::Completed,
                progress: Some(1.0),
                result: Some(json!({"summary": "3 flaky tests"})),
                error_message: None,
                next_steps: None,
            }))
            .build()
            .unwrap();
        harness.queue.send(done).await.unwrap();
        assert_eq!(harness.coordinator.process_incoming().await.unwrap(), 1);

        let completed = harness.coordinator.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert_eq!(completed.result, Some(json!({"summary": "3 flaky tests"})));
        assert!((completed.progress - 1.0).abs() < f64::EPSILON);
        assert!(completed.completed_at.is_some());
        assert_eq!(current_load(&harness, "worker-1").await, 0);

        let stats = harness.coordinator.statistics().await.unwrap();
        assert_eq!(stats.backend, "memory");
        assert_eq!(stats.tasks.completed, 1);
    }

    #[tokio::test]
    async fn test_failed_task_is_reassigned_excluding_prior_agent() {
        let harness = setup(CoordinationConfig::default()).await;
        enroll_worker(&harness, "worker-1").await;
        enroll_worker(&harness, "worker-2").await;

        let task = delegate(&harness, demo_spec()).await;
        assert_eq!(task.assigned_agent.as_deref(), Some("worker-1"));

        respond_to_request(
            &harness,
            "worker-1",
            TaskResponse {
                task_id: task.id,
                status: ReportedStatus::Failed,
                progress: None,
                result: None,
                error_message: Some("disk full".into()),
                next_steps: None,
            },
        )
        .await;
        assert_eq!(harness.coordinator.process_incoming().await.unwrap(), 1);

        let failed = harness.coordinator.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.error_message.as_deref().unwrap().contains("disk full"));
        assert_eq!(current_load(&harness, "worker-1").await, 0);

        // The next attempt landed on the other worker
        let retries = harness.coordinator.list_tasks(TaskStatus::Assigned).await.unwrap();
        assert_eq!(retries.len(), 1);
        let retry = &retries[0];
        assert_eq!(retry.retry_of, Some(task.id));
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.assigned_agent.as_deref(), Some("worker-2"));
        assert_eq!(current_load(&harness, "worker-2").await, 1);
    }

    #[tokio::test]
    async fn test_attempt_budget_bounds_reassignment() {
        let mut config = CoordinationConfig::default();
        config.max_task_attempts = 2;
        let harness = setup(config).await;
        enroll_worker(&harness, "worker-1").await;
        enroll_worker(&harness, "worker-2").await;

        let task = delegate(&harness, demo_spec()).await;

        let failure = |id| TaskResponse {
            task_id: id,
            status: ReportedStatus::Failed,
            progress: None,
            result: None,
            error_message: Some("worker crashed".into()),
            next_steps: None,
        };

        respond_to_request(&harness, "worker-1", failure(task.id)).await;
        harness.coordinator.process_incoming().await.unwrap();

        let retries = harness.coordinator.list_tasks(TaskStatus::Assigned).await.unwrap();
        assert_eq!(retries.len(), 1);
        let retry_id = retries[0].id;

        respond_to_request(&harness, "worker-2", failure(retry_id)).await;
        harness.coordinator.process_incoming().await.unwrap();

        // Attempt 2 of 2 failed: the budget is spent, no third task appears
        assert!(harness
            .coordinator
            .list_tasks(TaskStatus::Assigned)
            .await
            .unwrap()
            .is_empty());
        let counts = harness.store.task_counts().await.unwrap();
        assert_eq!(counts.failed, 2);
    }

    #[tokio::test]
    async fn test_failure_stands_without_alternate_agent() {
        let harness = setup(CoordinationConfig::default()).await;
        enroll_worker(&harness, "worker-1").await;

        let task = delegate(&harness, demo_spec()).await;
        respond_to_request(
            &harness,
            "worker-1",
            TaskResponse {
                task_id: task.id,
                status: ReportedStatus::Failed,
                progress: None,
                result: None,
                error_message: Some("out of memory".into()),
                next_steps: None,
            },
        )
        .await;
        harness.coordinator.process_incoming().await.unwrap();

        // The failed agent is excluded and nobody else qualifies
        let failed = harness.coordinator.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(harness
            .coordinator
            .list_tasks(TaskStatus::Assigned)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(current_load(&harness, "worker-1").await, 0);
    }

    #[tokio::test]
    async fn test_reports_from_non_assignees_are_discarded() {
        let harness = setup(CoordinationConfig::default()).await;
        enroll_worker(&harness, "worker-1").await;
        enroll_worker(&harness, "worker-2").await;

        let task = delegate(&harness, demo_spec()).await;

        let bogus = Message::builder()
            .from("worker-2")
            .to(&harness.coordinator.config.supervisor_id)
            .payload(MessagePayload::TaskResponse(TaskResponse {
                task_id: task.id,
                status: ReportedStatus::Completed,
                progress: Some(1.0),
                result: None,
                error_message: None,
                next_steps: None,
            }))
            .build()
            .unwrap();
        harness.queue.send(bogus).await.unwrap();
        assert_eq!(harness.coordinator.process_incoming().await.unwrap(), 1);

        // The claim stands: still assigned to worker-1, still in flight
        let unchanged = harness.coordinator.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TaskStatus::Assigned);
        assert_eq!(unchanged.assigned_agent.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_idempotent() {
        let harness = setup(CoordinationConfig::default()).await;
        enroll_worker(&harness, "worker-1").await;

        let task = delegate(&harness, demo_spec()).await;
        let completion = TaskResponse {
            task_id: task.id,
            status: ReportedStatus::Completed,
            progress: Some(1.0),
            result: Some(json!({"ok": true})),
            error_message: None,
            next_steps: None,
        };

        for _ in 0..2 {
            let message = Message::builder()
                .from("worker-1")
                .to(&harness.coordinator.config.supervisor_id)
                .payload(MessagePayload::TaskResponse(completion.clone()))
                .build()
                .unwrap();
            harness.queue.send(message).await.unwrap();
        }
        assert_eq!(harness.coordinator.process_incoming().await.unwrap(), 2);

        let completed = harness.coordinator.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        // The load came back exactly once
        assert_eq!(current_load(&harness, "worker-1").await, 0);
    }

    #[tokio::test]
    async fn test_report_on_unknown_task_fails_the_message() {
        let harness = setup(CoordinationConfig::default()).await;
        enroll_worker(&harness, "worker-1").await;

        let stray = Message::builder()
            .from("worker-1")
            .to(&harness.coordinator.config.supervisor_id)
            .payload(MessagePayload::TaskResponse(TaskResponse {
                task_id: Uuid::new_v4(),
                status: ReportedStatus::Completed,
                progress: None,
                result: None,
                error_message: None,
                next_steps: None,
            }))
            .build()
            .unwrap();
        let stray_id = harness.queue.send(stray).await.unwrap();
        assert_eq!(harness.coordinator.process_incoming().await.unwrap(), 1);

        let settled = harness.queue.get(stray_id).await.unwrap().unwrap();
        assert_eq!(settled.status, MessageStatus::Failed);
        assert!(settled.error_message.as_deref().unwrap().contains("task"));
    }

    #[tokio::test]
    async fn test_cancel_task_notifies_assignee() {
        let harness = setup(CoordinationConfig::default()).await;
        enroll_worker(&harness, "worker-1").await;

        let task = delegate(&harness, demo_spec()).await;
        let cancelled = harness.coordinator.cancel_task(task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(current_load(&harness, "worker-1").await, 0);

        let inbox = harness.queue.receive("worker-1", 10).await.unwrap();
        let notice = inbox
            .iter()
            .find_map(|m| match &m.payload {
                MessagePayload::Coordination(Coordination::CancelTask { task_id }) => Some(*task_id),
                _ => None,
            })
            .expect("cancel notice delivered");
        assert_eq!(notice, task.id);

        assert!(harness
            .coordinator
            .cancel_task(task.id)
            .await
            .unwrap_err()
            .is_conflict());
        assert!(harness
            .coordinator
            .cancel_task(Uuid::new_v4())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_reconcile_fails_overdue_stuck_and_orphaned_tasks() {
        let mut config = CoordinationConfig::default();
        config.max_task_attempts = 1;
        let harness = setup(config).await;
        enroll_worker(&harness, "worker-1").await;

        // Ran past its deadline
        let mut overdue_spec = demo_spec();
        overdue_spec.deadline = Some(Utc::now() - Duration::seconds(5));
        let overdue = delegate(&harness, overdue_spec).await;

        // No deadline and silent for longer than the stuck window
        let stalled = delegate(&harness, demo_spec()).await;
        let mut stored = harness.coordinator.get_task(stalled.id).await.unwrap().unwrap();
        stored.updated_at = Utc::now() - Duration::seconds(8000);
        assert!(harness
            .store
            .update_task(&stored, TaskStatus::Assigned)
            .await
            .unwrap());

        // Created but never dispatched
        let mut orphan = Task::builder()
            .task_type("research")
            .description("Left behind by a crash")
            .supervisor_agent(&harness.coordinator.config.supervisor_id)
            .build()
            .unwrap();
        orphan.created_at = Utc::now() - Duration::seconds(8000);
        orphan.updated_at = orphan.created_at;
        harness.store.create_task(&orphan).await.unwrap();

        assert_eq!(harness.coordinator.reconcile_timeouts().await.unwrap(), 3);

        let overdue = harness.coordinator.get_task(overdue.id).await.unwrap().unwrap();
        assert_eq!(overdue.status, TaskStatus::Failed);
        assert!(overdue.error_message.as_deref().unwrap().contains("deadline exceeded"));

        let stalled = harness.coordinator.get_task(stalled.id).await.unwrap().unwrap();
        assert_eq!(stalled.status, TaskStatus::Failed);
        assert!(stalled
            .error_message
            .as_deref()
            .unwrap()
            .contains("no progress"));

        let orphan = harness.coordinator.get_task(orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, TaskStatus::Failed);
        assert!(orphan.error_message.as_deref().unwrap().contains("never dispatched"));

        assert_eq!(current_load(&harness, "worker-1").await, 0);
        assert_eq!(harness.coordinator.reconcile_timeouts().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_reassigns_tasks_from_silent_agents() {
        let harness = setup(CoordinationConfig::default()).await;
        enroll_worker(&harness, "worker-1").await;
        enroll_worker(&harness, "worker-2").await;

        let task = delegate(&harness, demo_spec()).await;
        assert_eq!(task.assigned_agent.as_deref(), Some("worker-1"));

        // The assignee's heartbeat lapses past the stale window
        let mut silent = harness.registry.get("worker-1").await.unwrap().unwrap();
        silent.last_heartbeat = Utc::now() - Duration::seconds(700);
        harness.store.upsert_agent(&silent).await.unwrap();

        assert_eq!(harness.coordinator.reconcile_timeouts().await.unwrap(), 1);

        let failed = harness.coordinator.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed
            .error_message
            .as_deref()
            .unwrap()
            .contains("went silent"));

        let retries = harness.coordinator.list_tasks(TaskStatus::Assigned).await.unwrap();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].assigned_agent.as_deref(), Some("worker-2"));
        assert_eq!(retries[0].retry_of, Some(task.id));
    }

    #[tokio::test]
    async fn test_maintenance_reports_each_sweep() {
        let mut config = CoordinationConfig::default();
        config.visibility_timeout_seconds = 0;
        config.retention_seconds = 0;
        let harness = setup(config).await;
        enroll_worker(&harness, "worker-1").await;

        let now = Utc::now();

        // A claim that lapses immediately
        let claimed = Message::builder()
            .from(&harness.coordinator.config.supervisor_id)
            .to("worker-1")
            .payload(MessagePayload::Coordination(Coordination::Announcement {
                topic: "ping".into(),
                detail: json!({}),
            }))
            .build()
            .unwrap();
        let claimed_id = harness.queue.send(claimed).await.unwrap();
        assert!(harness
            .store
            .claim_message(claimed_id, "worker-1", now)
            .await
            .unwrap());

        // A pending message past its expiry
        let mut doomed = Message::builder()
            .from(&harness.coordinator.config.supervisor_id)
            .to("worker-1")
            .payload(MessagePayload::Coordination(Coordination::Announcement {
                topic: "stale".into(),
                detail: json!({}),
            }))
            .build()
            .unwrap();
        doomed.expires_at = Some(now - Duration::seconds(1));
        harness.queue.send(doomed).await.unwrap();

        // A settled message old enough to purge under zero retention
        let settled = Message::builder()
            .from(&harness.coordinator.config.supervisor_id)
            .to("worker-1")
            .payload(MessagePayload::Coordination(Coordination::Announcement {
                topic: "done".into(),
                detail: json!({}),
            }))
            .build()
            .unwrap();
        let settled_id = harness.queue.send(settled).await.unwrap();
        harness
            .store
            .claim_message(settled_id, "worker-1", now)
            .await
            .unwrap();
        harness
            .store
            .resolve_message(settled_id, "worker-1", MessageStatus::Processed, None, now)
            .await
            .unwrap();

        // An agent whose heartbeat went silent past the stale window
        let mut silent = Agent::builder()
            .id("worker-silent")
            .role(AgentRole::Worker)
            .capability("demo")
            .max_concurrent_tasks(2)
            .build()
            .unwrap();
        silent.last_heartbeat = now - Duration::seconds(700);
        harness.store.upsert_agent(&silent).await.unwrap();

        // A settled task old enough to purge
        let mut done_task = Task::builder()
            .task_type("research")
            .description("Old settled work")
            .supervisor_agent(&harness.coordinator.config.supervisor_id)
            .build()
            .unwrap();
        harness.store.create_task(&done_task).await.unwrap();
        done_task.assign_to("worker-1").unwrap();
        harness
            .store
            .update_task(&done_task, TaskStatus::Pending)
            .await
            .unwrap();
        done_task.complete_with(None).unwrap();
        harness
            .store
            .update_task(&done_task, TaskStatus::Assigned)
            .await
            .unwrap();

        let report = harness.coordinator.run_maintenance().await.unwrap();
        assert_eq!(report.reaped_claims, 1);
        assert_eq!(report.expired_messages, 1);
        assert_eq!(report.retired_agents, 1);
        assert_eq!(report.reconciled_tasks, 0);
        // Both the settled and the just-expired message fall to zero retention
        assert_eq!(report.purged_messages, 2);
        assert_eq!(report.purged_tasks, 1);

        // The lapsed claim circulated back to pending
        let recirculated = harness.queue.get(claimed_id).await.unwrap().unwrap();
        assert_eq!(recirculated.status, MessageStatus::Pending);
        assert_eq!(recirculated.retry_count, 1);
    }

    #[tokio::test]
    async fn test_shutdown_announces_and_goes_offline() {
        let harness = setup(CoordinationConfig::default()).await;
        enroll_worker(&harness, "worker-1").await;
        delegate(&harness, demo_spec()).await;

        harness.coordinator.shutdown().await.unwrap();

        let supervisor = harness
            .registry
            .get(&harness.coordinator.config.supervisor_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(supervisor.status, AgentStatus::Offline);

        let inbox = harness.queue.receive("worker-1", 10).await.unwrap();
        let shutdown = inbox
            .iter()
            .find_map(|m| match &m.payload {
                MessagePayload::Coordination(Coordination::SupervisorShutdown {
                    supervisor_id,
                    active_tasks,
                }) => Some((supervisor_id.clone(), *active_tasks)),
                _ => None,
            })
            .expect("shutdown notice delivered");
        assert_eq!(shutdown.0, harness.coordinator.config.supervisor_id);
        assert_eq!(shutdown.1, 1);
    }

    #[tokio::test]
    async fn test_assignment_without_eligible_agent_creates_nothing() {
        let harness = setup(CoordinationConfig::default()).await;

        // Nobody but the zero-capacity supervisor is registered
        let outcome = harness.coordinator.assign_task(demo_spec()).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(harness.store.task_counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_coordination_over_fallback_store() {
        // A database path that cannot exist forces the in-memory fallback
        let store = open_store(&StoreConfig {
            database_url: "sqlite:/dev/null/foreman.db".into(),
            ..Default::default()
        })
        .await;
        assert_eq!(store.backend_name(), "memory");

        let harness = setup_over(store, CoordinationConfig::default()).await;
        enroll_worker(&harness, "worker-1").await;

        let task = delegate(&harness, demo_spec()).await;
        respond_to_request(
            &harness,
            "worker-1",
            TaskResponse {
                task_id: task.id,
                status: ReportedStatus::Completed,
                progress: Some(1.0),
                result: Some(json!({"ok": true})),
                error_message: None,
                next_steps: None,
            },
        )
        .await;
        harness.coordinator.process_incoming().await.unwrap();

        let completed = harness.coordinator.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
    }
}
