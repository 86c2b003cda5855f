#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::store::{ClaimRelease, CoordinationStore};
    use chrono::{Duration, Utc};
    use foreman_core::agent::{Agent, AgentRole, AgentStatus};
    use foreman_core::message::{Heartbeat, Message, MessagePayload, MessagePriority, MessageStatus};
    use foreman_core::task::{Task, TaskStatus};

    fn worker(id: &str) -> Agent {
        Agent::builder()
            .id(id)
            .role(AgentRole::Worker)
            .capability("demo")
            .max_concurrent_tasks(4)
            .build()
            .expect("valid agent")
    }

    fn heartbeat_payload() -> MessagePayload {
        MessagePayload::Heartbeat(Heartbeat {
            status: AgentStatus::Idle,
            current_tasks: 0,
        })
    }

    fn direct_message(from: &str, to: &str) -> Message {
        Message::builder()
            .from(from)
            .to(to)
            .payload(heartbeat_payload())
            .build()
            .expect("valid message")
    }

    fn sample_task(supervisor: &str) -> Task {
        Task::builder()
            .task_type("demo")
            .description("exercise the store")
            .supervisor_agent(supervisor)
            .build()
            .expect("valid task")
    }

    #[tokio::test]
    async fn test_agent_upsert_preserves_registration_time() {
        let store = MemoryStore::new();
        let first = worker("worker-1");
        store.upsert_agent(&first).await.unwrap();

        let replacement = Agent::builder()
            .id("worker-1")
            .role(AgentRole::Worker)
            .capabilities(vec!["demo", "review"])
            .max_concurrent_tasks(8)
            .build()
            .unwrap();
        store.upsert_agent(&replacement).await.unwrap();

        let stored = store.get_agent("worker-1").await.unwrap().unwrap();
        assert_eq!(stored.registered_at, first.registered_at);
        assert_eq!(stored.max_concurrent_tasks, 8);
        assert!(stored.has_capability("review"));
        assert_eq!(store.list_agents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_agent_and_rejects_unknown() {
        let store = MemoryStore::new();
        let at = Utc::now();
        assert!(!store
            .record_heartbeat("ghost", None, None, at)
            .await
            .unwrap());

        store.upsert_agent(&worker("worker-1")).await.unwrap();
        let updated = store
            .record_heartbeat("worker-1", Some(AgentStatus::Busy), Some(2), at)
            .await
            .unwrap();
        assert!(updated);

        let stored = store.get_agent("worker-1").await.unwrap().unwrap();
        assert_eq!(stored.status, AgentStatus::Busy);
        assert_eq!(stored.current_tasks, 2);
        assert_eq!(stored.last_heartbeat, at);
        assert!((stored.load_factor - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_adjust_load_floors_at_zero() {
        let store = MemoryStore::new();
        store.upsert_agent(&worker("worker-1")).await.unwrap();
        let at = Utc::now();

        assert!(store.adjust_agent_load("worker-1", -3, at).await.unwrap());
        let stored = store.get_agent("worker-1").await.unwrap().unwrap();
        assert_eq!(stored.current_tasks, 0);
        assert_eq!(stored.load_factor, 0.0);

        store.adjust_agent_load("worker-1", 2, at).await.unwrap();
        let stored = store.get_agent("worker-1").await.unwrap().unwrap();
        assert_eq!(stored.current_tasks, 2);
        assert!((stored.load_factor - 0.5).abs() < f64::EPSILON);

        store.adjust_agent_load("worker-1", 100, at).await.unwrap();
        let stored = store.get_agent("worker-1").await.unwrap().unwrap();
        assert_eq!(stored.load_factor, 1.0);

        assert!(!store.adjust_agent_load("ghost", 1, at).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_under_contention() {
        let store = MemoryStore::new();
        let message = direct_message("supervisor-main", "worker-1");
        store.create_message(&message).await.unwrap();

        let now = Utc::now();
        let claimants: Vec<String> = (0..8).map(|i| format!("consumer-{i}")).collect();
        let attempts = futures::future::join_all(
            claimants
                .iter()
                .map(|name| store.claim_message(message.id, name, now)),
        )
        .await;

        let wins = attempts
            .into_iter()
            .filter(|outcome| *outcome.as_ref().unwrap())
            .count();
        assert_eq!(wins, 1);

        let stored = store.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Processing);
        assert!(stored.claimed_by.is_some());
    }

    #[tokio::test]
    async fn test_resolve_requires_claim_holder() {
        let store = MemoryStore::new();
        let message = direct_message("supervisor-main", "worker-1");
        store.create_message(&message).await.unwrap();
        let now = Utc::now();
        assert!(store.claim_message(message.id, "worker-1", now).await.unwrap());

        let by_stranger = store
            .resolve_message(message.id, "worker-2", MessageStatus::Processed, None, now)
            .await
            .unwrap();
        assert!(!by_stranger);

        let by_holder = store
            .resolve_message(message.id, "worker-1", MessageStatus::Processed, None, now)
            .await
            .unwrap();
        assert!(by_holder);

        // A second settle attempt loses: the message is already terminal
        let again = store
            .resolve_message(message.id, "worker-1", MessageStatus::Processed, None, now)
            .await
            .unwrap();
        assert!(!again);

        let stored = store.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Processed);
        assert_eq!(stored.processed_at, Some(now));
    }

    #[tokio::test]
    async fn test_release_claim_guards_on_retry_count() {
        let store = MemoryStore::new();
        let message = direct_message("supervisor-main", "worker-1");
        store.create_message(&message).await.unwrap();
        let now = Utc::now();
        store.claim_message(message.id, "worker-1", now).await.unwrap();

        let stale = store
            .release_claim(message.id, 5, ClaimRelease::Requeue, None, now)
            .await
            .unwrap();
        assert!(!stale);

        let released = store
            .release_claim(message.id, 0, ClaimRelease::Requeue, Some("claim timed out"), now)
            .await
            .unwrap();
        assert!(released);
        let stored = store.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.claimed_by.is_none());
        assert!(stored.claimed_at.is_none());

        store.claim_message(message.id, "worker-1", now).await.unwrap();
        let failed = store
            .release_claim(message.id, 1, ClaimRelease::Fail, Some("budget exhausted"), now)
            .await
            .unwrap();
        assert!(failed);
        let stored = store.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.processed_at, Some(now));
        assert_eq!(stored.error_message.as_deref(), Some("budget exhausted"));
    }

    #[tokio::test]
    async fn test_pending_ordering_and_limit() {
        let store = MemoryStore::new();
        let base = Utc::now();

        let mut background = direct_message("a", "worker-1");
        background.priority = MessagePriority::Background;
        background.created_at = base;

        let mut critical_old = direct_message("a", "worker-1");
        critical_old.priority = MessagePriority::Critical;
        critical_old.created_at = base + Duration::seconds(1);

        let mut medium = direct_message("a", "worker-1");
        medium.priority = MessagePriority::Medium;
        medium.created_at = base + Duration::seconds(2);

        let mut critical_new = direct_message("a", "worker-1");
        critical_new.priority = MessagePriority::Critical;
        critical_new.created_at = base + Duration::seconds(3);

        let mut other_recipient = direct_message("a", "worker-2");
        other_recipient.priority = MessagePriority::Critical;
        other_recipient.created_at = base;

        for message in [
            &background,
            &critical_old,
            &medium,
            &critical_new,
            &other_recipient,
        ] {
            store.create_message(message).await.unwrap();
        }

        let listed = store.list_pending_for("worker-1", 10).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|m| m.id).collect();
        assert_eq!(
            ids,
            vec![critical_old.id, critical_new.id, medium.id, background.id]
        );

        let limited = store.list_pending_for("worker-1", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, critical_old.id);
        assert_eq!(limited[1].id, critical_new.id);
    }

    #[tokio::test]
    async fn test_expire_applies_only_to_pending() {
        let store = MemoryStore::new();
        let message = direct_message("a", "worker-1");
        store.create_message(&message).await.unwrap();
        let now = Utc::now();

        assert!(store.expire_message(message.id, now).await.unwrap());
        assert!(!store.expire_message(message.id, now).await.unwrap());

        let claimed = direct_message("a", "worker-1");
        store.create_message(&claimed).await.unwrap();
        store.claim_message(claimed.id, "worker-1", now).await.unwrap();
        assert!(!store.expire_message(claimed.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_pending_listing() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut stale = direct_message("a", "worker-1");
        stale.expires_at = Some(now - Duration::seconds(1));
        let fresh = direct_message("a", "worker-1");
        store.create_message(&stale).await.unwrap();
        store.create_message(&fresh).await.unwrap();

        let expired = store.list_expired_pending(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);
    }

    #[tokio::test]
    async fn test_purge_messages_honors_retention() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let settled_long_ago = now - Duration::days(30);

        let old_processed = direct_message("a", "worker-1");
        store.create_message(&old_processed).await.unwrap();
        store
            .claim_message(old_processed.id, "worker-1", settled_long_ago)
            .await
            .unwrap();
        store
            .resolve_message(
                old_processed.id,
                "worker-1",
                MessageStatus::Processed,
                None,
                settled_long_ago,
            )
            .await
            .unwrap();

        let mut old_pending = direct_message("a", "worker-1");
        old_pending.created_at = settled_long_ago;
        store.create_message(&old_pending).await.unwrap();

        let purged = store.purge_messages(now - Duration::days(7)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_message(old_processed.id).await.unwrap().is_none());
        // Unsettled messages are never purged regardless of age
        assert!(store.get_message(old_pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_task_update_is_compare_and_swap() {
        let store = MemoryStore::new();
        let task = sample_task("supervisor-main");
        store.create_task(&task).await.unwrap();

        let mut assigned = task.clone();
        assigned.assign_to("worker-1").unwrap();
        assert!(store.update_task(&assigned, TaskStatus::Pending).await.unwrap());

        // A writer still holding the pending snapshot loses the race
        let mut cancelled = task.clone();
        cancelled.transition(TaskStatus::Cancelled).unwrap();
        assert!(!store.update_task(&cancelled, TaskStatus::Pending).await.unwrap());

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Assigned);
        assert_eq!(stored.assigned_agent.as_deref(), Some("worker-1"));
        assert_eq!(stored.created_at, task.created_at);
    }

    #[tokio::test]
    async fn test_task_counts_and_purge() {
        let store = MemoryStore::new();
        let live = sample_task("supervisor-main");
        store.create_task(&live).await.unwrap();

        let mut done = sample_task("supervisor-main");
        store.create_task(&done).await.unwrap();
        done.assign_to("worker-1").unwrap();
        store.update_task(&done, TaskStatus::Pending).await.unwrap();
        done.complete_with(None).unwrap();
        store.update_task(&done, TaskStatus::Assigned).await.unwrap();

        let counts = store.task_counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.live(), 1);
        assert_eq!(counts.total(), 2);

        let purged = store
            .purge_tasks(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_task(done.id).await.unwrap().is_none());
        assert!(store.get_task(live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_creation_conflicts() {
        let store = MemoryStore::new();
        let message = direct_message("a", "worker-1");
        store.create_message(&message).await.unwrap();
        let err = store.create_message(&message).await.unwrap_err();
        assert!(err.is_conflict());

        // A batch containing a duplicate inserts nothing
        let fresh = direct_message("a", "worker-1");
        let err = store
            .create_messages(&[fresh.clone(), message.clone()])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(store.get_message(fresh.id).await.unwrap().is_none());

        let task = sample_task("supervisor-main");
        store.create_task(&task).await.unwrap();
        assert!(store.create_task(&task).await.unwrap_err().is_conflict());
    }
}
