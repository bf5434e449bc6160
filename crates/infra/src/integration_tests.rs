//! Integration tests for the full task lifecycle.
//!
//! Tests: submit → queue → DispatchPool → Dispatcher → (PendingTaskPoller) → Settler
//!
//! Verifies:
//! - Asynchronous vendor jobs are polled to a terminal outcome and billed on
//!   realized output
//! - Failures of any kind release the frozen quota exactly once
//! - Follow-up tasks are chained through the queue
//! - Terminal statuses never revert

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use proptest::prelude::*;

    use taskforge_ai::{ChatResponse, VendorJobState, VendorJobStatus, VendorRegistry};
    use taskforge_core::{
        HistoryStatus, PendingTaskStatus, PendingTaskUpdate, PriceBook, QueueTask,
        QueueTaskStatus, TaskError, TaskId, TaskStatusView, TaskType, Transition, UserId,
    };

    use crate::compensator::QuotaCompensator;
    use crate::config::EngineConfig;
    use crate::dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig};
    use crate::engine::{standard_handlers, TaskEngine, VendorBindings};
    use crate::handlers::{
        Completion, HandlerRegistry, ImageDownloadHandler, PollOutcome, VendorRoute,
        VendorTaskHandler,
    };
    use crate::jobs::{Delivery, DispatchPool, DispatchPoolConfig, InMemoryTaskQueue, QueuedTask, TaskQueue};
    use crate::ledger::{InMemoryQuotaLedger, LedgerEntryKind, QuotaLedger};
    use crate::poller::{PendingTaskPoller, PollDisposition, PollerConfig};
    use crate::service::TaskService;
    use crate::settle::Settler;
    use crate::sink::{QueueSink, TaskSink};
    use crate::store::{HistoryStore, InMemoryResultStore, PendingTaskStore, QueueTaskStore};
    use crate::testing::{
        image_payload, pending_task, seed_task, MirrorAssets, PanickingHandler, ScriptedChat,
        ScriptedVendor, StubHandler,
    };

    type Store = Arc<InMemoryResultStore>;
    type Ledger = Arc<InMemoryQuotaLedger>;

    struct Harness {
        queue: Arc<InMemoryTaskQueue>,
        store: Store,
        ledger: Ledger,
        service: TaskService<Store, Ledger>,
        pool: DispatchPool<Arc<InMemoryTaskQueue>, Store, Ledger>,
        poller: PendingTaskPoller<Store, Ledger>,
    }

    fn prices() -> PriceBook {
        PriceBook::default().with_model_price("wanx-v1", 40)
    }

    fn harness(build: impl FnOnce(&Store) -> HandlerRegistry) -> Harness {
        let queue = InMemoryTaskQueue::arc();
        let store = InMemoryResultStore::arc();
        let ledger = InMemoryQuotaLedger::arc();
        ledger.deposit(UserId::new(1), 1_000).unwrap();

        let handlers = Arc::new(build(&store));
        let sink: Arc<dyn TaskSink> = Arc::new(QueueSink::new(queue.clone(), store.clone()));
        let settler = Arc::new(
            Settler::new(
                store.clone(),
                QuotaCompensator::new(ledger.clone(), prices()),
                Duration::from_secs(7 * 24 * 3600),
            )
            .with_sink(sink.clone()),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            handlers.clone(),
            settler.clone(),
            DispatcherConfig::default(),
        ));

        Harness {
            queue: queue.clone(),
            store: store.clone(),
            ledger: ledger.clone(),
            service: TaskService::new(store, ledger, sink),
            pool: DispatchPool::new(queue, dispatcher, DispatchPoolConfig::default()),
            poller: PendingTaskPoller::new(handlers, settler, PollerConfig::default()),
        }
    }

    fn vendor_handlers(vendor: Arc<ScriptedVendor>, persist: bool) -> HandlerRegistry {
        HandlerRegistry::new().with(
            TaskType::ImageCompletion,
            Arc::new(
                VendorTaskHandler::new(
                    VendorRegistry::new().with("dashscope", vendor),
                    VendorRoute::FromPayload,
                )
                .with_asset_persistence(persist),
            ),
        )
    }

    fn user() -> UserId {
        UserId::new(1)
    }

    #[test]
    fn async_job_is_polled_to_success_and_billed_on_realized_output() {
        let vendor = ScriptedVendor::accepting("job-1")
            .then_status(Ok(VendorJobStatus::in_state(VendorJobState::Running)))
            .then_status(Ok(VendorJobStatus::in_state(VendorJobState::Running)))
            .then_status(Ok(VendorJobStatus::succeeded(vec![
                "https://vendor/a.png".into(),
                "https://vendor/b.png".into(),
            ])));
        let h = harness(|_| vendor_handlers(vendor.clone(), false));

        let id = h.service.submit(image_payload(1, 100)).unwrap();
        assert_eq!(
            h.pool.run_once("w").unwrap(),
            Delivery::Dispatched(DispatchOutcome::Pending)
        );

        for expected in 1..=2 {
            let task = h.store.get_pending_task(&id).unwrap().unwrap();
            assert_eq!(h.poller.poll_one(&task, Utc::now()), PollDisposition::Rearmed);
            let task = h.store.get_pending_task(&id).unwrap().unwrap();
            assert_eq!(task.execute_times, expected);
            assert_eq!(task.status, PendingTaskStatus::Processing);
            assert_eq!(h.service.status(&id, user()).unwrap(), TaskStatusView::Running);
        }

        let task = h.store.get_pending_task(&id).unwrap().unwrap();
        assert_eq!(h.poller.poll_one(&task, Utc::now()), PollDisposition::Succeeded);

        match h.service.status(&id, user()).unwrap() {
            TaskStatusView::Success {
                resources,
                valid_before,
                width,
                ..
            } => {
                assert_eq!(resources.len(), 2);
                let validity = valid_before.unwrap() - Utc::now();
                assert!(validity > chrono::Duration::days(6));
                assert!(validity <= chrono::Duration::days(7));
                assert_eq!(width, Some(1024));
            }
            other => panic!("unexpected status: {other:?}"),
        }

        let balance = h.ledger.balance(user()).unwrap();
        assert_eq!((balance.rest, balance.freezed, balance.used), (920, 0, 80));
        let history = h.store.get_history_record(user(), &id).unwrap().unwrap();
        assert_eq!(history.status, HistoryStatus::Success);
        assert_eq!(history.quota_used, 80);
    }

    #[test]
    fn vendor_failure_releases_full_freeze() {
        let vendor = ScriptedVendor::accepting("job-1")
            .then_status(Ok(VendorJobStatus::failed("image violates content policy")));
        let h = harness(|_| vendor_handlers(vendor.clone(), false));

        let id = h.service.submit(image_payload(1, 100)).unwrap();
        h.pool.run_once("w").unwrap();
        let task = h.store.get_pending_task(&id).unwrap().unwrap();
        assert_eq!(h.poller.poll_one(&task, Utc::now()), PollDisposition::Failed);

        assert_eq!(
            h.service.status(&id, user()).unwrap(),
            TaskStatusView::Failed {
                errors: vec!["image violates content policy".into()]
            }
        );
        let balance = h.ledger.balance(user()).unwrap();
        assert_eq!((balance.rest, balance.freezed, balance.used), (1_000, 0, 0));
        let history = h.store.get_history_record(user(), &id).unwrap().unwrap();
        assert_eq!(history.status, HistoryStatus::Failed);
        assert_eq!(history.error.as_deref(), Some("image violates content policy"));
    }

    #[test]
    fn synchronous_vendor_chains_asset_persistence() {
        let vendor = ScriptedVendor::completing(&["https://vendor/a.png"]);
        let h = harness(|store| {
            vendor_handlers(vendor.clone(), true).with(
                TaskType::ImageDownload,
                Arc::new(ImageDownloadHandler::new(MirrorAssets::new(), store.clone())),
            )
        });

        let id = h.service.submit(image_payload(1, 100)).unwrap();
        assert_eq!(
            h.pool.run_once("w").unwrap(),
            Delivery::Dispatched(DispatchOutcome::Succeeded)
        );
        assert!(h.store.get_pending_task(&id).unwrap().is_none());
        assert_eq!(h.queue.stats().unwrap().ready, 1);

        assert_eq!(
            h.pool.run_once("w").unwrap(),
            Delivery::Dispatched(DispatchOutcome::Succeeded)
        );

        let history = h.store.get_history_record(user(), &id).unwrap().unwrap();
        assert_eq!(
            history.answer.as_deref(),
            Some("[\"https://cdn.local/1/a.png\"]")
        );
        // One unit delivered at 40; the download itself is free.
        let balance = h.ledger.balance(user()).unwrap();
        assert_eq!((balance.freezed, balance.used), (0, 40));
        assert_eq!(h.ledger.journal().unwrap().len(), 2);
    }

    #[test]
    fn handler_panic_surfaces_as_failure() {
        let h = harness(|_| {
            HandlerRegistry::new().with(
                TaskType::ImageCompletion,
                Arc::new(PanickingHandler::new("vendor sdk crashed")),
            )
        });

        let id = h.service.submit(image_payload(1, 100)).unwrap();
        assert_eq!(
            h.pool.run_once("w").unwrap(),
            Delivery::Dispatched(DispatchOutcome::Failed)
        );
        assert_eq!(
            h.service.status(&id, user()).unwrap(),
            TaskStatusView::Failed {
                errors: vec!["vendor sdk crashed".into()]
            }
        );
        assert_eq!(h.ledger.balance(user()).unwrap().freezed, 0);
    }

    #[test]
    fn stale_submission_never_reaches_vendor() {
        let vendor = ScriptedVendor::accepting("job-1");
        let h = harness(|_| vendor_handlers(vendor.clone(), false));

        let mut payload = image_payload(1, 100);
        payload.meta_mut().created_at = Utc::now() - chrono::Duration::minutes(10);
        let id = h.service.submit(payload).unwrap();

        assert_eq!(
            h.pool.run_once("w").unwrap(),
            Delivery::Dispatched(DispatchOutcome::Expired)
        );
        assert_eq!(vendor.submissions(), 0);
        assert_eq!(
            h.service.status(&id, user()).unwrap(),
            TaskStatusView::Failed {
                errors: vec![TaskError::SubmissionExpired.to_string()]
            }
        );
        assert_eq!(h.ledger.balance(user()).unwrap().available(), 1_000);
    }

    #[test]
    fn garbage_payload_is_dead_lettered_without_touching_quota() {
        let h = harness(|_| HandlerRegistry::new());
        h.queue
            .enqueue(QueuedTask::new(
                "junk".parse().unwrap(),
                TaskType::ImageUpscale,
                b"\x00\x01".to_vec(),
            ))
            .unwrap();

        assert!(matches!(h.pool.run_once("w").unwrap(), Delivery::DeadLettered(_)));
        assert_eq!(h.queue.stats().unwrap().dead_lettered, 1);
        assert!(h.ledger.journal().unwrap().is_empty());
    }

    #[test]
    fn racing_pollers_settle_once() {
        let outcomes = (0..8)
            .map(|_| Ok(PollOutcome::Completed(Completion::assets(vec!["u1".into()]))))
            .collect();
        let handler = Arc::new(StubHandler::default().polling(outcomes));
        let h = harness(|_| HandlerRegistry::new().with(TaskType::ImageCompletion, handler.clone()));

        let payload = seed_task(&h.store, &h.ledger, image_payload(1, 100), "race");
        let task = pending_task(&payload, "dashscope", "job-1");
        h.store.create_pending_task(task.clone()).unwrap();

        let now = Utc::now();
        let poller = &h.poller;
        let stale = &task;
        let dispositions: Vec<PollDisposition> = std::thread::scope(|scope| {
            let joins: Vec<_> = (0..8)
                .map(|_| scope.spawn(move || poller.poll_one(stale, now)))
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });

        let succeeded = dispositions
            .iter()
            .filter(|d| **d == PollDisposition::Succeeded)
            .count();
        assert_eq!(succeeded, 1);
        let consumes = h
            .ledger
            .entries_for(&task.task_id)
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == LedgerEntryKind::Consume)
            .count();
        assert_eq!(consumes, 1);
        assert_eq!(h.ledger.balance(user()).unwrap().used, 40);
    }

    #[test]
    fn engine_runs_tasks_end_to_end_on_background_threads() {
        taskforge_observability::init();
        let config = EngineConfig::from_lookup(|key| match key {
            "TASKFORGE_POLL_INTERVAL_SECS" => Some("0".into()),
            "TASKFORGE_POLLER_TICK_MS" => Some("10".into()),
            "TASKFORGE_DISPATCH_WORKERS" => Some("3".into()),
            _ => None,
        })
        .unwrap();

        let mut vendor = ScriptedVendor::accepting("job");
        for i in 0..5 {
            vendor = vendor.then_status(Ok(VendorJobStatus::succeeded(vec![
                format!("https://vendor/{i}-a.png"),
                format!("https://vendor/{i}-b.png"),
            ])));
        }

        let queue = InMemoryTaskQueue::arc();
        let store = InMemoryResultStore::arc();
        let ledger = InMemoryQuotaLedger::arc();
        ledger.deposit(user(), 1_000).unwrap();

        let handlers = standard_handlers(
            &config,
            VendorRegistry::new().with("dashscope", vendor),
            &VendorBindings::default(),
            ScriptedChat::answering(ChatResponse::text("ok", 1)),
            MirrorAssets::new(),
            store.clone(),
        );
        let engine = TaskEngine::new(&config, queue, store.clone(), ledger.clone(), prices(), handlers);
        let handle = engine.start().unwrap();

        let ids: Vec<TaskId> = (0..5)
            .map(|_| handle.service().submit(image_payload(1, 100)).unwrap())
            .collect();

        let deadline = Instant::now() + Duration::from_secs(10);
        let settled = || {
            ids.iter().all(|id| {
                matches!(
                    handle.service().status(id, user()),
                    Ok(TaskStatusView::Success { .. })
                )
            }) && ledger.balance(user()).unwrap().freezed == 0
        };
        while !settled() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let done = settled();
        let pool_stats = handle.pool_stats();
        handle.shutdown();

        assert!(done, "tasks did not settle in time");
        assert!(pool_stats.pending >= 5);
        let balance = ledger.balance(user()).unwrap();
        assert_eq!((balance.freezed, balance.used), (0, 400));
    }

    fn queue_status(i: u8) -> QueueTaskStatus {
        match i % 3 {
            0 => QueueTaskStatus::Running,
            1 => QueueTaskStatus::Success,
            _ => QueueTaskStatus::Failed,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever order success and failure settlements arrive
        /// in, the ledger sees exactly one counter-entry for the freeze.
        #[test]
        fn settlement_is_exclusive(attempts in prop::collection::vec(any::<bool>(), 1..12)) {
            let store = InMemoryResultStore::arc();
            let ledger = InMemoryQuotaLedger::arc();
            ledger.deposit(user(), 1_000).unwrap();
            let settler = Settler::new(
                store.clone(),
                QuotaCompensator::new(ledger.clone(), prices()),
                Duration::from_secs(3600),
            );
            let payload = seed_task(&store, &ledger, image_payload(1, 100), "p");
            let id = payload.id().unwrap().clone();
            let handler = StubHandler::default();

            for succeed in &attempts {
                if *succeed {
                    settler.complete(&id, &handler, &payload, Completion::assets(vec!["u".into()]));
                } else {
                    settler.fail(&id, &payload, &TaskError::vendor_failed("no"));
                }
            }

            let settlements: Vec<LedgerEntryKind> = ledger
                .entries_for(&id)
                .unwrap()
                .into_iter()
                .map(|e| e.kind)
                .filter(|k| *k != LedgerEntryKind::Freeze)
                .collect();
            let expected = if attempts[0] { LedgerEntryKind::Consume } else { LedgerEntryKind::Unfreeze };
            prop_assert_eq!(settlements, vec![expected]);
            prop_assert_eq!(ledger.balance(user()).unwrap().freezed, 0);
        }

        /// Property: the first terminal status written to a queue row sticks.
        #[test]
        fn queue_status_is_monotone(writes in prop::collection::vec(0u8..3, 1..16)) {
            let store = InMemoryResultStore::new();
            let id: TaskId = "m".parse().unwrap();
            store
                .create_queue_task(QueueTask::running(id.clone(), user(), TaskType::ImageUpscale, "t"))
                .unwrap();

            let mut terminal: Option<QueueTaskStatus> = None;
            for w in writes {
                let status = queue_status(w);
                let transition = store.update_queue_task(&id, status, None).unwrap();
                match terminal {
                    Some(_) => prop_assert_eq!(transition, Transition::AlreadyTerminal),
                    None if status.is_terminal() => terminal = Some(status),
                    None => {}
                }
                let current = store.get_queue_task(&id).unwrap().unwrap().status;
                prop_assert_eq!(current, terminal.unwrap_or(QueueTaskStatus::Running));
            }
        }

        /// Property: a closed pending task is never re-armed.
        #[test]
        fn pending_status_is_monotone(writes in prop::collection::vec(0u8..3, 1..16)) {
            let store = InMemoryResultStore::new();
            let payload = seed_task(&store, &InMemoryQuotaLedger::new(), image_payload(1, 0), "pm");
            let task = pending_task(&payload, "dashscope", "job");
            store.create_pending_task(task.clone()).unwrap();

            let mut closed: Option<PendingTaskStatus> = None;
            let mut attempts = 0u32;
            for w in writes {
                let update = match w {
                    0 => {
                        attempts += 1;
                        PendingTaskUpdate::rearm(Utc::now(), attempts)
                    }
                    1 => PendingTaskUpdate::succeeded(),
                    _ => PendingTaskUpdate::failed(),
                };
                let applied = store.update_pending_task(&task.task_id, &update).unwrap().applied();
                prop_assert_eq!(applied, closed.is_none());
                if closed.is_none() && update.status.is_terminal() {
                    closed = Some(update.status);
                }
                let current = store.get_pending_task(&task.task_id).unwrap().unwrap().status;
                prop_assert_eq!(current, closed.unwrap_or(PendingTaskStatus::Processing));
            }
        }
    }
}
