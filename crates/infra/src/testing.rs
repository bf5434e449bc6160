//! Test doubles and fixtures shared by the unit and integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use taskforge_ai::{
    AssetError, AssetStore, CallContext, ChatClient, ChatError, ChatRequest, ChatResponse,
    VendorError, VendorJobClient, VendorJobState, VendorJobStatus, VendorRequest,
    VendorSubmission,
};
use taskforge_core::{
    ChatMessage, GroupChatPayload, HistoryRecord, HistoryUpdate, ImageCompletionPayload,
    ImageDownloadPayload, PendingPayload, PendingTask, PendingTaskStatus, PendingTaskUpdate,
    QueueTask, QueueTaskStatus, TaskError, TaskId, TaskMeta, TaskPayload, TaskResult, Transition,
    UserId,
};

use crate::handlers::{
    Completion, HandlerOutcome, PollOutcome, TaskHandler, VendorJobRef,
};
use crate::ledger::QuotaLedger;
use crate::sink::TaskSink;
use crate::store::{
    HistoryStore, InMemoryResultStore, PendingTaskStore, QueueTaskStore, ResultStore, StoreError,
};

pub(crate) fn image_payload(uid: i64, quota: i64) -> TaskPayload {
    TaskPayload::ImageCompletion(ImageCompletionPayload {
        meta: TaskMeta::new(UserId::new(uid), "wanx-v1", quota),
        vendor: "dashscope".into(),
        prompt: "a lighthouse at dusk".into(),
        negative_prompt: String::new(),
        image: None,
        image_count: 2,
        width: Some(1024),
        height: Some(768),
        steps: None,
        seed: Some(7),
        style_preset: None,
    })
}

pub(crate) fn chat_payload(uid: i64, quota: i64) -> TaskPayload {
    TaskPayload::GroupChat(GroupChatPayload {
        meta: TaskMeta::new(UserId::new(uid), "qwen-max", quota),
        group_id: 10,
        message_id: 20,
        context_messages: vec![
            ChatMessage::system("You are helpful"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::user("what's new?"),
        ],
    })
}

pub(crate) fn download_payload(uid: i64, source: &str, resources: &[&str]) -> TaskPayload {
    TaskPayload::ImageDownload(ImageDownloadPayload {
        meta: TaskMeta::new(UserId::new(uid), "", 0),
        source_task_id: task_id(source),
        resources: resources.iter().map(|r| r.to_string()).collect(),
    })
}

pub(crate) fn task_id(id: &str) -> TaskId {
    id.parse().expect("valid task id")
}

/// Assign `id` and mark the whole estimate as frozen.
pub(crate) fn submitted(mut payload: TaskPayload, id: &str) -> TaskPayload {
    payload.assign_id(task_id(id)).expect("fresh payload");
    payload.meta_mut().frozen_quota = payload.quota();
    payload
}

pub(crate) fn history_record(uid: UserId, id: &str) -> HistoryRecord {
    let mut payload = image_payload(uid.get(), 0);
    payload.assign_id(task_id(id)).expect("fresh payload");
    HistoryRecord::pending(&payload).expect("payload has id")
}

/// Put a task in the state submission leaves it in: frozen quota, Running
/// queue row and a pending history record.
pub(crate) fn seed_task<S: ResultStore, L: QuotaLedger>(
    store: &S,
    ledger: &L,
    payload: TaskPayload,
    id: &str,
) -> TaskPayload {
    let payload = submitted(payload, id);
    let task_id = payload.id().expect("assigned").clone();
    if payload.frozen_quota() > 0 {
        ledger
            .freeze(payload.uid(), payload.frozen_quota(), &task_id)
            .expect("freeze");
    }
    store
        .create_queue_task(QueueTask::running(
            task_id,
            payload.uid(),
            payload.task_type(),
            payload.title(),
        ))
        .expect("queue row");
    if payload.task_type().has_history() {
        store
            .create_history_record(HistoryRecord::pending(&payload).expect("payload has id"))
            .expect("history row");
    }
    payload
}

/// Pending record for an accepted job, due immediately.
pub(crate) fn pending_task(payload: &TaskPayload, vendor: &str, job_id: &str) -> PendingTask {
    let now = Utc::now();
    PendingTask {
        task_id: payload.id().expect("assigned").clone(),
        task_type: payload.task_type(),
        payload: serde_json::to_value(
            PendingPayload::new(vendor, job_id, payload).expect("replayable"),
        )
        .expect("json"),
        status: PendingTaskStatus::Processing,
        next_execute_at: now,
        deadline_at: now + chrono::Duration::minutes(30),
        execute_times: 0,
        created_at: now,
        updated_at: now,
    }
}

/// Handler with a fixed first outcome and a scripted list of poll outcomes.
pub(crate) struct StubHandler {
    outcome: HandlerOutcome,
    polls: Mutex<VecDeque<TaskResult<PollOutcome>>>,
    chain: bool,
    handle_calls: AtomicUsize,
    poll_calls: AtomicUsize,
}

impl Default for StubHandler {
    fn default() -> Self {
        Self::with_outcome(HandlerOutcome::Completed(Completion::assets(vec![
            "https://vendor/out.png".into(),
        ])))
    }
}

impl StubHandler {
    fn with_outcome(outcome: HandlerOutcome) -> Self {
        Self {
            outcome,
            polls: Mutex::new(VecDeque::new()),
            chain: false,
            handle_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn completing(resources: Vec<&str>) -> Self {
        Self::with_outcome(HandlerOutcome::Completed(Completion::assets(
            resources.into_iter().map(String::from).collect(),
        )))
    }

    pub(crate) fn accepting(vendor: &str, job_id: &str) -> Self {
        Self::with_outcome(HandlerOutcome::Accepted(VendorJobRef {
            vendor: vendor.into(),
            job_id: job_id.into(),
        }))
    }

    /// Poll results handed out in order; `InProgress` once exhausted.
    pub(crate) fn polling(self, outcomes: Vec<TaskResult<PollOutcome>>) -> Self {
        *self.polls.lock().expect("lock") = outcomes.into();
        self
    }

    pub(crate) fn chaining(mut self) -> Self {
        self.chain = true;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.handle_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn polls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }
}

impl TaskHandler for StubHandler {
    fn handle(&self, _ctx: &CallContext, _payload: &TaskPayload) -> TaskResult<HandlerOutcome> {
        self.handle_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.outcome.clone())
    }

    fn poll(
        &self,
        _ctx: &CallContext,
        _payload: &TaskPayload,
        _job: &VendorJobRef,
    ) -> TaskResult<PollOutcome> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        self.polls
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(Ok(PollOutcome::InProgress))
    }

    fn follow_up(&self, payload: &TaskPayload, completion: &Completion) -> Option<TaskPayload> {
        if !self.chain {
            return None;
        }
        let source = payload.id()?;
        let refs: Vec<&str> = completion.resources.iter().map(String::as_str).collect();
        Some(download_payload(payload.uid().get(), source.as_str(), &refs))
    }
}

/// Panics in every hook with the given message.
pub(crate) struct PanickingHandler {
    message: String,
}

impl PanickingHandler {
    pub(crate) fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl TaskHandler for PanickingHandler {
    fn handle(&self, _ctx: &CallContext, _payload: &TaskPayload) -> TaskResult<HandlerOutcome> {
        std::panic::panic_any(self.message.clone())
    }

    fn poll(
        &self,
        _ctx: &CallContext,
        _payload: &TaskPayload,
        _job: &VendorJobRef,
    ) -> TaskResult<PollOutcome> {
        std::panic::panic_any(self.message.clone())
    }

    fn follow_up(&self, _payload: &TaskPayload, _completion: &Completion) -> Option<TaskPayload> {
        std::panic::panic_any(self.message.clone())
    }
}

/// Sink that remembers what it was given.
pub(crate) struct RecordingSink {
    payloads: Mutex<Vec<TaskPayload>>,
    fail: bool,
}

impl RecordingSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            payloads: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            payloads: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    pub(crate) fn payloads(&self) -> Vec<TaskPayload> {
        self.payloads.lock().expect("lock").clone()
    }
}

impl TaskSink for RecordingSink {
    fn enqueue(&self, mut payload: TaskPayload) -> TaskResult<TaskId> {
        if self.fail {
            return Err(TaskError::storage("queue unavailable"));
        }
        let id = match payload.id() {
            Some(id) => id.clone(),
            None => {
                let id = TaskId::generate();
                payload.assign_id(id.clone())?;
                id
            }
        };
        self.payloads.lock().expect("lock").push(payload);
        Ok(id)
    }
}

/// Vendor with a fixed submit answer and scripted status answers.
pub(crate) struct ScriptedVendor {
    submission: Result<VendorSubmission, VendorError>,
    statuses: Mutex<VecDeque<Result<VendorJobStatus, VendorError>>>,
    submissions: AtomicUsize,
}

impl ScriptedVendor {
    fn new(submission: Result<VendorSubmission, VendorError>) -> Arc<Self> {
        Arc::new(Self {
            submission,
            statuses: Mutex::new(VecDeque::new()),
            submissions: AtomicUsize::new(0),
        })
    }

    pub(crate) fn accepting(job_id: &str) -> Arc<Self> {
        Self::new(Ok(VendorSubmission::Accepted {
            job_id: job_id.into(),
        }))
    }

    pub(crate) fn completing(resources: &[&str]) -> Arc<Self> {
        Self::new(Ok(VendorSubmission::Completed {
            resources: resources.iter().map(|r| r.to_string()).collect(),
        }))
    }

    pub(crate) fn rejecting(message: &str) -> Arc<Self> {
        Self::new(Err(VendorError::Rejected(message.into())))
    }

    /// Queue the next status answer; `Running` once exhausted.
    pub(crate) fn then_status(
        self: Arc<Self>,
        status: Result<VendorJobStatus, VendorError>,
    ) -> Arc<Self> {
        self.statuses.lock().expect("lock").push_back(status);
        self
    }

    pub(crate) fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

impl VendorJobClient for ScriptedVendor {
    fn submit(
        &self,
        _ctx: &CallContext,
        _request: &VendorRequest,
    ) -> Result<VendorSubmission, VendorError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        self.submission.clone()
    }

    fn query_status(
        &self,
        _ctx: &CallContext,
        _job_id: &str,
    ) -> Result<VendorJobStatus, VendorError> {
        self.statuses
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(VendorJobStatus::in_state(VendorJobState::Running)))
    }
}

/// Chat client that always gives the same answer.
pub(crate) struct ScriptedChat {
    response: ChatResponse,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    pub(crate) fn answering(response: ChatResponse) -> Arc<Self> {
        Arc::new(Self {
            response,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("lock").clone()
    }
}

impl ChatClient for ScriptedChat {
    fn chat(&self, _ctx: &CallContext, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        self.requests.lock().expect("lock").push(request.clone());
        Ok(self.response.clone())
    }
}

/// Asset store that "copies" a URL to `https://cdn.local/{owner}/{file}`.
pub(crate) struct MirrorAssets {
    fail: bool,
}

impl MirrorAssets {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self { fail: false })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self { fail: true })
    }
}

impl AssetStore for MirrorAssets {
    fn persist(&self, _ctx: &CallContext, owner: UserId, url: &str) -> Result<String, AssetError> {
        if self.fail {
            return Err(AssetError::Store("disk full".into()));
        }
        let file = url.rsplit('/').next().unwrap_or(url);
        Ok(format!("https://cdn.local/{owner}/{file}"))
    }
}

/// In-memory store whose conditional writes can be made to error a set
/// number of times before reaching the inner store.
pub(crate) struct FlakyStore {
    inner: InMemoryResultStore,
    queue_failures: AtomicUsize,
    pending_failures: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryResultStore::new(),
            queue_failures: AtomicUsize::new(0),
            pending_failures: AtomicUsize::new(0),
        })
    }

    pub(crate) fn fail_queue_writes(&self, times: usize) {
        self.queue_failures.store(times, Ordering::SeqCst);
    }

    pub(crate) fn fail_pending_writes(&self, times: usize) {
        self.pending_failures.store(times, Ordering::SeqCst);
    }

    fn trip(counter: &AtomicUsize) -> Result<(), StoreError> {
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(StoreError::Storage("connection reset".into())),
            Err(_) => Ok(()),
        }
    }
}

impl QueueTaskStore for FlakyStore {
    fn create_queue_task(&self, task: QueueTask) -> Result<(), StoreError> {
        self.inner.create_queue_task(task)
    }

    fn get_queue_task(&self, id: &TaskId) -> Result<Option<QueueTask>, StoreError> {
        self.inner.get_queue_task(id)
    }

    fn update_queue_task(
        &self,
        id: &TaskId,
        status: QueueTaskStatus,
        result: Option<serde_json::Value>,
    ) -> Result<Transition, StoreError> {
        if status.is_terminal() {
            Self::trip(&self.queue_failures)?;
        }
        self.inner.update_queue_task(id, status, result)
    }
}

impl PendingTaskStore for FlakyStore {
    fn create_pending_task(&self, task: PendingTask) -> Result<(), StoreError> {
        self.inner.create_pending_task(task)
    }

    fn get_pending_task(&self, id: &TaskId) -> Result<Option<PendingTask>, StoreError> {
        self.inner.get_pending_task(id)
    }

    fn update_pending_task(
        &self,
        id: &TaskId,
        update: &PendingTaskUpdate,
    ) -> Result<Transition, StoreError> {
        Self::trip(&self.pending_failures)?;
        self.inner.update_pending_task(id, update)
    }

    fn due_pending_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingTask>, StoreError> {
        self.inner.due_pending_tasks(now, limit)
    }
}

impl HistoryStore for FlakyStore {
    fn create_history_record(&self, record: HistoryRecord) -> Result<(), StoreError> {
        self.inner.create_history_record(record)
    }

    fn get_history_record(
        &self,
        uid: UserId,
        task_id: &TaskId,
    ) -> Result<Option<HistoryRecord>, StoreError> {
        self.inner.get_history_record(uid, task_id)
    }

    fn update_history_record(
        &self,
        uid: UserId,
        task_id: &TaskId,
        update: &HistoryUpdate,
    ) -> Result<(), StoreError> {
        self.inner.update_history_record(uid, task_id, update)
    }
}
