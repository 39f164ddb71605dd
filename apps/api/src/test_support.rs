//! In-memory implementations of every trait seam, for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use redis::{ErrorKind, RedisError, RedisResult};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::audit::SystemLog;
use crate::billing::ledger::{NewWebhookEvent, WebhookLedger};
use crate::billing::{BillingDeps, BillingService};
use crate::config::{ExportConfig, WebhookConfig};
use crate::errors::AppError;
use crate::exports::{ExportDeps, ExportService, ExportStore};
use crate::mailer::{Mailer, OutgoingEmail};
use crate::models::audit::{LogEntry, SystemLogRow};
use crate::models::billing::{AppliedAction, BillingWebhookEventRow, Provider, WebhookStatus};
use crate::models::export::{ExportJobRow, ExportStatus, ResumeSnapshotRow};
use crate::models::user::{Account, Plan, PlanTier, PlanUsageLimits};
use crate::plans::PlanDirectory;
use crate::queue::{
    JobHandler, JobOptions, JobPayload, JobQueue, QueueName, QueuedJob, RenderJob,
};
use crate::rate_limit::{CounterStore, RateLimiter, WindowCount, EMAIL_RETRY, WEBHOOK_REPLAY};
use crate::render::PdfRenderer;
use crate::storage::{validate_key, ObjectStorage, StorageError, StoredObject, UploadOptions};

// ────────────────────────────────────────────
// Rate limiting
// ────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryCounterStore {
    counts: Mutex<HashMap<String, u64>>,
    unavailable: AtomicBool,
    increments: AtomicU64,
}

impl MemoryCounterStore {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn increments(&self) -> u64 {
        self.increments.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window_secs: u64) -> RedisResult<WindowCount> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RedisError::from((
                ErrorKind::IoError,
                "counter store unavailable",
            )));
        }
        self.increments.fetch_add(1, Ordering::SeqCst);
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        Ok(WindowCount {
            count: *count,
            ttl_secs: window_secs as i64,
        })
    }
}

// ────────────────────────────────────────────
// Job queue
// ────────────────────────────────────────────

#[derive(Default)]
struct QueueState {
    wait: VecDeque<QueuedJob>,
    active: Vec<QueuedJob>,
    delayed: Vec<(QueuedJob, Duration)>,
    completed: Vec<QueuedJob>,
    buried: Vec<QueuedJob>,
}

impl QueueState {
    fn take_active(&mut self, id: Uuid) {
        self.active.retain(|job| job.id != id);
    }
}

pub struct MemoryJobQueue {
    options: JobOptions,
    state: Mutex<QueueState>,
    unavailable: AtomicBool,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::with_options(JobOptions {
            attempts: 3,
            backoff_ms: 10,
        })
    }
}

impl MemoryJobQueue {
    pub fn with_options(options: JobOptions) -> Self {
        Self {
            options,
            state: Mutex::new(QueueState::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Payloads waiting to be reserved, oldest first.
    pub fn pending(&self) -> Vec<JobPayload> {
        let state = self.state.lock().unwrap();
        state.wait.iter().map(|job| job.payload.clone()).collect()
    }

    /// Removes and returns every waiting payload.
    pub fn drain(&self) -> Vec<JobPayload> {
        let mut state = self.state.lock().unwrap();
        state.wait.drain(..).map(|job| job.payload).collect()
    }

    pub fn completed(&self) -> Vec<QueuedJob> {
        self.state.lock().unwrap().completed.clone()
    }

    pub fn buried(&self) -> Vec<QueuedJob> {
        self.state.lock().unwrap().buried.clone()
    }

    pub fn delayed(&self) -> Vec<(QueuedJob, Duration)> {
        self.state.lock().unwrap().delayed.clone()
    }

    /// Makes every delayed job ready immediately.
    pub fn release_delayed(&self) {
        let mut state = self.state.lock().unwrap();
        let delayed: Vec<_> = state.delayed.drain(..).collect();
        for (job, _) in delayed {
            state.wait.push_back(job);
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, payload: JobPayload) -> Result<Uuid, AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Queue(RedisError::from((
                ErrorKind::IoError,
                "queue unavailable",
            ))));
        }
        let job = QueuedJob::new(payload, self.options);
        let id = job.id;
        self.state.lock().unwrap().wait.push_back(job);
        Ok(id)
    }

    async fn reserve(&self, queue: QueueName) -> Result<Option<QueuedJob>, AppError> {
        let mut state = self.state.lock().unwrap();
        let Some(index) = state
            .wait
            .iter()
            .position(|job| job.payload.queue() == queue)
        else {
            return Ok(None);
        };
        let job = state.wait.remove(index);
        if let Some(job) = &job {
            state.active.push(job.clone());
        }
        Ok(job)
    }

    async fn complete(&self, job: &QueuedJob) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        state.take_active(job.id);
        state.completed.push(job.clone());
        Ok(())
    }

    async fn retry_later(&self, job: &QueuedJob, delay: Duration) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        state.take_active(job.id);
        state.delayed.push((job.clone(), delay));
        Ok(())
    }

    async fn bury(&self, job: &QueuedJob) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        state.take_active(job.id);
        state.buried.push(job.clone());
        Ok(())
    }
}

enum Script {
    Succeed,
    Fail(String),
    Panic,
}

pub struct ScriptedHandler {
    script: Script,
    calls: AtomicUsize,
    exhausted: Mutex<Vec<String>>,
}

impl ScriptedHandler {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            exhausted: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::with_script(Script::Succeed)
    }

    /// Fails every attempt with an upstream (retryable) error.
    pub fn failing(message: &str) -> Self {
        Self::with_script(Script::Fail(message.to_string()))
    }

    pub fn panicking() -> Self {
        Self::with_script(Script::Panic)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn exhausted(&self) -> Vec<String> {
        self.exhausted.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn handle(&self, _payload: &JobPayload) -> Result<(), AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Succeed => Ok(()),
            Script::Fail(message) => Err(AppError::Upstream(message.clone())),
            Script::Panic => panic!("scripted handler panic"),
        }
    }

    async fn on_exhausted(&self, _payload: &JobPayload, error: &str) {
        self.exhausted.lock().unwrap().push(error.to_string());
    }
}

// ────────────────────────────────────────────
// System log
// ────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySystemLog {
    rows: Mutex<Vec<SystemLogRow>>,
}

impl MemorySystemLog {
    pub fn insert_at(&self, action: &str, created_at: DateTime<Utc>) -> SystemLogRow {
        let row = SystemLogRow {
            id: Uuid::new_v4(),
            action: action.to_string(),
            user_id: None,
            metadata: json!({}),
            created_at,
        };
        self.rows.lock().unwrap().push(row.clone());
        row
    }

    pub fn rows(&self, action: &str) -> Vec<SystemLogRow> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.action == action)
            .cloned()
            .collect()
    }

    pub fn count(&self, action: &str) -> usize {
        self.rows(action).len()
    }
}

#[async_trait]
impl SystemLog for MemorySystemLog {
    async fn record(&self, entry: LogEntry) -> Result<SystemLogRow, AppError> {
        let row = SystemLogRow {
            id: Uuid::new_v4(),
            action: entry.action,
            user_id: entry.user_id,
            metadata: entry.metadata,
            created_at: Utc::now(),
        };
        self.rows.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn find(&self, id: Uuid) -> Result<Option<SystemLogRow>, AppError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.id == id)
            .cloned())
    }

    async fn count_between(
        &self,
        action: &str,
        user_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.action == action)
            .filter(|row| user_id.is_none() || row.user_id == user_id)
            .filter(|row| row.created_at >= start && row.created_at < end)
            .count() as i64)
    }

    async fn latest(&self, action: &str) -> Result<Option<SystemLogRow>, AppError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.action == action)
            .max_by_key(|row| row.created_at)
            .cloned())
    }
}

// ────────────────────────────────────────────
// Plans and accounts
// ────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryPlanDirectory {
    plans: Mutex<HashMap<Uuid, (Plan, PlanUsageLimits)>>,
    accounts: Mutex<HashMap<Uuid, Account>>,
    changes: Mutex<Vec<(Uuid, Uuid)>>,
    scheduled: Mutex<Vec<(Uuid, Uuid, DateTime<Utc>)>>,
    failing_changes: AtomicBool,
}

impl MemoryPlanDirectory {
    pub fn add_plan(&self, code: &str, tier: PlanTier, limits: PlanUsageLimits) -> Uuid {
        let plan = Plan {
            id: Uuid::new_v4(),
            code: code.to_string(),
            tier,
        };
        let id = plan.id;
        self.plans.lock().unwrap().insert(id, (plan, limits));
        id
    }

    pub fn add_account(&self, user_id: Uuid, email: &str, plan_id: Option<Uuid>) {
        let plan = plan_id.and_then(|id| self.plans.lock().unwrap().get(&id).map(|(p, _)| p.clone()));
        self.accounts.lock().unwrap().insert(
            user_id,
            Account {
                user_id,
                email: email.to_string(),
                plan,
            },
        );
    }

    pub fn clear_plan(&self, user_id: Uuid) {
        if let Some(account) = self.accounts.lock().unwrap().get_mut(&user_id) {
            account.plan = None;
        }
    }

    pub fn set_failing_changes(&self, failing: bool) {
        self.failing_changes.store(failing, Ordering::SeqCst);
    }

    pub fn plan_changes(&self) -> Vec<(Uuid, Uuid)> {
        self.changes.lock().unwrap().clone()
    }

    pub fn scheduled_changes(&self) -> Vec<(Uuid, Uuid, DateTime<Utc>)> {
        self.scheduled.lock().unwrap().clone()
    }

    fn check_change(&self, user_id: Uuid) -> Result<(), AppError> {
        if self.failing_changes.load(Ordering::SeqCst) {
            return Err(AppError::Upstream("plan store unavailable".to_string()));
        }
        if !self.accounts.lock().unwrap().contains_key(&user_id) {
            return Err(AppError::NotFound(format!("User {user_id} not found")));
        }
        Ok(())
    }
}

#[async_trait]
impl PlanDirectory for MemoryPlanDirectory {
    async fn find_account(&self, user_id: Uuid) -> Result<Option<Account>, AppError> {
        Ok(self.accounts.lock().unwrap().get(&user_id).cloned())
    }

    async fn limits_for_plan(&self, plan_id: Uuid) -> Result<Option<PlanUsageLimits>, AppError> {
        Ok(self
            .plans
            .lock()
            .unwrap()
            .get(&plan_id)
            .map(|(_, limits)| limits.clone()))
    }

    async fn resolve_plan_code(&self, code: &str) -> Result<Option<Uuid>, AppError> {
        Ok(self
            .plans
            .lock()
            .unwrap()
            .values()
            .find(|(plan, _)| plan.code.eq_ignore_ascii_case(code))
            .map(|(plan, _)| plan.id))
    }

    async fn change_plan_now(&self, user_id: Uuid, plan_id: Uuid) -> Result<(), AppError> {
        self.check_change(user_id)?;
        let plan = self
            .plans
            .lock()
            .unwrap()
            .get(&plan_id)
            .map(|(plan, _)| plan.clone());
        if let Some(account) = self.accounts.lock().unwrap().get_mut(&user_id) {
            account.plan = plan;
        }
        self.changes.lock().unwrap().push((user_id, plan_id));
        Ok(())
    }

    async fn schedule_plan_change(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        effective_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.check_change(user_id)?;
        self.scheduled
            .lock()
            .unwrap()
            .push((user_id, plan_id, effective_at));
        Ok(())
    }
}

// ────────────────────────────────────────────
// Exports
// ────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryExportStore {
    resumes: Mutex<HashMap<Uuid, (Uuid, Value)>>,
    snapshots: Mutex<HashMap<Uuid, ResumeSnapshotRow>>,
    exports: Mutex<Vec<ExportJobRow>>,
    failing_ready: AtomicBool,
}

impl MemoryExportStore {
    pub fn set_failing_ready(&self, failing: bool) {
        self.failing_ready.store(failing, Ordering::SeqCst);
    }

    pub fn add_resume(&self, user_id: Uuid, content: Value) -> Uuid {
        let id = Uuid::new_v4();
        self.resumes.lock().unwrap().insert(id, (user_id, content));
        id
    }

    /// Inserts an export already in `status`, with the columns that status implies.
    pub fn insert_export(&self, user_id: Uuid, status: ExportStatus) -> ExportJobRow {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let ready = status == ExportStatus::Ready;
        let row = ExportJobRow {
            id,
            user_id,
            resume_id: Uuid::new_v4(),
            snapshot_id: Uuid::new_v4(),
            status: status.as_str().to_string(),
            storage_key: ready.then(|| format!("{user_id}/fixture/exports/{id}.pdf")),
            size_bytes: ready.then_some(1024),
            error: (status == ExportStatus::Failed).then(|| "fixture failure".to_string()),
            expires_at: ready.then(|| now + chrono::Duration::hours(24)),
            created_at: now,
            updated_at: now,
        };
        self.exports.lock().unwrap().push(row.clone());
        row
    }

    pub fn export_count(&self) -> usize {
        self.exports.lock().unwrap().len()
    }

    pub fn exports(&self) -> Vec<ExportJobRow> {
        self.exports.lock().unwrap().clone()
    }

    pub fn export(&self, id: Uuid) -> Option<ExportJobRow> {
        self.exports
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.id == id)
            .cloned()
    }

    pub fn snapshot(&self, id: Uuid) -> Option<ResumeSnapshotRow> {
        self.snapshots.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl ExportStore for MemoryExportStore {
    async fn create_snapshot(
        &self,
        user_id: Uuid,
        resume_id: Uuid,
    ) -> Result<ResumeSnapshotRow, AppError> {
        let content = match self.resumes.lock().unwrap().get(&resume_id) {
            Some((owner, content)) if *owner == user_id => content.clone(),
            _ => return Err(AppError::NotFound(format!("Resume {resume_id} not found"))),
        };
        let snapshot = ResumeSnapshotRow {
            id: Uuid::new_v4(),
            resume_id,
            user_id,
            content,
            created_at: Utc::now(),
        };
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.id, snapshot.clone());
        Ok(snapshot)
    }

    async fn find_snapshot(&self, id: Uuid) -> Result<Option<ResumeSnapshotRow>, AppError> {
        Ok(self.snapshot(id))
    }

    async fn create_export(
        &self,
        user_id: Uuid,
        resume_id: Uuid,
        snapshot_id: Uuid,
    ) -> Result<ExportJobRow, AppError> {
        let now = Utc::now();
        let row = ExportJobRow {
            id: Uuid::new_v4(),
            user_id,
            resume_id,
            snapshot_id,
            status: ExportStatus::Pending.as_str().to_string(),
            storage_key: None,
            size_bytes: None,
            error: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        self.exports.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn find_export(&self, id: Uuid) -> Result<Option<ExportJobRow>, AppError> {
        Ok(self.export(id))
    }

    async fn mark_ready(
        &self,
        id: Uuid,
        storage_key: &str,
        size_bytes: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<ExportJobRow>, AppError> {
        if self.failing_ready.load(Ordering::SeqCst) {
            return Err(AppError::Internal(anyhow::anyhow!("export store unavailable")));
        }
        let mut exports = self.exports.lock().unwrap();
        let Some(row) = exports
            .iter_mut()
            .find(|row| row.id == id && !row.is_ready())
        else {
            return Ok(None);
        };
        row.status = ExportStatus::Ready.as_str().to_string();
        row.storage_key = Some(storage_key.to_string());
        row.size_bytes = Some(size_bytes);
        row.expires_at = Some(expires_at);
        row.error = None;
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<Option<ExportJobRow>, AppError> {
        let mut exports = self.exports.lock().unwrap();
        let Some(row) = exports
            .iter_mut()
            .find(|row| row.id == id && !row.is_ready())
        else {
            return Ok(None);
        };
        row.status = ExportStatus::Failed.as_str().to_string();
        row.error = Some(error.to_string());
        row.storage_key = None;
        row.size_bytes = None;
        row.expires_at = None;
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn count_active_exports(&self, user_id: Uuid) -> Result<i64, AppError> {
        Ok(self
            .exports
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.user_id == user_id && row.status() != ExportStatus::Failed)
            .count() as i64)
    }

    async fn count_created_between(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        Ok(self
            .exports
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.user_id == user_id)
            .filter(|row| row.created_at >= start && row.created_at < end)
            .count() as i64)
    }

    async fn ready_bytes_between(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        Ok(self
            .exports
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.user_id == user_id && row.is_ready())
            .filter(|row| row.updated_at >= start && row.updated_at < end)
            .filter_map(|row| row.size_bytes)
            .sum())
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExportJobRow>, AppError> {
        Ok(self
            .exports
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.expires_at.is_some_and(|at| at <= now))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn delete_export(&self, id: Uuid) -> Result<bool, AppError> {
        let mut exports = self.exports.lock().unwrap();
        let before = exports.len();
        exports.retain(|row| row.id != id);
        Ok(exports.len() < before)
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload_buffer(
        &self,
        bytes: Bytes,
        key: &str,
        _options: UploadOptions,
    ) -> Result<StoredObject, StorageError> {
        validate_key(key)?;
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(StoredObject {
            key: key.to_string(),
            url: format!("memory://{key}"),
        })
    }

    async fn signed_download_url(&self, key: &str, ttl_secs: u64) -> Result<String, StorageError> {
        validate_key(key)?;
        Ok(format!("memory://{key}?ttl={ttl_secs}"))
    }

    async fn read_object(&self, key: &str) -> Result<Bytes, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

pub struct StubRenderer {
    output: Mutex<Bytes>,
    failure: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl Default for StubRenderer {
    fn default() -> Self {
        Self {
            output: Mutex::new(Bytes::from_static(b"%PDF-1.7 stub")),
            failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }
}

impl StubRenderer {
    pub fn set_output(&self, output: Bytes) {
        *self.output.lock().unwrap() = output;
    }

    pub fn set_failure(&self, failure: Option<&str>) {
        *self.failure.lock().unwrap() = failure.map(String::from);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PdfRenderer for StubRenderer {
    async fn render_pdf(&self, _html: &str) -> Result<Bytes, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(AppError::Upstream(message));
        }
        Ok(self.output.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    failing: AtomicBool,
}

impl RecordingMailer {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Upstream("mail relay returned 503".to_string()));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

pub struct ExportFixture {
    pub service: ExportService,
    pub store: Arc<MemoryExportStore>,
    pub plans: Arc<MemoryPlanDirectory>,
    pub queue: Arc<MemoryJobQueue>,
    pub storage: Arc<MemoryStorage>,
    pub renderer: Arc<StubRenderer>,
    pub mailer: Arc<RecordingMailer>,
    pub log: Arc<MemorySystemLog>,
    pub user_id: Uuid,
    pub resume_id: Uuid,
    pub email: String,
}

impl ExportFixture {
    pub fn new(tier: PlanTier, limits: PlanUsageLimits) -> Self {
        Self::with_retry_limit(tier, limits, 100)
    }

    pub fn with_retry_limit(tier: PlanTier, limits: PlanUsageLimits, retry_limit: u64) -> Self {
        let store = Arc::new(MemoryExportStore::default());
        let plans = Arc::new(MemoryPlanDirectory::default());
        let queue = Arc::new(MemoryJobQueue::default());
        let storage = Arc::new(MemoryStorage::default());
        let renderer = Arc::new(StubRenderer::default());
        let mailer = Arc::new(RecordingMailer::default());
        let log = Arc::new(MemorySystemLog::default());
        let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::default()))
            .with_rule(EMAIL_RETRY, retry_limit, 3600);

        let user_id = Uuid::new_v4();
        let email = "ada@example.com".to_string();
        let plan_id = plans.add_plan(tier_code(tier), tier, limits);
        plans.add_account(user_id, &email, Some(plan_id));
        let resume_id = store.add_resume(
            user_id,
            json!({
                "basics": { "name": "Ada Lovelace", "email": email },
                "sections": [],
            }),
        );

        let service = ExportService::new(
            ExportDeps {
                store: store.clone(),
                plans: plans.clone(),
                queue: queue.clone(),
                storage: storage.clone(),
                renderer: renderer.clone(),
                mailer: mailer.clone(),
                log: log.clone(),
                limiter,
            },
            ExportConfig {
                free_ttl_hours: 24,
                paid_ttl_hours: 168,
                download_url_ttl_secs: 900,
            },
        );

        Self {
            service,
            store,
            plans,
            queue,
            storage,
            renderer,
            mailer,
            log,
            user_id,
            resume_id,
            email,
        }
    }

    /// Requests an export and takes its render job off the queue.
    pub async fn render_job(&self) -> RenderJob {
        let ticket = self
            .service
            .enqueue_export(self.user_id, self.resume_id)
            .await
            .unwrap();
        self.queue
            .drain()
            .into_iter()
            .find_map(|payload| match payload {
                JobPayload::Render(job) if job.export_id == ticket.export_id => Some(job),
                _ => None,
            })
            .expect("render job queued")
    }
}

fn tier_code(tier: PlanTier) -> &'static str {
    match tier {
        PlanTier::Free => "FREE",
        PlanTier::Pro => "PRO",
        PlanTier::Team => "TEAM",
    }
}

// ────────────────────────────────────────────
// Billing
// ────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryLedger {
    rows: Mutex<Vec<BillingWebhookEventRow>>,
}

impl MemoryLedger {
    pub fn rows(&self) -> Vec<BillingWebhookEventRow> {
        self.rows.lock().unwrap().clone()
    }

    fn transition<F>(&self, id: Uuid, from: WebhookStatus, apply: F) -> Option<BillingWebhookEventRow>
    where
        F: FnOnce(&mut BillingWebhookEventRow),
    {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|row| row.id == id && row.status() == from)?;
        apply(row);
        row.updated_at = Utc::now();
        Some(row.clone())
    }
}

#[async_trait]
impl WebhookLedger for MemoryLedger {
    async fn insert_if_absent(
        &self,
        event: &NewWebhookEvent,
    ) -> Result<Option<BillingWebhookEventRow>, AppError> {
        let mut rows = self.rows.lock().unwrap();
        let exists = rows.iter().any(|row| {
            row.provider == event.provider.as_str()
                && row.external_event_id == event.external_event_id
        });
        if exists {
            return Ok(None);
        }
        let now = Utc::now();
        let row = BillingWebhookEventRow {
            id: Uuid::new_v4(),
            provider: event.provider.as_str().to_string(),
            external_event_id: event.external_event_id.clone(),
            event_type: event.event_type.as_str().to_string(),
            signature: event.signature.clone(),
            payload: event.payload.clone(),
            user_id: event.user_id,
            status: WebhookStatus::Processing.as_str().to_string(),
            applied_action: AppliedAction::None.as_str().to_string(),
            error: None,
            replay_count: 0,
            created_at: now,
            updated_at: now,
        };
        rows.push(row.clone());
        Ok(Some(row))
    }

    async fn find_by_external_id(
        &self,
        provider: Provider,
        external_event_id: &str,
    ) -> Result<Option<BillingWebhookEventRow>, AppError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|row| {
                row.provider == provider.as_str() && row.external_event_id == external_event_id
            })
            .cloned())
    }

    async fn find(&self, id: Uuid) -> Result<Option<BillingWebhookEventRow>, AppError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.id == id)
            .cloned())
    }

    async fn reclaim_failed(&self, id: Uuid) -> Result<Option<BillingWebhookEventRow>, AppError> {
        Ok(self.transition(id, WebhookStatus::Failed, |row| {
            row.status = WebhookStatus::Processing.as_str().to_string();
            row.error = None;
            row.replay_count += 1;
        }))
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        applied: AppliedAction,
    ) -> Result<Option<BillingWebhookEventRow>, AppError> {
        Ok(self.transition(id, WebhookStatus::Processing, |row| {
            row.status = WebhookStatus::Processed.as_str().to_string();
            row.applied_action = applied.as_str().to_string();
            row.error = None;
        }))
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<Option<BillingWebhookEventRow>, AppError> {
        Ok(self.transition(id, WebhookStatus::Processing, |row| {
            row.status = WebhookStatus::Failed.as_str().to_string();
            row.error = Some(reason.to_string());
        }))
    }
}

pub struct BillingFixture {
    pub service: BillingService,
    pub ledger: Arc<MemoryLedger>,
    pub plans: Arc<MemoryPlanDirectory>,
    pub log: Arc<MemorySystemLog>,
    pub user_id: Uuid,
    pub free_plan: Uuid,
    pub pro_plan: Uuid,
}

impl BillingFixture {
    pub const STRIPE_SECRET: &'static str = "whsec_test";
    pub const LEMON_SECRET: &'static str = "ls_test";

    pub fn new() -> Self {
        let ledger = Arc::new(MemoryLedger::default());
        let plans = Arc::new(MemoryPlanDirectory::default());
        let log = Arc::new(MemorySystemLog::default());
        let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::default()))
            .with_rule(WEBHOOK_REPLAY, 100, 3600);

        let free_plan = plans.add_plan("FREE", PlanTier::Free, PlanUsageLimits::default());
        let pro_plan = plans.add_plan("PRO", PlanTier::Pro, PlanUsageLimits::default());
        let user_id = Uuid::new_v4();
        plans.add_account(user_id, "ada@example.com", Some(free_plan));

        let service = BillingService::new(
            BillingDeps {
                ledger: ledger.clone(),
                plans: plans.clone(),
                log: log.clone(),
                limiter,
            },
            WebhookConfig {
                stripe_secret: Some(Self::STRIPE_SECRET.to_string()),
                lemonsqueezy_secret: Some(Self::LEMON_SECRET.to_string()),
                stripe_tolerance_secs: 300,
            },
        );

        Self {
            service,
            ledger,
            plans,
            log,
            user_id,
            free_plan,
            pro_plan,
        }
    }
}
