//! 作业生命周期 - 业务能力层
//!
//! 状态机：`pending → processing → {completed | failed}`，终态不可再迁移。
//!
//! - 每个作业有一把迁移锁：读取、检查、写回在锁内完成，
//!   并发的 complete / fail 只有第一个生效，其余返回 [`JobError::AlreadyTerminal`]
//! - 每个对象有一把持久化锁：读取上一份权威记录 → 合并 → complete 在锁内完成，
//!   同一对象的并发作业不会互相丢结果
//! - 查询直接读存储；存储按整条记录替换，读者看不到写了一半的记录

use chrono::Utc;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppResult, JobError};
use crate::infrastructure::JobStore;
use crate::models::candidate::{
    requires_manual_review, AuthoritativeRecord, CandidateFieldSet, CandidateSource,
};
use crate::models::job::{
    Job, JobId, JobState, JobStatusView, PipelineStage, RawInput, ResultLookup, StatusLookup,
};

/// 分配 ID 的最大尝试次数
const MAX_ID_ATTEMPTS: usize = 8;

/// 作业生命周期管理
///
/// 职责：
/// - 唯一修改作业记录的入口
/// - 保证状态只向前迁移、终态只写一次
/// - 按对象隔离查询（作业只对创建它的对象可见）
pub struct JobManager {
    store: Arc<dyn JobStore>,
    transition_locks: Arc<KeyedLocks<JobId>>,
    subject_locks: Arc<KeyedLocks<String>>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            transition_locks: KeyedLocks::new(),
            subject_locks: KeyedLocks::new(),
        }
    }

    // ========== 状态迁移 ==========

    /// 创建 pending 作业
    pub async fn create(
        &self,
        subject_id: &str,
        raw_input: RawInput,
        source: CandidateSource,
    ) -> AppResult<JobId> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = Uuid::new_v4();
            let _guard = self.lock_job(id).await;
            if self.store.load_job(id).await?.is_some() {
                warn!("⚠️ 作业 ID 冲突，重新分配: {}", id);
                continue;
            }
            let job = Job::new(id, subject_id, raw_input, source, Utc::now());
            self.store.save_job(&job).await?;
            info!(
                "[作业 {} 对象 {}] 📥 已创建 ({})",
                short_id(id),
                subject_id,
                job.raw_input.describe()
            );
            return Ok(id);
        }
        Err(JobError::IdExhausted {
            attempts: MAX_ID_ATTEMPTS,
        }
        .into())
    }

    /// `pending → processing`
    pub async fn begin_processing(&self, id: JobId) -> AppResult<()> {
        self.transition(id, "begin_processing", |job| match job.state {
            JobState::Pending => {
                job.state = JobState::Processing;
                job.stage = Some(PipelineStage::Converting);
                Ok(())
            }
            _ => Err(rejection(job, "begin_processing")),
        })
        .await
        .map(|_| ())
    }

    /// processing 内部推进阶段，只能向前
    pub async fn advance_stage(&self, id: JobId, stage: PipelineStage) -> AppResult<()> {
        self.transition(id, "advance_stage", |job| {
            let forward = job.stage.map_or(true, |current| stage >= current);
            if job.state == JobState::Processing && forward {
                job.stage = Some(stage);
                Ok(())
            } else {
                Err(rejection(job, "advance_stage"))
            }
        })
        .await
        .map(|_| ())
    }

    /// 记录最近一次抽取得到的候选集
    pub async fn attach_candidate(&self, id: JobId, candidate: CandidateFieldSet) -> AppResult<()> {
        self.transition(id, "attach_candidate", |job| {
            if job.state == JobState::Processing {
                job.candidate = Some(candidate);
                Ok(())
            } else {
                Err(rejection(job, "attach_candidate"))
            }
        })
        .await
        .map(|_| ())
    }

    /// `processing → completed`，写入合并结果并计算整体置信度
    pub async fn complete(&self, id: JobId, record: AuthoritativeRecord) -> AppResult<()> {
        let job = self
            .transition(id, "complete", |job| {
                if job.state != JobState::Processing {
                    return Err(rejection(job, "complete"));
                }
                let now = Utc::now();
                job.overall_confidence = record.overall_confidence();
                job.requires_manual_review = requires_manual_review(job.overall_confidence);
                job.record = Some(record);
                job.state = JobState::Completed;
                job.stage = None;
                job.processed_at = Some(now);
                Ok(())
            })
            .await?;

        info!(
            "[作业 {} 对象 {}] ✅ 完成 (整体置信度 {:.2}{})",
            short_id(id),
            job.subject_id,
            job.overall_confidence,
            if job.requires_manual_review {
                ", 需人工复核"
            } else {
                ""
            }
        );
        Ok(())
    }

    /// `* → failed`，保留已有的部分结果
    pub async fn fail(&self, id: JobId, description: &str) -> AppResult<()> {
        let job = self
            .transition(id, "fail", |job| {
                if job.state.is_terminal() {
                    return Err(rejection(job, "fail"));
                }
                job.state = JobState::Failed;
                job.error = Some(description.to_string());
                Ok(())
            })
            .await?;

        warn!(
            "[作业 {} 对象 {}] ❌ 失败: {}",
            short_id(id),
            job.subject_id,
            description
        );
        Ok(())
    }

    /// 给失败作业追加错误信息
    pub async fn attach_error(&self, id: JobId, text: &str) -> AppResult<()> {
        self.transition(id, "attach_error", |job| {
            if job.state != JobState::Failed {
                return Err(rejection(job, "attach_error"));
            }
            job.error = Some(match job.error.take() {
                Some(existing) if !existing.is_empty() => format!("{}; {}", existing, text),
                _ => text.to_string(),
            });
            Ok(())
        })
        .await
        .map(|_| ())
    }

    // ========== 查询 ==========

    /// 查询状态；不属于 `requester` 的作业视为不存在
    pub async fn get_status(&self, id: JobId, requester: &str) -> AppResult<StatusLookup> {
        Ok(match self.owned_job(id, requester).await? {
            Some(job) => StatusLookup::Found(job.status_view()),
            None => StatusLookup::NotFound,
        })
    }

    /// 查询结果；未到终态时返回 NotReady
    pub async fn get_result(&self, id: JobId, requester: &str) -> AppResult<ResultLookup> {
        Ok(match self.owned_job(id, requester).await? {
            Some(job) if job.state.is_terminal() => ResultLookup::Ready(job.result_view()),
            Some(job) => ResultLookup::NotReady(job.status_view()),
            None => ResultLookup::NotFound,
        })
    }

    /// 对象的全部作业，最新的在前
    pub async fn jobs_for_subject(&self, subject_id: &str) -> AppResult<Vec<JobStatusView>> {
        let mut jobs = self.store.find_by_subject(subject_id).await?;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs.iter().map(Job::status_view).collect())
    }

    /// 对象当前的权威记录：最近完成的作业的合并结果
    pub async fn latest_record(&self, subject_id: &str) -> AppResult<Option<AuthoritativeRecord>> {
        let jobs = self.store.find_by_subject(subject_id).await?;
        Ok(jobs
            .into_iter()
            .filter(|job| job.state == JobState::Completed)
            .max_by_key(|job| job.processed_at)
            .and_then(|job| job.record))
    }

    /// 获取对象的持久化锁
    ///
    /// 持有期间同一对象的其它作业不能读取上一份记录
    pub async fn lock_subject(&self, subject_id: &str) -> KeyedLockGuard<String> {
        self.subject_locks.acquire(subject_id.to_string()).await
    }

    // ========== 内部实现 ==========

    /// 在作业锁内读取 → 修改 → 写回，返回写回后的记录
    async fn transition<F>(&self, id: JobId, action: &'static str, mutate: F) -> AppResult<Job>
    where
        F: FnOnce(&mut Job) -> Result<(), JobError>,
    {
        let _guard = self.lock_job(id).await;
        let mut job = self
            .store
            .load_job(id)
            .await?
            .ok_or(JobError::NotFound(id))?;

        mutate(&mut job)?;
        job.updated_at = Utc::now().max(job.updated_at);
        self.store.save_job(&job).await?;

        debug!(
            "[作业 {}] {} → {} ({})",
            short_id(id),
            action,
            job.state,
            job.stage.map(PipelineStage::as_str).unwrap_or("-")
        );
        Ok(job)
    }

    async fn lock_job(&self, id: JobId) -> KeyedLockGuard<JobId> {
        self.transition_locks.acquire(id).await
    }

    async fn owned_job(&self, id: JobId, requester: &str) -> AppResult<Option<Job>> {
        Ok(self
            .store
            .load_job(id)
            .await?
            .filter(|job| job.subject_id == requester))
    }
}

fn rejection(job: &Job, action: &'static str) -> JobError {
    if job.state.is_terminal() {
        JobError::AlreadyTerminal {
            job_id: job.id,
            state: job.state.to_string(),
        }
    } else {
        JobError::InvalidTransition {
            job_id: job.id,
            from: job.state.to_string(),
            action,
        }
    }
}

/// 按键分配的互斥锁表
///
/// 条目在最后一个持有者（或等待者）离开时删除，锁表大小只取决于在用的键
struct KeyedLocks<K> {
    table: std::sync::Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            table: std::sync::Mutex::new(HashMap::new()),
        })
    }

    async fn acquire(self: &Arc<Self>, key: K) -> KeyedLockGuard<K> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.clone().lock_owned().await;
        KeyedLockGuard {
            guard: Some(guard),
            lock,
            key,
            locks: Arc::clone(self),
        }
    }

    fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// [`JobManager::lock_subject`] 返回的锁；释放时清理锁表
pub struct KeyedLockGuard<K: Eq + Hash> {
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<Mutex<()>>,
    key: K,
    locks: Arc<KeyedLocks<K>>,
}

impl<K: Eq + Hash> Drop for KeyedLockGuard<K> {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self
            .locks
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // 只剩锁表和本守卫引用时没有其它等待者；新的获取者必须先拿到锁表
        if Arc::strong_count(&self.lock) == 2 {
            table.remove(&self.key);
        }
    }
}

/// 日志用的短 ID
pub fn short_id(id: JobId) -> String {
    id.simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::infrastructure::InMemoryJobStore;
    use crate::models::field::{FieldName, FieldValues};
    use crate::models::candidate::{ConfidenceMap, FieldSources};

    fn manager() -> Arc<JobManager> {
        Arc::new(JobManager::new(Arc::new(InMemoryJobStore::new())))
    }

    fn transcript() -> RawInput {
        RawInput::Transcript("my name is Ann Lee".to_string())
    }

    fn record(confidence: f64) -> AuthoritativeRecord {
        let mut fields = FieldValues::new();
        fields.set(FieldName::FirstName, "Ann");
        let mut map = ConfidenceMap::new();
        map.insert(FieldName::FirstName, confidence);
        AuthoritativeRecord::from_maps(&fields, &map, &FieldSources::new(), None)
    }

    fn is_already_terminal(result: AppResult<()>) -> bool {
        matches!(result, Err(AppError::Job(JobError::AlreadyTerminal { .. })))
    }

    #[tokio::test]
    async fn test_happy_path() {
        let jobs = manager();
        let id = jobs.create("s1", transcript(), CandidateSource::PostCall).await.unwrap();

        match jobs.get_result(id, "s1").await.unwrap() {
            ResultLookup::NotReady(view) => {
                assert_eq!(view.state, JobState::Pending);
                assert_eq!(view.progress_hint, 25);
            }
            other => panic!("unexpected lookup: {:?}", other),
        }

        jobs.begin_processing(id).await.unwrap();
        jobs.advance_stage(id, PipelineStage::Recognizing).await.unwrap();
        jobs.complete(id, record(0.9)).await.unwrap();

        match jobs.get_result(id, "s1").await.unwrap() {
            ResultLookup::Ready(view) => {
                assert_eq!(view.state, JobState::Completed);
                assert_eq!(view.fields.get(FieldName::FirstName), Some("Ann"));
                assert!((view.overall_confidence - 0.9).abs() < 1e-9);
                assert!(!view.requires_manual_review);
            }
            other => panic!("unexpected lookup: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_low_confidence_sets_review_flag() {
        let jobs = manager();
        let id = jobs.create("s1", transcript(), CandidateSource::PostCall).await.unwrap();
        jobs.begin_processing(id).await.unwrap();
        jobs.complete(id, record(0.3)).await.unwrap();

        let ResultLookup::Ready(view) = jobs.get_result(id, "s1").await.unwrap() else {
            panic!("job should be ready");
        };
        assert!(view.requires_manual_review);
    }

    #[tokio::test]
    async fn test_double_dispatch_is_rejected() {
        let jobs = manager();
        let id = jobs.create("s1", transcript(), CandidateSource::PostCall).await.unwrap();
        jobs.begin_processing(id).await.unwrap();
        assert!(matches!(
            jobs.begin_processing(id).await,
            Err(AppError::Job(JobError::InvalidTransition { .. }))
        ));
    }

    #[tokio::test]
    async fn test_terminal_state_never_changes() {
        let jobs = manager();
        let id = jobs.create("s1", transcript(), CandidateSource::PostCall).await.unwrap();
        jobs.begin_processing(id).await.unwrap();
        jobs.complete(id, record(0.9)).await.unwrap();

        assert!(is_already_terminal(jobs.fail(id, "late timeout").await));
        assert!(is_already_terminal(jobs.complete(id, record(0.1)).await));

        let ResultLookup::Ready(view) = jobs.get_result(id, "s1").await.unwrap() else {
            panic!("job should be ready");
        };
        assert_eq!(view.state, JobState::Completed);
        assert!(view.error.is_none());
        assert!((view.overall_confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_racing_terminal_writers_resolve_once() {
        let jobs = manager();
        let id = jobs.create("s1", transcript(), CandidateSource::PostCall).await.unwrap();
        jobs.begin_processing(id).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let jobs = jobs.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    jobs.complete(id, record(0.8)).await
                } else {
                    jobs.fail(id, "timeout").await
                }
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => winners += 1,
                Err(e) => assert!(matches!(e, AppError::Job(JobError::AlreadyTerminal { .. }))),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_fail_keeps_partial_candidate_and_accepts_error_notes() {
        let jobs = manager();
        let id = jobs.create("s1", transcript(), CandidateSource::PostCall).await.unwrap();
        jobs.begin_processing(id).await.unwrap();

        let mut candidate = CandidateFieldSet::new(CandidateSource::PostCall, Utc::now());
        candidate.insert(FieldName::LastName, "Lee", Some(0.6));
        jobs.attach_candidate(id, candidate).await.unwrap();

        assert!(jobs.attach_error(id, "too early").await.is_err());
        jobs.fail(id, "识别服务超时").await.unwrap();
        jobs.attach_error(id, "重试请走外部补偿").await.unwrap();

        let ResultLookup::Ready(view) = jobs.get_result(id, "s1").await.unwrap() else {
            panic!("job should be ready");
        };
        assert_eq!(view.state, JobState::Failed);
        assert_eq!(view.error.as_deref(), Some("识别服务超时; 重试请走外部补偿"));
    }

    #[tokio::test]
    async fn test_pending_job_can_fail_directly() {
        let jobs = manager();
        let id = jobs.create("s1", transcript(), CandidateSource::PostCall).await.unwrap();
        jobs.fail(id, "输入为空").await.unwrap();
        match jobs.get_status(id, "s1").await.unwrap() {
            StatusLookup::Found(view) => assert_eq!(view.progress_hint, 0),
            StatusLookup::NotFound => panic!("job should exist"),
        }
    }

    #[tokio::test]
    async fn test_stage_only_moves_forward() {
        let jobs = manager();
        let id = jobs.create("s1", transcript(), CandidateSource::PostCall).await.unwrap();
        assert!(jobs.advance_stage(id, PipelineStage::Recognizing).await.is_err());

        jobs.begin_processing(id).await.unwrap();
        jobs.advance_stage(id, PipelineStage::Reconciling).await.unwrap();
        assert!(jobs.advance_stage(id, PipelineStage::Recognizing).await.is_err());

        let StatusLookup::Found(view) = jobs.get_status(id, "s1").await.unwrap() else {
            panic!("job should exist");
        };
        assert_eq!(view.progress_hint, 80);
    }

    #[tokio::test]
    async fn test_lookups_are_scoped_to_owner() {
        let jobs = manager();
        let id = jobs.create("s1", transcript(), CandidateSource::PostCall).await.unwrap();

        assert_eq!(jobs.get_status(id, "s2").await.unwrap(), StatusLookup::NotFound);
        assert_eq!(jobs.get_result(id, "s2").await.unwrap(), ResultLookup::NotFound);
        assert_eq!(
            jobs.get_status(Uuid::new_v4(), "s1").await.unwrap(),
            StatusLookup::NotFound
        );
        assert!(matches!(
            jobs.begin_processing(Uuid::new_v4()).await,
            Err(AppError::Job(JobError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_latest_record_and_subject_listing() {
        let jobs = manager();
        let first = jobs.create("s1", transcript(), CandidateSource::Realtime).await.unwrap();
        jobs.begin_processing(first).await.unwrap();
        jobs.complete(first, record(0.4)).await.unwrap();

        let second = jobs.create("s1", transcript(), CandidateSource::PostCall).await.unwrap();
        jobs.begin_processing(second).await.unwrap();
        jobs.complete(second, record(0.9)).await.unwrap();

        let pending = jobs.create("s1", transcript(), CandidateSource::PostCall).await.unwrap();
        jobs.create("s2", transcript(), CandidateSource::PostCall).await.unwrap();

        let latest = jobs.latest_record("s1").await.unwrap().unwrap();
        assert!((latest.overall_confidence() - 0.9).abs() < 1e-9);
        assert!(jobs.latest_record("nobody").await.unwrap().is_none());

        let views = jobs.jobs_for_subject("s1").await.unwrap();
        assert_eq!(views.len(), 3);
        assert_eq!(views[0].id, pending);
    }

    #[tokio::test]
    async fn test_lock_tables_shrink_after_use() {
        let jobs = manager();
        let done = jobs.create("s1", transcript(), CandidateSource::PostCall).await.unwrap();
        jobs.begin_processing(done).await.unwrap();
        jobs.complete(done, record(0.9)).await.unwrap();
        // 从未进入终态的作业也不会留下条目
        jobs.create("s1", transcript(), CandidateSource::PostCall).await.unwrap();
        assert_eq!(jobs.transition_locks.len(), 0);

        let guard = jobs.lock_subject("s1").await;
        let waiter = {
            let jobs = jobs.clone();
            tokio::spawn(async move {
                let _guard = jobs.lock_subject("s1").await;
            })
        };
        tokio::task::yield_now().await;
        drop(guard);
        // 等待者还持有引用，条目保留
        assert_eq!(jobs.subject_locks.len(), 1);
        waiter.await.unwrap();
        assert_eq!(jobs.subject_locks.len(), 0);
    }

    #[test]
    fn test_short_id() {
        let id = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(short_id(id), "67e55044");
    }
}
