//! 作业处理流程 - 流程层
//!
//! 核心职责：定义"一个作业"的完整处理流程
//!
//! 流程顺序：
//! 1. convert：读取原始输入（图片编码 / 转写文本 / 手工修改）
//! 2. recognize：调用识别服务（带超时）→ 结构化为候选集
//! 3. reconcile：在对象锁内读取上一份权威记录并合并
//! 4. persist：complete，写入合并结果
//!
//! 任一步骤出错都会把作业置为 failed，不会停留在 processing。

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{AppResult, ReconcileError, RecognitionError};
use crate::infrastructure::input_reader::{self, PreparedInput};
use crate::models::candidate::{
    requires_manual_review, AuthoritativeRecord, CandidateFieldSet, CandidateSource,
};
use crate::models::job::{PipelineStage, RawInput};
use crate::services::{
    apply_manual_edit, backfill, reconcile, Extractor, JobManager, MergeResult, RecognizedFields,
    Recognizer,
};
use crate::workflow::job_ctx::JobCtx;

/// 作业处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutcome {
    /// 处理成功
    Completed {
        overall_confidence: f64,
        requires_manual_review: bool,
        conflicts: usize,
    },
    /// 处理失败，作业已置为 failed
    Failed { error: String },
}

impl FlowOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, FlowOutcome::Completed { .. })
    }
}

/// 作业处理流程
///
/// - 编排单个作业的处理顺序
/// - 决定何时识别、何时合并、何时失败
/// - 只依赖业务能力（services）
pub struct ExtractionFlow {
    jobs: Arc<JobManager>,
    recognizer: Arc<dyn Recognizer>,
    extractor: Extractor,
    recognition_timeout: Duration,
}

impl ExtractionFlow {
    pub fn new(
        jobs: Arc<JobManager>,
        recognizer: Arc<dyn Recognizer>,
        recognition_timeout: Duration,
    ) -> Self {
        Self {
            jobs,
            recognizer,
            extractor: Extractor::new(),
            recognition_timeout,
        }
    }

    pub async fn run(&self, ctx: &JobCtx, input: &RawInput) -> FlowOutcome {
        match self.process(ctx, input).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let description = e.to_string();
                if e.is_input_rejected() {
                    warn!("{} ⚠️ 输入被拒绝: {}", ctx, description);
                } else {
                    error!("{} ❌ 处理过程中发生错误: {}", ctx, description);
                }
                if let Err(fail_err) = self.jobs.fail(ctx.job_id, &description).await {
                    warn!("{} ⚠️ 无法记录失败状态: {}", ctx, fail_err);
                }
                FlowOutcome::Failed { error: description }
            }
        }
    }

    async fn process(&self, ctx: &JobCtx, input: &RawInput) -> AppResult<FlowOutcome> {
        self.jobs.begin_processing(ctx.job_id).await?;
        info!("{} ▶️ 开始处理: {}", ctx, input.describe());

        // ========== 1. convert ==========
        let prepared = input_reader::prepare(input).await?;

        // ========== 2. recognize ==========
        let candidate = match (input, prepared) {
            (_, Some(prepared)) => {
                self.jobs
                    .advance_stage(ctx.job_id, PipelineStage::Recognizing)
                    .await?;
                let recognized = self.recognize(ctx, &prepared).await?;
                self.extractor
                    .structure(&recognized, ctx.source, ctx.observed_at)
            }
            (RawInput::ManualEdit(edits), None) => {
                self.extractor.from_manual_edits(edits, ctx.observed_at)
            }
            (_, None) => CandidateFieldSet::new(ctx.source, ctx.observed_at),
        };
        if candidate.is_empty() {
            warn!("{} ⚠️ 没有抽取到任何字段", ctx);
        } else {
            info!("{} ✓ 抽取到 {} 个字段", ctx, candidate.fields.len());
        }
        self.jobs
            .attach_candidate(ctx.job_id, candidate.clone())
            .await?;

        // ========== 3. reconcile ==========
        self.jobs
            .advance_stage(ctx.job_id, PipelineStage::Reconciling)
            .await?;
        let _subject_guard = self.jobs.lock_subject(&ctx.subject_id).await;

        let prior = self
            .jobs
            .latest_record(&ctx.subject_id)
            .await?
            .unwrap_or_else(AuthoritativeRecord::empty);
        let merged = self.merge(ctx, &prior, &candidate)?;

        // ========== 4. persist ==========
        self.jobs
            .advance_stage(ctx.job_id, PipelineStage::Persisting)
            .await?;
        let overall_confidence = merged.overall_confidence;
        let conflicts = merged.conflicts.len();
        self.jobs.complete(ctx.job_id, merged.into_record()).await?;

        Ok(FlowOutcome::Completed {
            overall_confidence,
            requires_manual_review: requires_manual_review(overall_confidence),
            conflicts,
        })
    }

    /// 调用识别服务，超时视为识别失败
    async fn recognize(&self, ctx: &JobCtx, prepared: &PreparedInput) -> AppResult<RecognizedFields> {
        info!(
            "{} 🔍 调用识别服务 {} ({})",
            ctx,
            self.recognizer.name(),
            prepared.kind()
        );
        match tokio::time::timeout(self.recognition_timeout, self.recognizer.recognize(prepared)).await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(RecognitionError::Timeout {
                seconds: self.recognition_timeout.as_secs(),
            }
            .into()),
        }
    }

    /// 合并候选集；过期的自动候选集只补空字段
    fn merge(
        &self,
        ctx: &JobCtx,
        prior: &AuthoritativeRecord,
        candidate: &CandidateFieldSet,
    ) -> AppResult<MergeResult> {
        if candidate.source == CandidateSource::UserEdit {
            return Ok(apply_manual_edit(prior, &candidate.fields, candidate.observed_at));
        }
        match reconcile(prior, candidate) {
            Ok(merged) => Ok(merged),
            Err(ReconcileError::OutOfOrder { observed_at, as_of }) => {
                warn!(
                    "{} ⚠️ 候选集 ({}) 早于当前记录 ({})，只补空字段",
                    ctx, observed_at, as_of
                );
                Ok(backfill(prior, candidate))
            }
            Err(e) => Err(e.into()),
        }
    }
}
