//! 作业记录与对外视图

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::models::candidate::{
    CandidateFieldSet, CandidateSource, ConfidenceMap, FieldSources, AuthoritativeRecord,
};
use crate::models::field::FieldValues;

/// 作业 ID
pub type JobId = Uuid;

/// 作业生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// processing 状态内部的流水线阶段（只用于进度展示）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Converting,
    Recognizing,
    Reconciling,
    Persisting,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Converting => "converting",
            PipelineStage::Recognizing => "recognizing",
            PipelineStage::Reconciling => "reconciling",
            PipelineStage::Persisting => "persisting",
        }
    }
}

/// 进度提示（0-100），只用于展示
pub fn progress_hint(state: JobState, stage: Option<PipelineStage>) -> u8 {
    match state {
        JobState::Pending => 25,
        JobState::Processing => match stage {
            None | Some(PipelineStage::Converting) => 40,
            Some(PipelineStage::Recognizing) => 60,
            Some(PipelineStage::Reconciling) => 80,
            Some(PipelineStage::Persisting) => 90,
        },
        JobState::Completed => 100,
        JobState::Failed => 0,
    }
}

/// 提交给流水线的原始输入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RawInput {
    /// 本地证件图片
    ImageFile(PathBuf),
    /// 远程证件图片
    ImageUrl(String),
    /// 通话转写文本
    Transcript(String),
    /// 操作员手工修改
    ManualEdit(FieldValues),
}

impl RawInput {
    pub fn kind(&self) -> &'static str {
        match self {
            RawInput::ImageFile(_) => "image_file",
            RawInput::ImageUrl(_) => "image_url",
            RawInput::Transcript(_) => "transcript",
            RawInput::ManualEdit(_) => "manual_edit",
        }
    }

    /// 日志用的简短描述
    pub fn describe(&self) -> String {
        match self {
            RawInput::ImageFile(path) => format!("图片 {}", path.display()),
            RawInput::ImageUrl(url) => format!("图片 {}", url),
            RawInput::Transcript(text) => format!("转写文本 {} 字符", text.chars().count()),
            RawInput::ManualEdit(fields) => format!("手工修改 {} 个字段", fields.len()),
        }
    }
}

/// 作业记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub subject_id: String,
    pub state: JobState,
    pub stage: Option<PipelineStage>,
    pub source: CandidateSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub raw_input: RawInput,
    /// 最近一次抽取得到的候选集
    pub candidate: Option<CandidateFieldSet>,
    /// 合并后的权威记录
    pub record: Option<AuthoritativeRecord>,
    pub overall_confidence: f64,
    pub requires_manual_review: bool,
    pub error: Option<String>,
}

impl Job {
    pub fn new(
        id: JobId,
        subject_id: impl Into<String>,
        raw_input: RawInput,
        source: CandidateSource,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            subject_id: subject_id.into(),
            state: JobState::Pending,
            stage: None,
            source,
            created_at: now,
            updated_at: now,
            processed_at: None,
            raw_input,
            candidate: None,
            record: None,
            overall_confidence: 0.0,
            requires_manual_review: false,
            error: None,
        }
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id,
            state: self.state,
            progress_hint: progress_hint(self.state, self.stage),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn result_view(&self) -> JobResultView {
        let (fields, confidence_map, field_sources) = match &self.record {
            Some(record) => (record.fields(), record.confidence_map(), record.sources.clone()),
            None => (
                FieldValues::new(),
                ConfidenceMap::new(),
                FieldSources::new(),
            ),
        };
        JobResultView {
            id: self.id,
            state: self.state,
            fields,
            confidence_map,
            field_sources,
            overall_confidence: self.overall_confidence,
            requires_manual_review: self.requires_manual_review,
            error: self.error.clone(),
        }
    }
}

/// 状态查询视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: JobId,
    pub state: JobState,
    pub progress_hint: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 结果查询视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResultView {
    pub id: JobId,
    pub state: JobState,
    pub fields: FieldValues,
    pub confidence_map: ConfidenceMap,
    pub field_sources: FieldSources,
    pub overall_confidence: f64,
    pub requires_manual_review: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 状态查询结果
#[derive(Debug, Clone, PartialEq)]
pub enum StatusLookup {
    Found(JobStatusView),
    NotFound,
}

/// 结果查询结果：NotReady 表示“继续轮询”，NotFound 表示“放弃”
#[derive(Debug, Clone, PartialEq)]
pub enum ResultLookup {
    Ready(JobResultView),
    NotReady(JobStatusView),
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_hint_grows_with_stage() {
        let mut last = progress_hint(JobState::Pending, None);
        for stage in [
            PipelineStage::Converting,
            PipelineStage::Recognizing,
            PipelineStage::Reconciling,
            PipelineStage::Persisting,
        ] {
            let hint = progress_hint(JobState::Processing, Some(stage));
            assert!(hint >= last);
            last = hint;
        }
        assert_eq!(progress_hint(JobState::Completed, None), 100);
        assert_eq!(progress_hint(JobState::Failed, Some(PipelineStage::Persisting)), 0);
    }

    #[test]
    fn test_new_job_is_pending_without_result() {
        let job = Job::new(
            Uuid::new_v4(),
            "subject-1",
            RawInput::Transcript("hello".to_string()),
            CandidateSource::Realtime,
            Utc::now(),
        );
        assert_eq!(job.state, JobState::Pending);
        let view = job.result_view();
        assert!(view.fields.is_empty());
        assert!(view.error.is_none());
    }

    #[test]
    fn test_raw_input_serializes_with_type_tag() {
        let input = RawInput::Transcript("my name is Ann".to_string());
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["type"], "transcript");
        let back: RawInput = serde_json::from_value(json).unwrap();
        assert_eq!(back, input);
    }
}
