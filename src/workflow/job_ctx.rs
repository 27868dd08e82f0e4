//! 作业处理上下文
//!
//! 封装"我正在处理哪个对象的哪个作业"这一信息

use chrono::{DateTime, Utc};
use std::fmt::Display;

use crate::models::candidate::CandidateSource;
use crate::models::job::JobId;
use crate::services::job_manager::short_id;

/// 作业处理上下文
#[derive(Debug, Clone)]
pub struct JobCtx {
    pub job_id: JobId,

    /// 作业所属对象
    pub subject_id: String,

    /// 候选集来源
    pub source: CandidateSource,

    /// 输入被提交（观测）的时间，合并顺序以此为准
    pub observed_at: DateTime<Utc>,
}

impl JobCtx {
    pub fn new(
        job_id: JobId,
        subject_id: impl Into<String>,
        source: CandidateSource,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            subject_id: subject_id.into(),
            source,
            observed_at,
        }
    }
}

impl Display for JobCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[作业 {} 对象 {}]",
            short_id(self.job_id),
            self.subject_id
        )
    }
}
