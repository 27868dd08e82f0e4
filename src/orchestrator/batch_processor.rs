//! 批量收件箱处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是命令行程序的入口，负责整批输入的处理和资源管理。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：启动日志、打开作业存储、创建识别服务和流水线
//! 2. **批量加载**：扫描收件箱，按对象分组（`<inbox>/<subject_id>/<文件>`）
//! 3. **顺序保证**：同一对象的输入按 实时 → 通话后 → 手工修改 的顺序逐个提交
//! 4. **并发控制**：不同对象并发提交，总并发由流水线的 Semaphore 限制
//! 5. **全局统计**：汇总所有作业的处理结果，并校验每个对象的最终记录

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::infrastructure::{InMemoryJobStore, JobStore, JsonDirJobStore};
use crate::models::loaders::{load_inbox, InboxItem};
use crate::orchestrator::pipeline::{JobPipeline, SubmitRequest};
use crate::services::validation::{validate_record, ValidationResult};
use crate::services::{JobManager, LlmRecognizer, Recognizer};
use crate::utils::logging::{
    init_log_file, log_inbox_loaded, log_startup, log_subject_complete, print_final_stats,
};
use crate::workflow::{ExtractionFlow, FlowOutcome};

/// 应用主结构
pub struct App {
    config: Config,
    pipeline: Arc<JobPipeline>,
}

/// 处理统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchStats {
    pub subjects: usize,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub needs_review: usize,
}

/// 单个对象的处理结果
#[derive(Debug, Default)]
struct SubjectResult {
    completed: usize,
    failed: usize,
    needs_review: usize,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        // 初始化日志文件
        init_log_file(&config.output_log_file)?;
        log_startup(config.max_concurrent_jobs, &config.llm_model_name);

        let store: Arc<dyn JobStore> = if config.store_folder.trim().is_empty() {
            info!("💾 使用内存作业存储");
            Arc::new(InMemoryJobStore::new())
        } else {
            info!("💾 作业记录目录: {}", config.store_folder);
            Arc::new(JsonDirJobStore::open(&config.store_folder).await?)
        };
        let recognizer: Arc<dyn Recognizer> = Arc::new(LlmRecognizer::new(&config));

        Ok(Self::with_parts(config, store, recognizer))
    }

    /// 用给定的存储和识别服务组装应用
    pub fn with_parts(config: Config, store: Arc<dyn JobStore>, recognizer: Arc<dyn Recognizer>) -> Self {
        let jobs = Arc::new(JobManager::new(store));
        let flow = ExtractionFlow::new(jobs.clone(), recognizer, config.recognition_timeout());
        let pipeline = Arc::new(JobPipeline::start(jobs, flow, config.max_concurrent_jobs));
        Self { config, pipeline }
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        self.pipeline.jobs()
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<BatchStats> {
        info!("\n📁 正在扫描收件箱: {}", self.config.inbox_folder);
        let inbox = load_inbox(&self.config.inbox_folder).await?;

        if inbox.is_empty() {
            warn!("⚠️ 收件箱中没有待处理的输入，程序结束");
            self.pipeline.shutdown().await;
            return Ok(BatchStats::default());
        }

        let total = inbox.values().map(Vec::len).sum();
        log_inbox_loaded(inbox.len(), total);

        let subject_ids: Vec<String> = inbox.keys().cloned().collect();
        let stats = self.process_all_subjects(inbox).await;

        print_final_stats(
            stats.completed,
            stats.failed,
            stats.needs_review,
            stats.total,
            &self.config.output_log_file,
        );

        self.validate_subjects(&subject_ids).await;
        self.pipeline.shutdown().await;

        Ok(stats)
    }

    /// 不同对象并发处理
    async fn process_all_subjects(&self, inbox: BTreeMap<String, Vec<InboxItem>>) -> BatchStats {
        let mut stats = BatchStats {
            subjects: inbox.len(),
            total: inbox.values().map(Vec::len).sum(),
            ..Default::default()
        };

        let mut handles = Vec::new();
        for (subject_id, items) in inbox {
            let pipeline = self.pipeline.clone();
            let count = items.len();
            let handle = tokio::spawn(async move { process_subject(&pipeline, items).await });
            handles.push((subject_id, count, handle));
        }

        for (subject_id, count, handle) in handles {
            match handle.await {
                Ok(result) => {
                    log_subject_complete(&subject_id, result.completed, count);
                    stats.completed += result.completed;
                    stats.failed += result.failed;
                    stats.needs_review += result.needs_review;
                }
                Err(e) => {
                    error!("[对象 {}] 任务执行失败: {}", subject_id, e);
                    stats.failed += count;
                }
            }
        }

        stats
    }

    /// 校验每个对象的最终记录并输出问题
    async fn validate_subjects(&self, subject_ids: &[String]) {
        info!("\n🔎 校验最终记录...");
        for subject_id in subject_ids {
            match self.jobs().latest_record(subject_id).await {
                Ok(Some(record)) => log_validation(subject_id, &validate_record(&record)),
                Ok(None) => warn!("[对象 {}] ⚠️ 没有完成的作业，跳过校验", subject_id),
                Err(e) => error!("[对象 {}] ❌ 读取记录失败: {}", subject_id, e),
            }
        }
    }
}

/// 同一对象的输入逐个提交并等待，保证合并顺序
async fn process_subject(pipeline: &JobPipeline, items: Vec<InboxItem>) -> SubjectResult {
    let mut result = SubjectResult::default();

    for item in items {
        let request = SubmitRequest::new(item.subject_id.clone(), item.input, item.source);
        let ticket = match pipeline.submit(request).await {
            Ok(ticket) => ticket,
            Err(e) => {
                error!(
                    "[对象 {}] ❌ 提交失败 {}: {}",
                    item.subject_id,
                    item.path.display(),
                    e
                );
                result.failed += 1;
                continue;
            }
        };

        match ticket.wait().await {
            Some(FlowOutcome::Completed {
                requires_manual_review,
                ..
            }) => {
                result.completed += 1;
                if requires_manual_review {
                    result.needs_review += 1;
                }
            }
            Some(FlowOutcome::Failed { .. }) | None => result.failed += 1,
        }
    }

    result
}

fn log_validation(subject_id: &str, validation: &ValidationResult) {
    if validation.is_valid && validation.warnings.is_empty() {
        info!("[对象 {}] ✅ 校验通过", subject_id);
        return;
    }
    for issue in &validation.errors {
        match issue.field {
            Some(field) => error!("[对象 {}] ❌ {}: {}", subject_id, field, issue.message),
            None => error!("[对象 {}] ❌ {}", subject_id, issue.message),
        }
    }
    for issue in &validation.warnings {
        match issue.field {
            Some(field) => warn!("[对象 {}] ⚠️ {}: {}", subject_id, field, issue.message),
            None => warn!("[对象 {}] ⚠️ {}", subject_id, issue.message),
        }
    }
}
