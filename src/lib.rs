//! # Contact Intake
//!
//! 从证件图片和通话转写中抽取个人联系与保险信息，并按置信度合并成一份权威记录
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有外部资源，只暴露能力
//! - `input_reader` - 读取原始输入（图片编码为 data URL）
//! - `JobStore` - 作业表，`InMemoryJobStore` / `JsonDirJobStore`
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，每次只处理一个输入或一份记录
//! - `Recognizer` / `LlmRecognizer` - 识别能力
//! - `Extractor` - 识别结果 → 候选集
//! - `AddressParser` - 整行地址拆分
//! - `reconciler` - 按置信度合并，人工修改永不被覆盖
//! - `JobManager` - 作业状态机
//! - `validation` - 字段校验
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个作业"的完整处理流程
//! - `JobCtx` - 上下文封装（job_id + subject_id）
//! - `ExtractionFlow` - 流程编排（convert → recognize → reconcile → persist）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/pipeline` - 作业流水线，管理队列和并发
//! - `orchestrator/batch_processor` - 批量收件箱处理器
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use infrastructure::{InMemoryJobStore, JobStore, JsonDirJobStore};
pub use models::{AuthoritativeRecord, CandidateFieldSet, CandidateSource, FieldName, FieldValues};
pub use orchestrator::{App, BatchStats, JobPipeline, JobTicket, SubmitRequest};
pub use services::{AddressParser, JobManager, LlmRecognizer, MergeResult, Recognizer};
pub use workflow::{ExtractionFlow, FlowOutcome, JobCtx};
