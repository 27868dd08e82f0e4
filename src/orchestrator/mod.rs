//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责作业调度和批量处理，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `pipeline` - 作业流水线
//! - 提交即返回作业 ID，不等待处理
//! - 队列 + 调度任务 + Semaphore 控制并发
//! - 每个作业一个任务，结果通过票据通知
//!
//! ### `batch_processor` - 批量收件箱处理器
//! - 管理应用生命周期（初始化、运行、关闭）
//! - 按对象加载收件箱，同一对象顺序提交
//! - 输出全局统计信息并校验最终记录
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理整个收件箱)
//!     ↓
//! pipeline (调度单个作业)
//!     ↓
//! workflow::ExtractionFlow (处理单个作业)
//!     ↓
//! services (能力层：识别 / 抽取 / 合并 / 作业状态)
//!     ↓
//! infrastructure (基础设施：输入读取、作业存储)
//! ```

pub mod batch_processor;
pub mod pipeline;

// 重新导出主要类型
pub use batch_processor::{App, BatchStats};
pub use pipeline::{JobPipeline, JobTicket, SubmitRequest};
