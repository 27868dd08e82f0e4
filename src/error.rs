use thiserror::Error;
use uuid::Uuid;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 原始输入被拒绝（调用方问题）
    #[error("输入错误: {0}")]
    Input(#[from] InputError),
    /// 外部识别服务错误
    #[error("识别服务错误: {0}")]
    Recognition(#[from] RecognitionError),
    /// 存储错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 作业状态机错误
    #[error("作业错误: {0}")]
    Job(#[from] JobError),
    /// 合并错误
    #[error("合并错误: {0}")]
    Reconcile(#[from] ReconcileError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
}

/// 原始输入错误
#[derive(Debug, Error)]
pub enum InputError {
    /// 文件不存在
    #[error("文件不存在: {path}")]
    NotFound { path: String },
    /// 读取文件失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 文件为空
    #[error("输入内容为空: {what}")]
    Empty { what: String },
    /// 不支持的图片格式
    #[error("不支持的图片格式: {extension}")]
    UnsupportedFormat { extension: String },
    /// 手工修改文件解析失败
    #[error("手工修改文件解析失败 ({path}): {source}")]
    EditsParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// 未知字段
    #[error("未知字段: {key}")]
    UnknownField { key: String },
}

/// 识别服务错误
#[derive(Debug, Error)]
pub enum RecognitionError {
    /// API 调用失败
    #[error("识别 API 调用失败 (模型: {model}): {message}")]
    ApiCallFailed { model: String, message: String },
    /// 调用超时
    #[error("识别服务超时 ({seconds} 秒)")]
    Timeout { seconds: u64 },
    /// 返回内容为空
    #[error("识别服务返回内容为空 (模型: {model})")]
    EmptyContent { model: String },
    /// 返回内容无法解析
    #[error("无法解析识别结果 (响应: {response})")]
    MalformedResponse { response: String },
}

/// 存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 读写失败
    #[error("存储读写失败 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 记录序列化失败
    #[error("作业记录序列化失败 ({path}): {source}")]
    Serde {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// 作业状态机错误
#[derive(Debug, Error)]
pub enum JobError {
    /// 作业不存在
    #[error("作业不存在: {0}")]
    NotFound(Uuid),
    /// 非法状态迁移
    #[error("作业 {job_id} 无法从 {from} 执行 {action}")]
    InvalidTransition {
        job_id: Uuid,
        from: String,
        action: &'static str,
    },
    /// 作业已进入终态
    #[error("作业 {job_id} 已处于终态 {state}，拒绝再次写入")]
    AlreadyTerminal { job_id: Uuid, state: String },
    /// 作业 ID 分配失败
    #[error("作业 ID 分配失败，已重试 {attempts} 次")]
    IdExhausted { attempts: usize },
    /// 流水线已关闭
    #[error("作业流水线已关闭")]
    PipelineClosed,
}

/// 合并错误（均为调用方违反前置条件）
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// 候选集早于当前权威记录
    #[error("候选集观测时间 {observed_at} 早于权威记录时间 {as_of}")]
    OutOfOrder {
        observed_at: chrono::DateTime<chrono::Utc>,
        as_of: chrono::DateTime<chrono::Utc>,
    },
    /// 字段不在字段表中
    #[error("字段不在字段表中: {key}")]
    UnknownField { key: String },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件读取失败
    #[error("配置文件读取失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 配置文件解析失败
    #[error("配置文件解析失败 ({path}): {source}")]
    ParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl AppError {
    /// 是否为调用方输入问题
    pub fn is_input_rejected(&self) -> bool {
        matches!(self, AppError::Input(_))
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
