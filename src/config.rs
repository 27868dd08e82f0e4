use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// 程序配置文件
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 同时处理的作业数量
    pub max_concurrent_jobs: usize,
    /// 收件箱目录：`<inbox>/<subject_id>/<文件>`
    pub inbox_folder: String,
    /// 作业记录目录，为空时使用内存存储
    pub store_folder: String,
    /// 识别服务超时（秒）
    pub recognition_timeout_secs: u64,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    pub llm_temperature: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 8,
            inbox_folder: "inbox".to_string(),
            store_folder: "jobs".to_string(),
            recognition_timeout_secs: 60,
            verbose_logging: false,
            output_log_file: "output.txt".to_string(),
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
            llm_temperature: 0.0,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// 读取 TOML 配置文件，再叠加环境变量
    ///
    /// 文件不存在时等同于 [`Config::from_env`]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::from_env());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::ParseFailed {
            path: path.display().to_string(),
            source,
        })?;
        Ok(config.with_env_overrides())
    }

    /// 识别服务超时
    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_secs(self.recognition_timeout_secs.max(1))
    }

    fn with_env_overrides(self) -> Self {
        Self {
            max_concurrent_jobs: std::env::var("MAX_CONCURRENT_JOBS").ok().and_then(|v| v.parse().ok()).unwrap_or(self.max_concurrent_jobs),
            inbox_folder: std::env::var("INBOX_FOLDER").unwrap_or(self.inbox_folder),
            store_folder: std::env::var("STORE_FOLDER").unwrap_or(self.store_folder),
            recognition_timeout_secs: std::env::var("RECOGNITION_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(self.recognition_timeout_secs),
            verbose_logging: std::env::var("VERBOSE_LOGGING").ok().and_then(|v| v.parse().ok()).unwrap_or(self.verbose_logging),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(self.output_log_file),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(self.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(self.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(self.llm_model_name),
            llm_temperature: std::env::var("LLM_TEMPERATURE").ok().and_then(|v| v.parse().ok()).unwrap_or(self.llm_temperature),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "inbox_folder = \"calls\"\nllm_temperature = 0.2\n").unwrap();

        let config = Config::load(&path).unwrap();
        if std::env::var("INBOX_FOLDER").is_err() {
            assert_eq!(config.inbox_folder, "calls");
        }
        if std::env::var("OUTPUT_LOG_FILE").is_err() {
            assert_eq!(config.output_log_file, "output.txt");
        }
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/definitely/not/here.toml")).unwrap();
        assert!(config.max_concurrent_jobs > 0);
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_concurrent_jobs = \"many\"").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::ParseFailed { .. })));
    }

    #[test]
    fn test_timeout_is_never_zero() {
        let config = Config {
            recognition_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.recognition_timeout(), Duration::from_secs(1));
    }
}
