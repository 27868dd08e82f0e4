//! 作业存储 - 基础设施层
//!
//! 作业表是唯一的共享可变资源。存储只暴露三个能力：
//! `load_job` / `save_job` / `find_by_subject`，不认识状态机。
//!
//! `save_job` 总是整条替换记录，读者看到的要么是旧记录、要么是新记录。

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::job::{Job, JobId};

/// 作业存储接口
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn find_by_subject(&self, subject_id: &str) -> Result<Vec<Job>, StoreError>;
}

/// 内存存储
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn load_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_by_subject(&self, subject_id: &str) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.subject_id == subject_id)
            .cloned()
            .collect())
    }
}

/// JSON 目录存储：每个作业一个 `<id>.json`
///
/// 写入先落临时文件再 rename，替换是原子的
#[derive(Debug, Clone)]
pub struct JsonDirJobStore {
    dir: PathBuf,
}

impl JsonDirJobStore {
    /// 打开（必要时创建）存储目录
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|source| StoreError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        debug!("📁 作业存储目录: {}", dir.display());
        Ok(Self { dir })
    }

    fn job_path(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn read_job(path: &Path) -> Result<Job, StoreError> {
        let content = fs::read_to_string(path).await.map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| StoreError::Serde {
            path: path.display().to_string(),
            source,
        })
    }
}

#[async_trait]
impl JobStore for JsonDirJobStore {
    async fn load_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let path = self.job_path(id);
        let exists = fs::try_exists(&path).await.map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if !exists {
            return Ok(None);
        }
        Self::read_job(&path).await.map(Some)
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.job_path(job.id);
        let tmp_path = self.dir.join(format!("{}.json.tmp", job.id));

        let content = serde_json::to_string_pretty(job).map_err(|source| StoreError::Serde {
            path: path.display().to_string(),
            source,
        })?;
        fs::write(&tmp_path, content)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp_path.display().to_string(),
                source,
            })?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Ok(())
    }

    async fn find_by_subject(&self, subject_id: &str) -> Result<Vec<Job>, StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.dir.display().to_string(),
            source,
        };
        let mut entries = fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut jobs = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_job(&path).await {
                Ok(job) if job.subject_id == subject_id => jobs.push(job),
                Ok(_) => {}
                Err(e) => warn!("⚠️ 跳过无法读取的作业记录: {}", e),
            }
        }

        Ok(jobs)
    }
}
