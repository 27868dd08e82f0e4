//! 作业流水线 - 编排层
//!
//! `submit` 只负责创建 pending 作业并排队，立即返回作业 ID；
//! 调度任务从队列取出作业，在 Semaphore 限制下为每个作业起一个任务运行流程。
//! 调用方可以轮询状态，也可以等待票据上的完成通知。

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AppResult, JobError};
use crate::models::candidate::CandidateSource;
use crate::models::job::{JobId, RawInput};
use crate::services::JobManager;
use crate::workflow::{ExtractionFlow, FlowOutcome, JobCtx};

/// 提交请求
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub subject_id: String,
    pub input: RawInput,
    pub source: CandidateSource,
    /// 输入的观测时间，缺省为提交时间
    pub observed_at: Option<DateTime<Utc>>,
}

impl SubmitRequest {
    pub fn new(subject_id: impl Into<String>, input: RawInput, source: CandidateSource) -> Self {
        Self {
            subject_id: subject_id.into(),
            input,
            source,
            observed_at: None,
        }
    }
}

/// 提交票据
#[derive(Debug)]
pub struct JobTicket {
    pub job_id: JobId,
    /// 作业到达终态时收到结果；流水线被强行丢弃时发送端关闭
    pub completion: oneshot::Receiver<FlowOutcome>,
}

impl JobTicket {
    /// 等待作业结束
    pub async fn wait(self) -> Option<FlowOutcome> {
        self.completion.await.ok()
    }
}

struct QueuedJob {
    ctx: JobCtx,
    input: RawInput,
    done: oneshot::Sender<FlowOutcome>,
}

/// 作业流水线
pub struct JobPipeline {
    jobs: Arc<JobManager>,
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl JobPipeline {
    /// 启动流水线（需要在 tokio 运行时内调用）
    pub fn start(jobs: Arc<JobManager>, flow: ExtractionFlow, max_concurrent: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let dispatcher = tokio::spawn(dispatch(receiver, Arc::new(flow), semaphore));

        Self {
            jobs,
            sender: Mutex::new(Some(sender)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// 作业管理器（状态 / 结果查询）
    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    /// 提交作业，不等待处理完成
    pub async fn submit(&self, request: SubmitRequest) -> AppResult<JobTicket> {
        let observed_at = request.observed_at.unwrap_or_else(Utc::now);
        let sender = self.sender.lock().await.clone().ok_or(JobError::PipelineClosed)?;

        let job_id = self
            .jobs
            .create(&request.subject_id, request.input.clone(), request.source)
            .await?;
        let ctx = JobCtx::new(job_id, request.subject_id, request.source, observed_at);

        let (done, completion) = oneshot::channel();
        let queued = QueuedJob {
            ctx,
            input: request.input,
            done,
        };
        if sender.send(queued).is_err() {
            self.jobs.fail(job_id, "作业流水线已关闭").await?;
            return Err(JobError::PipelineClosed.into());
        }

        Ok(JobTicket { job_id, completion })
    }

    /// 关闭队列并等待所有已提交的作业结束
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();
        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            if let Err(e) = dispatcher.await {
                error!("调度任务异常退出: {}", e);
            }
        }
        info!("🛑 作业流水线已关闭");
    }
}

/// 调度循环：队列关闭后等待所有在途作业
async fn dispatch(
    mut receiver: mpsc::UnboundedReceiver<QueuedJob>,
    flow: Arc<ExtractionFlow>,
    semaphore: Arc<Semaphore>,
) {
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    while let Some(queued) = receiver.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("{} 无法获取并发许可: {}", queued.ctx, e);
                break;
            }
        };
        let flow = flow.clone();

        handles.retain(|h| !h.is_finished());
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            let outcome = flow.run(&queued.ctx, &queued.input).await;
            if queued.done.send(outcome).is_err() {
                debug!("{} 提交方已不再等待结果", queued.ctx);
            }
        }));
    }

    for result in join_all(handles).await {
        if let Err(e) = result {
            warn!("作业任务执行失败: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, RecognitionError};
    use crate::infrastructure::{InMemoryJobStore, PreparedInput};
    use crate::models::job::{JobState, StatusLookup};
    use crate::services::{RecognizedFields, Recognizer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 记录最大并发数的识别器
    #[derive(Default)]
    struct CountingRecognizer {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Recognizer for CountingRecognizer {
        fn name(&self) -> &str {
            "counting"
        }

        async fn recognize(&self, _input: &PreparedInput) -> Result<RecognizedFields, RecognitionError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let mut fields = RecognizedFields::new();
            fields.insert("firstName", "Ann", Some(0.9));
            Ok(fields)
        }
    }

    fn pipeline(recognizer: Arc<CountingRecognizer>, max_concurrent: usize) -> JobPipeline {
        let jobs = Arc::new(JobManager::new(Arc::new(InMemoryJobStore::new())));
        let flow = ExtractionFlow::new(jobs.clone(), recognizer, Duration::from_secs(5));
        JobPipeline::start(jobs, flow, max_concurrent)
    }

    fn transcript(subject: &str) -> SubmitRequest {
        SubmitRequest::new(
            subject,
            RawInput::Transcript("this is Ann".to_string()),
            CandidateSource::PostCall,
        )
    }

    #[tokio::test]
    async fn test_submit_returns_before_processing() {
        let recognizer = Arc::new(CountingRecognizer::default());
        let pipeline = pipeline(recognizer, 2);

        let ticket = pipeline.submit(transcript("s1")).await.unwrap();
        let job_id = ticket.job_id;
        match pipeline.jobs().get_status(job_id, "s1").await.unwrap() {
            StatusLookup::Found(view) => assert!(!view.state.is_terminal()),
            StatusLookup::NotFound => panic!("job should exist"),
        }

        let outcome = ticket.wait().await.unwrap();
        assert!(outcome.is_completed());
        match pipeline.jobs().get_status(job_id, "s1").await.unwrap() {
            StatusLookup::Found(view) => assert_eq!(view.state, JobState::Completed),
            StatusLookup::NotFound => panic!("job should exist"),
        }
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let recognizer = Arc::new(CountingRecognizer::default());
        let pipeline = pipeline(recognizer.clone(), 2);

        let mut tickets = Vec::new();
        for i in 0..6 {
            tickets.push(pipeline.submit(transcript(&format!("s{}", i))).await.unwrap());
        }
        let outcomes = join_all(tickets.into_iter().map(JobTicket::wait)).await;
        assert!(outcomes.iter().all(|o| o.as_ref().is_some_and(FlowOutcome::is_completed)));
        assert!(recognizer.peak.load(Ordering::SeqCst) <= 2);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let pipeline = pipeline(Arc::new(CountingRecognizer::default()), 1);
        let ticket = pipeline.submit(transcript("s1")).await.unwrap();
        pipeline.shutdown().await;

        // 关闭前提交的作业仍然会跑完
        tokio_test::assert_ok!(ticket.completion.await);
        assert!(matches!(
            pipeline.submit(transcript("s1")).await,
            Err(AppError::Job(JobError::PipelineClosed))
        ));
    }
}
