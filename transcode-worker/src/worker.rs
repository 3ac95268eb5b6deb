use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::Instant;
use tracing::{error, info, warn};

use common_health::HealthHandle;
use common_redis::BusClient;
use conveyor_core::admission::allowed_video_codecs;
use conveyor_core::bus::publish_frame;
use conveyor_core::storage::{Locator, StorageBackend};
use conveyor_core::{
    ErrorCode, Job, Operation, ProgressUpdate, QueueError, QueueWorker, RetryPolicy,
};

use crate::error::ProcessError;
use crate::invoker::{
    build_plan, cached_encoder_caps, compute_percent, eta_seconds, probe, Invoker, JobScratch,
    Plan,
};

/// A worker to poll the job queue and supervise transcoder runs for the
/// jobs it leases.
pub struct JobWorker {
    queue: Arc<QueueWorker>,
    storage: Arc<dyn StorageBackend>,
    bus: Arc<dyn BusClient + Send + Sync>,
    invoker: Invoker,
    scratch_root: PathBuf,
    poll_interval: Duration,
    lease_ttl: Duration,
    progress_debounce: Duration,
    max_concurrent_jobs: usize,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

struct ProcessContext {
    queue: Arc<QueueWorker>,
    storage: Arc<dyn StorageBackend>,
    bus: Arc<dyn BusClient + Send + Sync>,
    invoker: Invoker,
    scratch_root: PathBuf,
    lease_ttl: Duration,
    progress_debounce: Duration,
    retry_policy: RetryPolicy,
}

impl JobWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<QueueWorker>,
        storage: Arc<dyn StorageBackend>,
        bus: Arc<dyn BusClient + Send + Sync>,
        invoker: Invoker,
        scratch_root: PathBuf,
        poll_interval: Duration,
        lease_ttl: Duration,
        progress_debounce: Duration,
        max_concurrent_jobs: usize,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            queue,
            storage,
            bus,
            invoker,
            scratch_root,
            poll_interval,
            lease_ttl,
            progress_debounce,
            max_concurrent_jobs,
            retry_policy,
            liveness,
        }
    }

    /// Wait until a job becomes available on the queue.
    async fn wait_for_job(&self) -> Result<Job, QueueError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            if let Some(job) = self.queue.dequeue(1).await?.pop() {
                return Ok(job);
            }
        }
    }

    /// Run this worker to continuously process jobs as they become
    /// available.
    pub async fn run(&self) -> Result<(), QueueError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_jobs));
        let report_semaphore_utilization = || {
            metrics::gauge!("worker_saturation_percent").set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64,
            );
        };

        loop {
            report_semaphore_utilization();
            let job = self.wait_for_job().await?;

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore has been closed");

            let context = Arc::new(ProcessContext {
                queue: self.queue.clone(),
                storage: self.storage.clone(),
                bus: self.bus.clone(),
                invoker: self.invoker.clone(),
                scratch_root: self.scratch_root.clone(),
                lease_ttl: self.lease_ttl,
                progress_debounce: self.progress_debounce,
                retry_policy: self.retry_policy.clone(),
            });

            tokio::spawn(async move {
                let job_id = job.id;
                process_job(context, job).await;
                drop(permit);
                metrics::counter!("worker_jobs_processed_total").increment(1);
                info!(%job_id, "job task finished");
            });
        }
    }
}

/// Debounced progress relay: writes to the store on the debounce interval or
/// on stage change, publishes to the bus after each write, and reports the
/// cooperative-cancel flag read back from the store.
struct ProgressTracker {
    queue: Arc<QueueWorker>,
    bus: Arc<dyn BusClient + Send + Sync>,
    job: Arc<Job>,
    lock_id: uuid::Uuid,
    debounce: Duration,
    last_flush: Instant,
    last_percent: f64,
    last_stage: String,
}

impl ProgressTracker {
    fn new(
        queue: Arc<QueueWorker>,
        bus: Arc<dyn BusClient + Send + Sync>,
        job: Arc<Job>,
        lock_id: uuid::Uuid,
        debounce: Duration,
    ) -> Self {
        let last_percent = job.progress;
        Self {
            queue,
            bus,
            job,
            lock_id,
            debounce,
            // Force the first update through.
            last_flush: Instant::now() - debounce,
            last_percent,
            last_stage: String::new(),
        }
    }

    /// Returns true when cancellation has been requested. `percent: None`
    /// holds the last known value (unknown-duration media).
    async fn update(
        &mut self,
        percent: Option<f64>,
        stage: &str,
        fps: Option<f64>,
        eta: Option<i64>,
    ) -> Result<bool, ProcessError> {
        let stage_changed = stage != self.last_stage;
        if !stage_changed && self.last_flush.elapsed() < self.debounce {
            return Ok(false);
        }

        let percent = percent.unwrap_or(self.last_percent).clamp(0.0, 100.0);
        let update = ProgressUpdate {
            percent,
            stage: stage.to_owned(),
            fps,
            eta_seconds: eta,
        };

        let flush = self
            .queue
            .flush_progress(self.job.id, self.lock_id, &update)
            .await
            .map_err(flush_error)?;

        self.last_flush = Instant::now();
        self.last_percent = percent;

        publish_frame(self.bus.as_ref(), &flush.frame).await;

        if stage_changed {
            self.last_stage = stage.to_owned();
            if self.job.progress_webhook {
                if let Err(err) = self.queue.enqueue_progress_webhook(&self.job, &update).await {
                    warn!("failed to enqueue progress webhook: {}", err);
                }
            }
        }

        Ok(flush.cancel_requested)
    }
}

fn flush_error(err: QueueError) -> ProcessError {
    match err {
        QueueError::InvalidLock { .. } => ProcessError::LockLost,
        other => ProcessError::Queue(other),
    }
}

async fn process_job(context: Arc<ProcessContext>, job: Job) {
    let Some(lock_id) = job.lock_id else {
        error!(job_id = %job.id, "dequeued job carries no lease, skipping");
        return;
    };
    let job = Arc::new(job);

    info!(job_id = %job.id, attempt = job.attempt, "processing job");

    // Lease renewal at a third of the TTL. Losing the lease flips the
    // cancel signal so the transcoder dies quickly, and marks the attempt
    // as abandoned: a fenced-out worker must stop writing.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let cancel_tx = Arc::new(cancel_tx);
    let lease_lost = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let heartbeat = {
        let queue = context.queue.clone();
        let job_id = job.id;
        let cancel_tx = cancel_tx.clone();
        let lease_lost = lease_lost.clone();
        let period = context.lease_ttl / 3;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                match queue.heartbeat(job_id, lock_id).await {
                    Ok(()) => {}
                    Err(QueueError::InvalidLock { .. }) => {
                        warn!(%job_id, "lease lost, abandoning the attempt");
                        lease_lost.store(true, std::sync::atomic::Ordering::SeqCst);
                        _ = cancel_tx.send(true);
                        break;
                    }
                    Err(err) => {
                        // Transient store trouble: keep trying, the lease
                        // survives until the janitor timeout.
                        warn!(%job_id, "heartbeat failed: {}", err);
                    }
                }
            }
        })
    };

    let result = run_attempt(&context, &job, lock_id, cancel_tx, cancel_rx).await;
    heartbeat.abort();

    let result = if lease_lost.load(std::sync::atomic::Ordering::SeqCst) {
        Err(ProcessError::LockLost)
    } else {
        result
    };

    match result {
        Ok(()) => match context.queue.complete(&job).await {
            Ok(frame) => publish_frame(context.bus.as_ref(), &frame).await,
            Err(QueueError::InvalidLock { .. }) => {
                warn!(job_id = %job.id, "lease lost at completion, outcome discarded")
            }
            Err(err) => error!(job_id = %job.id, "failed to record completion: {}", err),
        },
        Err(ProcessError::Cancelled) => match context.queue.cancelled(&job).await {
            Ok(frame) => publish_frame(context.bus.as_ref(), &frame).await,
            Err(QueueError::InvalidLock { .. }) => {
                warn!(job_id = %job.id, "lease lost during cancellation")
            }
            Err(err) => error!(job_id = %job.id, "failed to record cancellation: {}", err),
        },
        Err(ProcessError::LockLost) => {
            // Safe abandonment: another holder (or the janitor) owns the
            // job's fate now; writing anything would fence-violate.
            metrics::counter!("worker_lease_lost_total").increment(1);
        }
        Err(err) => {
            let failure = err.as_failure();
            let retryable = err.is_retryable() && job.attempt < job.max_attempts;
            if retryable {
                let delay = context.retry_policy.retry_interval(job.attempt as u32, None);
                info!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    ?delay,
                    code = %failure.code,
                    "attempt failed, rescheduling"
                );
                match context.queue.reschedule(&job, delay, &failure).await {
                    Ok(()) => {}
                    Err(QueueError::InvalidLock { .. }) => {
                        warn!(job_id = %job.id, "lease lost while rescheduling")
                    }
                    Err(err) => error!(job_id = %job.id, "failed to reschedule: {}", err),
                }
            } else {
                error!(job_id = %job.id, code = %failure.code, "job failed: {}", err);
                match context.queue.fail(&job, &failure).await {
                    Ok(frame) => publish_frame(context.bus.as_ref(), &frame).await,
                    Err(QueueError::InvalidLock { .. }) => {
                        warn!(job_id = %job.id, "lease lost while failing the job")
                    }
                    Err(err) => error!(job_id = %job.id, "failed to record failure: {}", err),
                }
            }
        }
    }
}

/// One processing attempt: download, probe, pre-validate, invoke, upload.
/// The scratch directory releases on every exit path out of this function.
async fn run_attempt(
    context: &Arc<ProcessContext>,
    job: &Arc<Job>,
    lock_id: uuid::Uuid,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
) -> Result<(), ProcessError> {
    if job.cancel_requested {
        return Err(ProcessError::Cancelled);
    }

    let mut tracker = ProgressTracker::new(
        context.queue.clone(),
        context.bus.clone(),
        job.clone(),
        lock_id,
        context.progress_debounce,
    );

    if tracker.update(None, "probe", None, None).await? {
        return Err(ProcessError::Cancelled);
    }

    let input = Locator::parse(&job.input_url)?;
    let output = Locator::parse(&job.output_url)?;
    let scratch = JobScratch::new(&context.scratch_root, job.id).map_err(ProcessError::Scratch)?;

    if tracker.update(None, "download", None, None).await? {
        return Err(ProcessError::Cancelled);
    }
    let local_input = scratch.input_path(&locator_file_name(&input));
    context.storage.download_to(&input, &local_input).await?;

    let duration = probe::media_duration(&context.invoker.ffprobe, &local_input).await?;

    // Refuse doomed packaging runs before spawning the transcoder.
    prevalidate_stream_operations(&job.operations.0)?;

    let caps = cached_encoder_caps(&context.invoker.ffmpeg).await;
    let local_output = scratch.output_path(&locator_file_name(&output));
    let plan = build_plan(
        &job.operations.0,
        &job.options.0,
        &local_input,
        &local_output,
        caps,
    );

    match plan {
        Plan::Probe => {
            if tracker.update(Some(10.0), "analyze", None, None).await? {
                return Err(ProcessError::Cancelled);
            }
            let report = probe::probe_report(&context.invoker.ffprobe, &local_input).await?;
            tokio::fs::write(&local_output, report)
                .await
                .map_err(ProcessError::Scratch)?;
        }
        Plan::Transcode(argv) => {
            if tracker.update(None, "encode", None, None).await? {
                return Err(ProcessError::Cancelled);
            }

            let (progress_tx, mut progress_rx) = mpsc::channel(16);
            let invoke = context.invoker.run(&argv, progress_tx, cancel_rx.clone());
            tokio::pin!(invoke);

            // Drive the invocation and the progress relay together; the
            // relay is also where cooperative cancellation is observed.
            let invoke_result = loop {
                tokio::select! {
                    result = &mut invoke => break result,
                    report = progress_rx.recv() => {
                        let Some(report) = report else {
                            // Progress pipe closed: only the exit status is
                            // left to collect.
                            break (&mut invoke).await;
                        };
                        let elapsed = report.elapsed_seconds.unwrap_or(0.0);
                        let percent = compute_percent(duration, elapsed)
                            // Hold just below the top; the terminal
                            // transition owns the exact 100.
                            .map(|p| p.min(99.0));
                        let eta = eta_seconds(duration, elapsed, report.speed);
                        match tracker.update(percent, "encode", report.fps, eta).await {
                            Ok(true) => {
                                _ = cancel_tx.send(true);
                            }
                            Ok(false) => {}
                            Err(ProcessError::LockLost) => {
                                _ = cancel_tx.send(true);
                            }
                            Err(err) => warn!("progress flush failed: {}", err),
                        }
                    }
                }
            };

            match invoke_result {
                Ok(()) => {}
                Err(crate::invoker::InvokeError::Cancelled) => {
                    return Err(ProcessError::Cancelled);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    if tracker.update(None, "upload", None, None).await? {
        return Err(ProcessError::Cancelled);
    }
    upload_outputs(context.storage.as_ref(), scratch.path(), &local_input, &output).await?;

    // Post-upload validation: the primary artifact must be visible.
    if tracker.update(None, "validate", None, None).await? {
        return Err(ProcessError::Cancelled);
    }
    context.storage.stat(&output).await?;

    Ok(())
}

/// HLS/DASH packaging emits a playlist plus segments into the scratch
/// directory; every produced file lands next to the requested output
/// locator. Single-file outputs degrade to one upload.
async fn upload_outputs(
    storage: &dyn StorageBackend,
    scratch_dir: &std::path::Path,
    local_input: &std::path::Path,
    output: &Locator,
) -> Result<(), ProcessError> {
    let mut entries = tokio::fs::read_dir(scratch_dir)
        .await
        .map_err(ProcessError::Scratch)?;
    let mut uploaded = 0usize;

    while let Some(entry) = entries.next_entry().await.map_err(ProcessError::Scratch)? {
        let path = entry.path();
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        if path == local_input || !is_file {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = sibling_locator(output, &name);
        storage.upload_file(&path, &target).await?;
        uploaded += 1;
    }

    if uploaded == 0 {
        return Err(ProcessError::Rejected(ErrorCode::Internal));
    }
    Ok(())
}

fn sibling_locator(output: &Locator, name: &str) -> Locator {
    match output {
        Locator::File(path) => {
            let parent = path.parent().unwrap_or_else(|| std::path::Path::new("/"));
            Locator::File(parent.join(name))
        }
        Locator::S3 { bucket, key } => {
            let prefix = key.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
            let key = if prefix.is_empty() {
                name.to_owned()
            } else {
                format!("{prefix}/{name}")
            };
            Locator::S3 {
                bucket: bucket.clone(),
                key,
            }
        }
    }
}

fn locator_file_name(locator: &Locator) -> String {
    match locator {
        Locator::File(path) => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input.bin".to_owned()),
        Locator::S3 { key, .. } => key
            .rsplit('/')
            .next()
            .map(str::to_owned)
            .unwrap_or_else(|| "input.bin".to_owned()),
    }
}

/// The combination the transcoder is about to produce for streaming must be
/// packagable; admission already refused obvious mismatches, this guards
/// against drift between admission and execution.
fn prevalidate_stream_operations(operations: &[Operation]) -> Result<(), ProcessError> {
    let Some(format) = operations.iter().find_map(|op| match op {
        Operation::Stream { format, .. } => Some(*format),
        _ => None,
    }) else {
        return Ok(());
    };

    for operation in operations {
        if let Operation::Transcode {
            video_codec: Some(codec),
            ..
        } = operation
        {
            if !allowed_video_codecs(format.as_str()).contains(&codec.as_str()) {
                return Err(ProcessError::Rejected(ErrorCode::CodecContainerMismatch));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::StreamFormat;

    #[test]
    fn sibling_locators_keep_the_directory() {
        let file = Locator::File("/storage/out/playlist.m3u8".into());
        assert_eq!(
            sibling_locator(&file, "seg-001.ts"),
            Locator::File("/storage/out/seg-001.ts".into())
        );

        let s3 = Locator::S3 {
            bucket: "media".into(),
            key: "out/playlist.m3u8".into(),
        };
        assert_eq!(
            sibling_locator(&s3, "seg-001.ts"),
            Locator::S3 {
                bucket: "media".into(),
                key: "out/seg-001.ts".into(),
            }
        );
    }

    #[test]
    fn locator_file_names() {
        assert_eq!(
            locator_file_name(&Locator::File("/storage/in/clip.mov".into())),
            "clip.mov"
        );
        assert_eq!(
            locator_file_name(&Locator::S3 {
                bucket: "b".into(),
                key: "deep/path/clip.mp4".into(),
            }),
            "clip.mp4"
        );
    }

    #[test]
    fn stream_prevalidation_refuses_mismatches() {
        let ops = vec![
            Operation::Transcode {
                video_codec: Some("vp9".to_owned()),
                audio_codec: None,
                crf: None,
                bitrate: None,
                resolution: None,
                preset: None,
            },
            Operation::Stream {
                format: StreamFormat::Hls,
                segment_seconds: None,
            },
        ];
        let err = prevalidate_stream_operations(&ops).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CodecContainerMismatch);

        let ok = vec![Operation::Stream {
            format: StreamFormat::Hls,
            segment_seconds: None,
        }];
        assert!(prevalidate_stream_operations(&ok).is_ok());
    }
}
