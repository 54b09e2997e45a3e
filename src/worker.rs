//! Per-model worker loop: readiness gate, bounded in-flight jobs, a
//! staleness watchdog, and a soft-restart escalation ladder.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use indicatif::ProgressBar;
use keen_retry::RetryResult;
use tokio::{sync::Semaphore, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    backends::Backend,
    bridge_data::BridgeData,
    dispatcher::DispatcherClient,
    job::{Job, JobStatus, MAX_LIFETIME, MAX_RETRIES, mentions_out_of_memory},
    prelude::*,
    stats::Stats,
};

const RELOAD_INTERVAL: Duration = Duration::from_secs(60);
const STATUS_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_SLEEP: Duration = Duration::from_millis(20);
const UNAVAILABLE_SLEEP: Duration = Duration::from_secs(5);

/// Five bad generations in a row earns a soft restart.
const FAILURE_RESTART_THRESHOLD: u32 = 5;
/// Ten OOM terminations in one worker's lifetime ends the process.
const OOM_SHUTDOWN_THRESHOLD: u32 = 10;
/// More than fifteen soft restarts ends the process.
const SOFT_RESTART_SHUTDOWN_THRESHOLD: u32 = 15;

/// One generation task in flight, tracked for the staleness watchdog.
struct RunningJob {
    job_id: String,
    start_time: Instant,
    stale_deadline: Instant,
    handle: JoinHandle<GenerationOutcome>,
}

/// What a generation task hands back to the worker loop.
struct GenerationOutcome {
    job: Job,
    applied_softprompt: Option<String>,
}

/// Per-model worker. Owns its [`BridgeData`] outright; nothing else mutates
/// it.
pub struct Worker {
    bridge_data: BridgeData,
    backend: Arc<dyn Backend>,
    dispatcher: DispatcherClient,
    stats: Stats,
    cancellation: CancellationToken,
    /// Liveness spinner shown in the terminal. `None` in tests and whenever
    /// progress bars are hidden.
    spinner: Option<ProgressBar>,

    queue_size: u32,
    semaphore: Arc<Semaphore>,
    running_jobs: Vec<RunningJob>,
    waiting_jobs: VecDeque<Job>,
    /// Submit calls in flight, detached from their generation task so the
    /// executor slot frees up as soon as generation ends. Tracked so
    /// shutdown can wait for them instead of abandoning them.
    pending_submits: Vec<JoinHandle<Option<String>>>,

    consecutive_failed_jobs: u32,
    consecutive_executor_restarts: u32,
    out_of_memory_jobs: u32,
    soft_restarts: u32,

    next_reload: Instant,
    last_status_at: Instant,
}

impl Worker {
    /// Build a new worker. Does not probe readiness; the first loop
    /// iteration does that via [`Worker::reload`].
    pub fn new(
        bridge_data: BridgeData,
        backend: Arc<dyn Backend>,
        dispatcher: DispatcherClient,
        stats: Stats,
        queue_size: u32,
        cancellation: CancellationToken,
        spinner: Option<ProgressBar>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(bridge_data.max_threads as usize));
        let now = Instant::now();
        Self {
            bridge_data,
            backend,
            dispatcher,
            stats,
            cancellation,
            spinner,
            queue_size,
            semaphore,
            running_jobs: Vec::new(),
            waiting_jobs: VecDeque::new(),
            pending_submits: Vec::new(),
            consecutive_failed_jobs: 0,
            consecutive_executor_restarts: 0,
            out_of_memory_jobs: 0,
            soft_restarts: 0,
            next_reload: now,
            last_status_at: now,
        }
    }

    /// Run until cancelled or until the escalation ladder calls for a
    /// shutdown. Returns `Ok(())` for a clean stop, `Err` if the ladder fired
    /// (the caller should exit with a non-zero status).
    #[instrument(level = "info", skip_all, fields(worker = %self.bridge_data.worker_name))]
    pub async fn run(mut self) -> Result<()> {
        loop {
            if self.cancellation.is_cancelled() {
                self.drain_on_shutdown().await;
                if let Some(spinner) = &self.spinner {
                    spinner.finish_with_message("stopped");
                }
                info!(worker = %self.bridge_data.worker_name, "worker stopped");
                return Ok(());
            }

            let now = Instant::now();
            if now >= self.next_reload {
                self.reload().await;
            }

            if !self.bridge_data.available {
                sleep(UNAVAILABLE_SLEEP).await;
                self.next_reload = self.next_reload.min(Instant::now() + UNAVAILABLE_SLEEP);
                continue;
            }

            if self.queue_size > 0 && self.waiting_jobs.len() < self.queue_size as usize {
                if let Some(job) = self.dispatcher.pop(&mut self.bridge_data, &self.stats).await {
                    self.waiting_jobs.push_back(job);
                }
            }

            self.fill_executor().await;

            if let Some(shutdown_reason) = self.scan_running_jobs().await {
                self.drain_on_shutdown().await;
                return Err(anyhow!(
                    "worker {:?} shutting down: {shutdown_reason}",
                    self.bridge_data.worker_name
                ));
            }

            self.reap_pending_submits().await;
            self.maybe_log_status();
            sleep(IDLE_SLEEP).await;
        }
    }

    /// Re-run the backend readiness probe and resize the executor to the
    /// (possibly changed) `max_threads`.
    async fn reload(&mut self) {
        match self.backend.validate(&mut self.bridge_data).await {
            Ok(()) => {}
            Err(error) => {
                warn!(worker = %self.bridge_data.worker_name, "readiness probe failed: {error:#}");
                self.bridge_data.available = false;
            }
        }
        self.semaphore = Arc::new(Semaphore::new(self.bridge_data.max_threads as usize));
        self.next_reload = Instant::now() + RELOAD_INTERVAL;
    }

    /// Start as many jobs as the bounded executor has room for.
    async fn fill_executor(&mut self) {
        loop {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            let job = if let Some(job) = self.waiting_jobs.pop_front() {
                Some(job)
            } else if self.queue_size == 0 {
                self.dispatcher.pop(&mut self.bridge_data, &self.stats).await
            } else {
                None
            };
            let Some(job) = job else {
                drop(permit);
                break;
            };
            self.spawn_generation(job, permit);
        }
    }

    fn spawn_generation(&mut self, mut job: Job, permit: tokio::sync::OwnedSemaphorePermit) {
        let job_id = job.id.clone();

        if job.has_image_generation_keys() {
            job.reject_preflight();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                GenerationOutcome {
                    job,
                    applied_softprompt: None,
                }
            });
            let now = Instant::now();
            self.running_jobs.push(RunningJob {
                job_id,
                start_time: now,
                stale_deadline: now,
                handle,
            });
            return;
        }

        job.start();
        let start_time = job.start_time.expect("start_time set by Job::start");
        let stale_deadline = job.stale_deadline.expect("stale_deadline set by Job::start");
        let backend = Arc::clone(&self.backend);
        let bridge_data = self.bridge_data.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            run_generation(backend, bridge_data, job).await
        });
        self.running_jobs.push(RunningJob {
            job_id,
            start_time,
            stale_deadline,
            handle,
        });
    }

    /// Reap finished jobs (applying the escalation ladder) and cancel stale
    /// ones. Returns `Some(reason)` if the ladder calls for a shutdown.
    async fn scan_running_jobs(&mut self) -> Option<String> {
        let mut soft_restart_requested = false;
        let mut shutdown_reason = None;

        let mut i = 0;
        while i < self.running_jobs.len() {
            if self.running_jobs[i].handle.is_finished() {
                let running = self.running_jobs.remove(i);
                match running.handle.await {
                    Ok(outcome) => self.absorb_outcome(outcome, &mut soft_restart_requested, &mut shutdown_reason),
                    Err(join_error) => {
                        warn!(job_id = %running.job_id, "generation task panicked: {join_error}");
                        self.record_generation_result(
                            true,
                            false,
                            &mut soft_restart_requested,
                            &mut shutdown_reason,
                        );
                    }
                }
                continue;
            }

            let now = Instant::now();
            let rj = &self.running_jobs[i];
            if now > rj.stale_deadline || now.duration_since(rj.start_time) > MAX_LIFETIME {
                let running = self.running_jobs.remove(i);
                running.handle.abort();
                warn!(job_id = %running.job_id, "job exceeded its deadline; cancelling");
                soft_restart_requested = true;
                continue;
            }
            i += 1;
        }

        if soft_restart_requested && shutdown_reason.is_none() {
            self.soft_restart();
            if self.soft_restarts > SOFT_RESTART_SHUTDOWN_THRESHOLD {
                shutdown_reason = Some(format!(
                    "exceeded {SOFT_RESTART_SHUTDOWN_THRESHOLD} soft restarts"
                ));
            }
        }

        shutdown_reason
    }

    fn absorb_outcome(
        &mut self,
        outcome: GenerationOutcome,
        soft_restart_requested: &mut bool,
        shutdown_reason: &mut Option<String>,
    ) {
        if let Some(softprompt) = outcome.applied_softprompt {
            self.bridge_data.current_softprompt = Some(softprompt);
        }
        let faulted = matches!(
            outcome.job.status,
            JobStatus::Faulted | JobStatus::FinalizingFaulted
        );
        let out_of_memory = outcome.job.out_of_memory;
        self.record_generation_result(faulted, out_of_memory, soft_restart_requested, shutdown_reason);
        self.spawn_submit(outcome.job);
    }

    /// Apply the escalation ladder (§4.4) for one generation task's result.
    fn record_generation_result(
        &mut self,
        faulted: bool,
        out_of_memory: bool,
        soft_restart_requested: &mut bool,
        shutdown_reason: &mut Option<String>,
    ) {
        if !faulted {
            self.consecutive_failed_jobs = 0;
            self.consecutive_executor_restarts = 0;
            return;
        }

        if out_of_memory {
            self.out_of_memory_jobs += 1;
            if self.out_of_memory_jobs >= OOM_SHUTDOWN_THRESHOLD && shutdown_reason.is_none() {
                *shutdown_reason = Some(format!(
                    "reached {OOM_SHUTDOWN_THRESHOLD} out-of-memory terminations"
                ));
                return;
            }
        }

        // A fault of any kind after a restart, with no clean job in between
        // to prove the restart fixed anything, is fatal: don't wait for
        // another full run of `FAILURE_RESTART_THRESHOLD` failures first.
        if self.consecutive_executor_restarts > 0 {
            if shutdown_reason.is_none() {
                *shutdown_reason = Some(
                    "worker keeps crashing after a thread executor restart".to_string(),
                );
            }
            return;
        }

        self.consecutive_failed_jobs += 1;
        if self.consecutive_failed_jobs >= FAILURE_RESTART_THRESHOLD {
            *soft_restart_requested = true;
            self.consecutive_executor_restarts += 1;
        }
    }

    /// Tear down the bounded executor and clear in-memory job state,
    /// without touching the process.
    fn soft_restart(&mut self) {
        for running in self.running_jobs.drain(..) {
            running.handle.abort();
        }
        self.waiting_jobs.clear();
        self.semaphore = Arc::new(Semaphore::new(self.bridge_data.max_threads as usize));
        self.soft_restarts += 1;
        self.consecutive_failed_jobs = 0;
    }

    /// Submit a finished job's result on a detached task, so the executor
    /// slot it held during generation is already free. The task is tracked
    /// in `pending_submits` rather than truly fire-and-forget, so shutdown
    /// can wait for it instead of abandoning it.
    fn spawn_submit(&mut self, job: Job) {
        let dispatcher = self.dispatcher.clone();
        let stats = self.stats.clone();
        let model_name = self.bridge_data.advertised_model_name();
        let handle = tokio::spawn(async move {
            let mut job = job;
            match dispatcher.submit(&job).await {
                Ok(outcome) => {
                    job.mark_submitted();
                    if job.status == JobStatus::Done {
                        stats.record_job_completion(&model_name, outcome.reward);
                    }
                    outcome.username
                }
                Err(error) => {
                    warn!(job_id = %job.id, "submit failed: {error}");
                    job.mark_submit_exhausted();
                    None
                }
            }
        });
        self.pending_submits.push(handle);
    }

    /// Reap finished submit tasks, learning `bridge_data.username` from any
    /// that reported one.
    async fn reap_pending_submits(&mut self) {
        let mut i = 0;
        while i < self.pending_submits.len() {
            if self.pending_submits[i].is_finished() {
                let handle = self.pending_submits.remove(i);
                match handle.await {
                    Ok(Some(username)) => self.bridge_data.username = Some(username),
                    Ok(None) => {}
                    Err(join_error) => {
                        warn!("submit task panicked: {join_error}");
                    }
                }
                continue;
            }
            i += 1;
        }
    }

    fn maybe_log_status(&mut self) {
        self.stats
            .set_worker_running(&self.bridge_data.worker_name, self.running_jobs.len() as u32);
        if let Some(spinner) = &self.spinner {
            spinner.set_message(format!(
                "{} running, {} waiting",
                self.running_jobs.len(),
                self.waiting_jobs.len()
            ));
        }

        let now = Instant::now();
        if now.duration_since(self.last_status_at) < STATUS_INTERVAL {
            return;
        }
        self.last_status_at = now;
        info!(
            worker = %self.bridge_data.worker_name,
            running = self.running_jobs.len(),
            waiting = self.waiting_jobs.len(),
            kudos_per_hour = self.stats.kudos_per_hour(),
            jobs_per_hour = self.stats.jobs_per_hour(),
            "worker status"
        );
    }

    /// On cooperative shutdown, let in-flight generations and submissions
    /// finish rather than hard-killing them.
    async fn drain_on_shutdown(&mut self) {
        for running in self.running_jobs.drain(..) {
            if let Ok(outcome) = running.handle.await {
                self.spawn_submit(outcome.job);
            }
        }
        for handle in self.pending_submits.drain(..) {
            if let Err(join_error) = handle.await {
                warn!("submit task panicked: {join_error}");
            }
        }
    }
}

/// Run one job's generate phase, retrying transient backend failures up to
/// [`MAX_RETRIES`] times.
async fn run_generation(backend: Arc<dyn Backend>, bridge_data: BridgeData, mut job: Job) -> GenerationOutcome {
    let mut applied_softprompt = None;
    for attempt in 0..MAX_RETRIES {
        match backend.generate(&bridge_data, &job.payload).await {
            RetryResult::Ok { output, .. } => {
                if output.applied_softprompt.is_some() {
                    applied_softprompt = output.applied_softprompt;
                }
                job.finalize_ok(output.text, output.seed);
                break;
            }
            RetryResult::Fatal { error, .. } => {
                if mentions_out_of_memory(&error) {
                    job.mark_out_of_memory();
                }
                warn!(job_id = %job.id, attempt, "generation faulted: {error:#}");
                job.finalize_faulted();
                break;
            }
            RetryResult::Transient { error, .. } => {
                job.retry_count += 1;
                if mentions_out_of_memory(&error) {
                    job.mark_out_of_memory();
                }
                debug!(job_id = %job.id, attempt, "transient generation error: {error:#}");
                if attempt + 1 == MAX_RETRIES {
                    job.finalize_faulted();
                }
            }
        }
    }
    GenerationOutcome {
        job,
        applied_softprompt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_match_the_documented_ladder() {
        assert_eq!(FAILURE_RESTART_THRESHOLD, 5);
        assert_eq!(OOM_SHUTDOWN_THRESHOLD, 10);
        assert_eq!(SOFT_RESTART_SHUTDOWN_THRESHOLD, 15);
    }

    fn new_for_ladder_test() -> Worker {
        let ambient = crate::config::AmbientSettings {
            branded_model: false,
            nsfw: false,
            blacklist: Vec::new(),
        };
        let endpoint = crate::config::Endpoint {
            r#type: crate::config::EndpointType::Koboldai,
            name: "test".to_string(),
            url: "http://127.0.0.1:1".to_string(),
            api_key: None,
            models: Vec::new(),
        };
        let model = crate::config::ModelEntry {
            name: "test-worker".to_string(),
            model: None,
            max_threads: 1,
            max_length: 80,
            max_context_length: 1024,
        };
        let bridge_data = BridgeData::new(
            "http://horde.example".to_string(),
            "key".to_string(),
            &endpoint,
            &model,
            Vec::new(),
            &ambient,
        );
        let dispatcher =
            DispatcherClient::new(reqwest::Client::new(), "http://horde.example".to_string(), "key".to_string());
        Worker::new(
            bridge_data,
            Arc::from(crate::backends::create_backend(
                reqwest::Client::new(),
                crate::config::EndpointType::Koboldai,
            )),
            dispatcher,
            Stats::new(),
            0,
            CancellationToken::new(),
            None,
        )
    }

    #[test]
    fn a_fault_right_after_a_restart_is_immediately_fatal() {
        let mut worker = new_for_ladder_test();
        worker.consecutive_executor_restarts = 1;
        let mut soft_restart_requested = false;
        let mut shutdown_reason = None;
        worker.record_generation_result(true, false, &mut soft_restart_requested, &mut shutdown_reason);
        assert!(shutdown_reason.is_some());
        assert!(!soft_restart_requested);
        assert_eq!(worker.consecutive_failed_jobs, 0);
    }

    #[test]
    fn five_consecutive_faults_without_a_prior_restart_trigger_one() {
        let mut worker = new_for_ladder_test();
        let mut soft_restart_requested = false;
        let mut shutdown_reason = None;
        for _ in 0..FAILURE_RESTART_THRESHOLD - 1 {
            worker.record_generation_result(true, false, &mut soft_restart_requested, &mut shutdown_reason);
            assert!(!soft_restart_requested);
            assert!(shutdown_reason.is_none());
        }
        worker.record_generation_result(true, false, &mut soft_restart_requested, &mut shutdown_reason);
        assert!(soft_restart_requested);
        assert!(shutdown_reason.is_none());
        assert_eq!(worker.consecutive_executor_restarts, 1);
    }
}
