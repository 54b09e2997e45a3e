//! The job state machine: `INIT → WORKING → (FINALIZING | FINALIZING_FAULTED)
//! → (DONE | DONE_FAULTED)`, with a direct `INIT → FAULTED` pre-flight path.
//!
//! Only the task executing a job writes to it; status transitions are
//! monotonic and terminal states never mutate further.

use std::time::{Duration, Instant};

use crate::prelude::*;

/// Keys whose presence in a pop payload indicates image-generation leakage:
/// this job belongs to the image-generation side of the horde, not us.
const IMAGE_GENERATION_KEYS: [&str; 3] = ["width", "length", "steps"];

/// Maximum number of backend attempts before a job is faulted outright.
pub const MAX_RETRIES: u32 = 5;

/// Absolute cap on how long a job may run, regardless of
/// [`Job::stale_deadline`]. Whichever limit fires first wins.
pub const MAX_LIFETIME: Duration = Duration::from_secs(1200);

/// A job's position in its lifecycle.
///
/// The combined enum deliberately keeps "in pipeline" and "post-pipeline
/// terminal" variants together: collapsing `FAULTED` into `DONE_FAULTED` (or
/// vice versa) would lose the distinction between a generation-phase fault
/// and a submission-phase fault, which tests rely on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobStatus {
    Init,
    Working,
    Polling,
    Finalizing,
    FinalizingFaulted,
    Faulted,
    Done,
    DoneFaulted,
}

impl JobStatus {
    /// Is this status past the point where any further backend call will
    /// happen? `FAULTED` counts here even though it still needs to pass
    /// through submission, the same as `FINALIZING`/`FINALIZING_FAULTED`: the
    /// generation phase is over, only the submit phase remains.
    pub fn is_generation_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Faulted
                | JobStatus::Finalizing
                | JobStatus::FinalizingFaulted
                | JobStatus::Done
                | JobStatus::DoneFaulted
        )
    }

    /// Is this a terminal status? Once true, nothing about the job may
    /// change again: the submit phase has already run.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::DoneFaulted)
    }
}

/// The inputs the dispatcher gave us for one generation.
#[derive(Clone, Debug)]
pub struct JobPayload {
    pub prompt: String,
    pub max_length: u32,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stop_sequence: Option<Vec<String>>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub softprompt: Option<String>,

    /// The payload exactly as the dispatcher sent it, kept around for
    /// pre-flight inspection and passed through verbatim to KoboldAI.
    pub raw: Value,
}

/// A single unit of work: immutable inputs, mutable outputs, and bookkeeping.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: String,
    pub payload: JobPayload,

    pub text: Option<String>,
    pub seed: u64,
    pub censored: bool,

    pub status: JobStatus,
    pub start_time: Option<Instant>,
    pub stale_deadline: Option<Instant>,
    pub retry_count: u32,
    pub out_of_memory: bool,
}

impl Job {
    /// Construct a new job in the `INIT` state.
    pub fn new(id: String, payload: JobPayload) -> Self {
        Self {
            id,
            payload,
            text: None,
            seed: 0,
            censored: false,
            status: JobStatus::Init,
            start_time: None,
            stale_deadline: None,
            retry_count: 0,
            out_of_memory: false,
        }
    }

    /// Does this job's raw payload carry image-generation keys that leaked
    /// from the wrong side of the horde?
    pub fn has_image_generation_keys(&self) -> bool {
        match &self.payload.raw {
            Value::Object(map) => IMAGE_GENERATION_KEYS.iter().any(|key| map.contains_key(*key)),
            _ => false,
        }
    }

    /// Reject this job before it ever reaches the backend.
    pub fn reject_preflight(&mut self) {
        debug_assert_eq!(self.status, JobStatus::Init);
        self.status = JobStatus::Faulted;
    }

    /// Move from `INIT` to `WORKING`, computing the staleness deadline.
    pub fn start(&mut self) {
        debug_assert_eq!(self.status, JobStatus::Init);
        self.status = JobStatus::Working;
        let now = Instant::now();
        self.start_time = Some(now);
        let stale_secs = f64::from(self.payload.max_length) / 2.0 + 10.0;
        self.stale_deadline = Some(now + Duration::from_secs_f64(stale_secs));
    }

    /// Record a successful generation and move to `FINALIZING`.
    pub fn finalize_ok(&mut self, text: String, seed: u64) {
        self.text = Some(text);
        self.seed = seed;
        self.status = JobStatus::Finalizing;
    }

    /// Record an unrecoverable backend failure and move to
    /// `FINALIZING_FAULTED`.
    pub fn finalize_faulted(&mut self) {
        self.status = JobStatus::FinalizingFaulted;
    }

    /// Flag this job as having hit a resource-exhaustion error.
    pub fn mark_out_of_memory(&mut self) {
        self.out_of_memory = true;
    }

    /// Move from `FINALIZING`/`FINALIZING_FAULTED` to the matching terminal
    /// state, once the dispatcher has accepted (or given up on) the submit.
    pub fn mark_submitted(&mut self) {
        self.status = match self.status {
            JobStatus::Finalizing => JobStatus::Done,
            JobStatus::FinalizingFaulted | JobStatus::Faulted => JobStatus::DoneFaulted,
            other => other,
        };
    }

    /// Move `FINALIZING`/`FINALIZING_FAULTED` to `DONE_FAULTED` after the
    /// submit call itself gave up (retries exhausted, no reward known). A
    /// pre-flight `FAULTED` job never had a generation result to report, so
    /// it simply stays `FAULTED`: the dispatcher never confirmed it either
    /// way.
    pub fn mark_submit_exhausted(&mut self) {
        if matches!(self.status, JobStatus::Finalizing | JobStatus::FinalizingFaulted) {
            self.status = JobStatus::DoneFaulted;
        }
    }

    /// Is this job stale: started, not yet terminal, and past its deadline?
    pub fn is_stale(&self) -> bool {
        if self.status == JobStatus::Init || self.status.is_terminal() {
            return false;
        }
        let Some(start_time) = self.start_time else {
            return false;
        };
        let now = Instant::now();
        if now.duration_since(start_time) > MAX_LIFETIME {
            return true;
        }
        match self.stale_deadline {
            Some(deadline) => now > deadline,
            None => false,
        }
    }

    /// Build the JSON body for the dispatcher submit call.
    pub fn submit_payload(&self) -> Value {
        let mut body = serde_json::Map::new();
        body.insert("id".to_string(), Value::String(self.id.clone()));
        body.insert(
            "generation".to_string(),
            Value::String(self.text.clone().unwrap_or_default()),
        );
        body.insert("seed".to_string(), Value::from(self.seed));
        if matches!(
            self.status,
            JobStatus::Faulted | JobStatus::FinalizingFaulted | JobStatus::DoneFaulted
        ) {
            body.insert("state".to_string(), Value::String("faulted".to_string()));
        } else if self.censored {
            body.insert("state".to_string(), Value::String("censored".to_string()));
        }
        Value::Object(body)
    }
}

/// Does an error's message mention "out of memory"? Used to set
/// [`Job::out_of_memory`] regardless of which backend produced the error.
pub fn mentions_out_of_memory(error: &anyhow::Error) -> bool {
    error.to_string().to_lowercase().contains("out of memory")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(max_length: u32, raw: Value) -> JobPayload {
        JobPayload {
            prompt: "hello".to_string(),
            max_length,
            temperature: None,
            top_p: None,
            stop_sequence: None,
            frequency_penalty: None,
            presence_penalty: None,
            softprompt: None,
            raw,
        }
    }

    #[test]
    fn image_generation_keys_trigger_preflight_rejection() {
        let mut job = Job::new(
            "J1".to_string(),
            payload(16, json!({"prompt": "a cat", "steps": 20})),
        );
        assert!(job.has_image_generation_keys());
        job.reject_preflight();
        assert_eq!(job.status, JobStatus::Faulted);
    }

    #[test]
    fn clean_path_ends_done() {
        let mut job = Job::new("J1".to_string(), payload(16, json!({"prompt": "hi"})));
        job.start();
        assert_eq!(job.status, JobStatus::Working);
        job.finalize_ok("Hello".to_string(), 0);
        assert_eq!(job.status, JobStatus::Finalizing);
        job.mark_submitted();
        assert_eq!(job.status, JobStatus::Done);
    }

    #[test]
    fn faulted_generation_ends_done_faulted_after_submit() {
        let mut job = Job::new("J1".to_string(), payload(16, json!({"prompt": "hi"})));
        job.start();
        job.finalize_faulted();
        assert_eq!(job.status, JobStatus::FinalizingFaulted);
        let payload = job.submit_payload();
        assert_eq!(payload["state"], "faulted");
        job.mark_submitted();
        assert_eq!(job.status, JobStatus::DoneFaulted);
    }

    #[test]
    fn preflight_faulted_job_still_reaches_done_faulted_after_submit() {
        let mut job = Job::new(
            "J1".to_string(),
            payload(16, json!({"prompt": "a cat", "steps": 20})),
        );
        assert!(job.has_image_generation_keys());
        job.reject_preflight();
        assert_eq!(job.status, JobStatus::Faulted);
        assert!(job.status.is_generation_terminal());
        assert!(!job.status.is_terminal());
        let payload = job.submit_payload();
        assert_eq!(payload["state"], "faulted");
        job.mark_submitted();
        assert_eq!(job.status, JobStatus::DoneFaulted);
        assert!(job.status.is_terminal());
    }

    #[test]
    fn submit_exhaustion_faults_finalizing_but_leaves_faulted_alone() {
        let mut clean = Job::new("J1".to_string(), payload(16, json!({"prompt": "hi"})));
        clean.start();
        clean.finalize_ok("hi".to_string(), 0);
        clean.mark_submit_exhausted();
        assert_eq!(clean.status, JobStatus::DoneFaulted);

        let mut preflight = Job::new(
            "J2".to_string(),
            payload(16, json!({"prompt": "a cat", "steps": 20})),
        );
        preflight.reject_preflight();
        preflight.mark_submit_exhausted();
        assert_eq!(preflight.status, JobStatus::Faulted);
    }

    #[test]
    fn minimum_max_length_yields_at_least_ten_point_five_second_deadline() {
        let mut job = Job::new("J1".to_string(), payload(1, json!({"prompt": "hi"})));
        job.start();
        let deadline = job.stale_deadline.unwrap();
        let start = job.start_time.unwrap();
        assert!(deadline.duration_since(start) >= Duration::from_millis(10_500));
    }

    #[test]
    fn not_yet_started_jobs_are_never_stale() {
        let job = Job::new("J1".to_string(), payload(16, json!({"prompt": "hi"})));
        assert!(!job.is_stale());
    }

    #[test]
    fn terminal_jobs_are_never_stale() {
        let mut job = Job::new("J1".to_string(), payload(1, json!({"prompt": "hi"})));
        job.start();
        job.finalize_ok("hi".to_string(), 0);
        job.mark_submitted();
        assert_eq!(job.status, JobStatus::Done);
        assert!(!job.is_stale());
    }

    #[test]
    fn out_of_memory_substring_is_detected_case_insensitively() {
        let error = anyhow!("CUDA error: Out Of Memory");
        assert!(mentions_out_of_memory(&error));
        let error = anyhow!("connection reset by peer");
        assert!(!mentions_out_of_memory(&error));
    }
}
