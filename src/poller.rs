//! Completion polling: `Submitted -> Polling -> {Completed | Failed | TimedOut}`.
//!
//! The loop only retries "no record yet" and "not completed yet". Transport
//! failures end the poll immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use crate::client::JobServer;
use crate::error::{PipelineError, Result};
use crate::job::{Job, JobSnapshot, JobStatus, SnapshotStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval: Duration::from_millis(3000),
        }
    }
}

impl PollPolicy {
    /// Longest time a poll can take, excluding request latency.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Shared flag a caller flips to abandon polling.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed { snapshot: JobSnapshot, attempts: u32 },
    Failed { reason: String, attempts: u32 },
    TimedOut { attempts: u32 },
}

enum PollState {
    Submitted,
    Polling { attempt: u32 },
    Done(PollOutcome),
}

pub struct CompletionPoller<'a> {
    server: &'a dyn JobServer,
    sleeper: &'a dyn Sleeper,
    policy: PollPolicy,
    cancel: Option<CancelFlag>,
}

impl<'a> CompletionPoller<'a> {
    pub fn new(server: &'a dyn JobServer, sleeper: &'a dyn Sleeper, policy: PollPolicy) -> Self {
        Self {
            server,
            sleeper,
            policy,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn ensure_not_cancelled(&self, job: &Job) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.is_cancelled() => {
                Err(PipelineError::Cancelled(job.prompt_id.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Polls until `job` reaches a terminal state, updating its status on
    /// the way.
    pub async fn wait(&self, job: &mut Job) -> Result<PollOutcome> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut state = PollState::Submitted;

        loop {
            state = match state {
                PollState::Submitted => {
                    debug!(
                        "Waiting for job {} for up to {:?}",
                        job.prompt_id,
                        self.policy.budget()
                    );
                    PollState::Polling { attempt: 1 }
                }
                PollState::Polling { attempt } => {
                    self.ensure_not_cancelled(job)?;
                    debug!(
                        "Checking job {} status, attempt {}/{}",
                        job.prompt_id, attempt, max_attempts
                    );

                    let polled = self.server.poll_status(&job.prompt_id).await;
                    let snapshot = match polled {
                        Ok(snapshot) => snapshot,
                        Err(err) => {
                            job.transition(JobStatus::Failed);
                            return Err(err);
                        }
                    };

                    match snapshot {
                        Some(snapshot) => match snapshot.status.clone() {
                            SnapshotStatus::Completed => {
                                job.transition(JobStatus::Completed);
                                PollState::Done(PollOutcome::Completed {
                                    snapshot,
                                    attempts: attempt,
                                })
                            }
                            SnapshotStatus::Failed { reason } => {
                                job.transition(JobStatus::Failed);
                                PollState::Done(PollOutcome::Failed {
                                    reason,
                                    attempts: attempt,
                                })
                            }
                            SnapshotStatus::Pending => {
                                job.transition(JobStatus::Running);
                                self.next_attempt(job, attempt, max_attempts).await?
                            }
                        },
                        None => self.next_attempt(job, attempt, max_attempts).await?,
                    }
                }
                PollState::Done(outcome) => return Ok(outcome),
            };
        }
    }

    async fn next_attempt(&self, job: &mut Job, attempt: u32, max_attempts: u32) -> Result<PollState> {
        if attempt >= max_attempts {
            job.transition(JobStatus::TimedOut);
            return Ok(PollState::Done(PollOutcome::TimedOut { attempts: attempt }));
        }
        self.sleeper.sleep(self.policy.interval).await;
        self.ensure_not_cancelled(job)?;
        Ok(PollState::Polling {
            attempt: attempt + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{OutputDescriptor, SubmitReceipt};
    use serde_json::Value;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    enum Script {
        CompleteOnCall(u32),
        Never,
        FailTransportOnCall(u32),
        ServerErrorOnCall(u32),
    }

    struct ScriptedServer {
        script: Script,
        calls: AtomicU32,
    }

    impl ScriptedServer {
        fn new(script: Script) -> Self {
            Self {
                script,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn completed() -> JobSnapshot {
        JobSnapshot {
            status: SnapshotStatus::Completed,
            outputs: vec![OutputDescriptor {
                node_id: "9".into(),
                filename: "x.png".into(),
                subfolder: String::new(),
                kind: "output".into(),
            }],
        }
    }

    #[async_trait]
    impl JobServer for ScriptedServer {
        async fn submit(&self, _workflow: &Value) -> Result<SubmitReceipt> {
            unreachable!("poller never submits")
        }

        async fn poll_status(&self, _prompt_id: &str) -> Result<Option<JobSnapshot>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.script {
                Script::CompleteOnCall(n) if call == n => Ok(Some(completed())),
                Script::FailTransportOnCall(n) if call == n => {
                    Err(PipelineError::Transport("connection refused".into()))
                }
                Script::ServerErrorOnCall(n) if call == n => Ok(Some(JobSnapshot {
                    status: SnapshotStatus::Failed {
                        reason: "boom".into(),
                    },
                    outputs: vec![],
                })),
                Script::Never if call % 2 == 0 => Ok(Some(JobSnapshot {
                    status: SnapshotStatus::Pending,
                    outputs: vec![],
                })),
                _ => Ok(None),
            }
        }

        async fn fetch_artifact_bytes(&self, _output: &OutputDescriptor) -> Result<Vec<u8>> {
            unreachable!("poller never downloads")
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        naps: Mutex<Vec<Duration>>,
        cancel_after: Option<(usize, CancelFlag)>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            let mut naps = self.naps.lock().unwrap();
            naps.push(duration);
            if let Some((after, flag)) = &self.cancel_after {
                if naps.len() >= *after {
                    flag.cancel();
                }
            }
        }
    }

    fn job() -> Job {
        Job::submitted(SubmitReceipt {
            prompt_id: "abc".into(),
            client_id: "client".into(),
        })
    }

    fn policy(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            max_attempts,
            interval: Duration::from_millis(3000),
        }
    }

    #[tokio::test]
    async fn completes_on_sixth_poll() {
        let server = ScriptedServer::new(Script::CompleteOnCall(6));
        let sleeper = RecordingSleeper::default();
        let mut job = job();

        let outcome = CompletionPoller::new(&server, &sleeper, policy(60))
            .wait(&mut job)
            .await
            .unwrap();

        assert_eq!(server.calls(), 6);
        assert_eq!(sleeper.naps.lock().unwrap().len(), 5);
        assert!(matches!(outcome, PollOutcome::Completed { attempts: 6, .. }));
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn times_out_after_budget() {
        let server = ScriptedServer::new(Script::Never);
        let sleeper = RecordingSleeper::default();
        let mut job = job();

        let outcome = CompletionPoller::new(&server, &sleeper, policy(3))
            .wait(&mut job)
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::TimedOut { attempts: 3 });
        assert_eq!(server.calls(), 3);
        assert_eq!(
            *sleeper.naps.lock().unwrap(),
            vec![Duration::from_millis(3000); 2]
        );
        assert_eq!(job.status, JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn transport_errors_are_not_retried() {
        let server = ScriptedServer::new(Script::FailTransportOnCall(2));
        let sleeper = RecordingSleeper::default();
        let mut job = job();

        let err = CompletionPoller::new(&server, &sleeper, policy(60))
            .wait(&mut job)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Transport(_)));
        assert_eq!(server.calls(), 2);
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn server_side_failure_is_terminal() {
        let server = ScriptedServer::new(Script::ServerErrorOnCall(1));
        let sleeper = RecordingSleeper::default();
        let mut job = job();

        let outcome = CompletionPoller::new(&server, &sleeper, policy(60))
            .wait(&mut job)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PollOutcome::Failed {
                reason: "boom".into(),
                attempts: 1
            }
        );
        assert!(sleeper.naps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let server = ScriptedServer::new(Script::Never);
        let flag = CancelFlag::new();
        let sleeper = RecordingSleeper {
            naps: Mutex::new(Vec::new()),
            cancel_after: Some((2, flag.clone())),
        };
        let mut job = job();

        let err = CompletionPoller::new(&server, &sleeper, policy(60))
            .with_cancel(flag)
            .wait(&mut job)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled(id) if id == "abc"));
        assert_eq!(server.calls(), 2);
    }

    #[test]
    fn budget_counts_sleeps_between_attempts() {
        assert_eq!(policy(3).budget(), Duration::from_millis(6000));
        assert_eq!(PollPolicy::default().budget(), Duration::from_millis(177_000));
    }
}
