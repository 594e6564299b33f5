//! Per-channel admission control.
//!
//! Every check, download and upload asks the [`Regulator`] for approval
//! first. Unknown channels and bad signatures are rejected, checks are
//! always approved, and transfers are routed to the first quota tier whose
//! `max_file_size` fits the object. A tier enforces daily file and byte caps
//! and a limit on simultaneous tasks; tasks over that limit are deferred and
//! woken, in FIFO order, only by [`Regulator::finalize`] on the same tier.

mod channel;
mod quota;
mod signature;

pub use channel::Channel;
pub use quota::{DeferredWait, Quota, QuotaUsage};
pub use signature::expected_signature;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ChannelConfig;
use crate::digest::Digest;

/// Minimum wait before answering a request with an unverifiable signature.
pub const SIGNATURE_REJECTION_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Check,
    Download,
    Upload,
}

impl TaskKind {
    pub fn name(self) -> &'static str {
        match self {
            TaskKind::Check => "check",
            TaskKind::Download => "download",
            TaskKind::Upload => "upload",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("Channel not found in config: {0}")]
    UnknownChannel(String),
    #[error("incorrect or missing signature")]
    BadSignature,
    #[error("No relevant {0} quota found")]
    NoQuota(TaskKind),
    #[error("Exceeded number of files per day for this quota.")]
    FilesPerDayExceeded,
    #[error("Exceeded number of bytes per day for this quota.")]
    BytesPerDayExceeded,
    #[error("Task was abandoned before it could start")]
    Abandoned,
}

impl AdmissionError {
    /// How long the caller must wait before responding with this rejection.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            AdmissionError::UnknownChannel(_) | AdmissionError::BadSignature => {
                Some(SIGNATURE_REJECTION_DELAY)
            }
            _ => None,
        }
    }
}

/// What the transport knows about a request beyond its size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// HEAD requests are not billed.
    pub head: bool,
    /// Length of the requested byte range, when one was honored.
    pub range_len: Option<u64>,
}

impl RequestMeta {
    /// Effective `(files, bytes)` billed for a task on an object of `num_bytes`.
    pub fn effective(&self, num_bytes: u64) -> (u64, u64) {
        if self.head {
            return (0, 0);
        }
        (1, self.range_len.unwrap_or(num_bytes))
    }
}

/// Everything the regulator needs to judge one request.
#[derive(Debug, Clone, Copy)]
pub struct TaskRequest<'a> {
    pub kind: TaskKind,
    pub channel: &'a str,
    pub digest: &'a Digest,
    /// Full object size (download) or declared length (upload).
    pub num_bytes: u64,
    pub signature: &'a str,
    pub meta: RequestMeta,
}

/// Ticket produced by admission control. Consumed by
/// [`Regulator::finalize`].
#[derive(Debug)]
pub struct Approval {
    pub kind: TaskKind,
    /// The tier billed for this task; `None` for checks.
    pub quota: Option<Arc<Quota>>,
    pub effective_files: u64,
    pub effective_bytes: u64,
    pub timestamp: DateTime<Local>,
    pub deferred: bool,
    /// Extra wait the caller must honor once the approval is active.
    pub delay: Option<Duration>,
}

#[derive(Debug)]
pub enum Admission {
    Active(Approval),
    Deferred(Approval, DeferredWait),
}

pub struct Regulator {
    channels: HashMap<String, Channel>,
    test_signature: Option<String>,
}

impl Regulator {
    pub fn new(channels: &[ChannelConfig], test_signature: Option<String>) -> Self {
        Self {
            channels: channels
                .iter()
                .map(|c| (c.name.clone(), Channel::new(c)))
                .collect(),
            test_signature,
        }
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn approve(&self, request: TaskRequest<'_>) -> Result<Admission, AdmissionError> {
        self.approve_at(request, Local::now())
    }

    /// Judge `request` as if it arrived at `now`.
    pub fn approve_at(
        &self,
        request: TaskRequest<'_>,
        now: DateTime<Local>,
    ) -> Result<Admission, AdmissionError> {
        let channel = self.authenticated_channel(&request)?;

        let tier = match request.kind {
            TaskKind::Check => {
                return Ok(Admission::Active(Approval {
                    kind: TaskKind::Check,
                    quota: None,
                    effective_files: 0,
                    effective_bytes: 0,
                    timestamp: now,
                    deferred: false,
                    delay: None,
                }));
            }
            TaskKind::Download => channel.download_tier(request.num_bytes),
            TaskKind::Upload => channel.upload_tier(request.num_bytes),
        };
        let tier = tier.ok_or(AdmissionError::NoQuota(request.kind))?;
        tier.approve_at(request.kind, now, request.num_bytes, request.meta)
    }

    /// Check channel and signature only, without touching any quota.
    pub fn authenticate(&self, request: TaskRequest<'_>) -> Result<(), AdmissionError> {
        self.authenticated_channel(&request).map(|_| ())
    }

    fn authenticated_channel(&self, request: &TaskRequest<'_>) -> Result<&Channel, AdmissionError> {
        let channel = self
            .channels
            .get(request.channel)
            .ok_or_else(|| AdmissionError::UnknownChannel(request.channel.to_string()))?;
        if !self.verify_signature(channel, request) {
            return Err(AdmissionError::BadSignature);
        }
        Ok(channel)
    }

    /// [`Regulator::authenticate`], answering rejections only after their
    /// retry delay.
    pub async fn authorize(&self, request: TaskRequest<'_>) -> Result<(), AdmissionError> {
        if let Err(e) = self.authenticate(request) {
            if let Some(delay) = e.retry_delay() {
                tokio::time::sleep(delay).await;
            }
            return Err(e);
        }
        Ok(())
    }

    fn verify_signature(&self, channel: &Channel, request: &TaskRequest<'_>) -> bool {
        if let Some(test_signature) = self.test_signature.as_deref() {
            if signature::signatures_match(test_signature, request.signature) {
                warn!(
                    channel = %request.channel,
                    task = %request.kind,
                    "WARNING: verified using test signature from TEST_SIGNATURE environment variable"
                );
                return true;
            }
        }
        let expected = expected_signature(
            request.kind,
            request.digest.algorithm(),
            request.digest.as_str(),
            channel.password(),
        );
        signature::signatures_match(&expected, request.signature)
    }

    /// Approve `request` and wait until it may proceed.
    ///
    /// Rejections that carry a retry delay are returned only after the delay
    /// has elapsed. Deferred approvals suspend until promoted; a tier with no
    /// simultaneous slots at all therefore never returns.
    pub async fn admit(
        self: &Arc<Self>,
        request: TaskRequest<'_>,
    ) -> Result<ActiveTask, AdmissionError> {
        let approval = match self.approve(request) {
            Ok(Admission::Active(approval)) => approval,
            Ok(Admission::Deferred(mut approval, wait)) => {
                info!(task = %request.kind, channel = %request.channel, "Deferring task");
                wait.wait().await?;
                info!(task = %request.kind, channel = %request.channel, "Starting deferred task");
                approval.deferred = false;
                approval
            }
            Err(e) => {
                if let Some(delay) = e.retry_delay() {
                    tokio::time::sleep(delay).await;
                }
                return Err(e);
            }
        };

        let delay = approval.delay;
        let task = ActiveTask {
            regulator: Arc::clone(self),
            kind: request.kind,
            channel: request.channel.to_string(),
            num_bytes: request.num_bytes,
            approval: Some(approval),
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(task)
    }

    /// Release the resources held by `approval`.
    ///
    /// Usage is billed from the effective counts fixed at approval time;
    /// `num_bytes` is informational.
    pub fn finalize(&self, kind: TaskKind, channel: &str, num_bytes: u64, approval: Approval) {
        if !self.channels.contains_key(channel) {
            warn!(channel, "Finalizing task for unknown channel");
        }
        if kind == TaskKind::Check {
            return;
        }
        tracing::debug!(task = %kind, channel, num_bytes, "Finalizing task");
        if let Some(quota) = approval.quota.clone() {
            quota.finalize(approval);
        }
    }
}

/// An active approval. Finalizes exactly once when dropped.
pub struct ActiveTask {
    regulator: Arc<Regulator>,
    kind: TaskKind,
    channel: String,
    num_bytes: u64,
    approval: Option<Approval>,
}

impl ActiveTask {
    pub fn approval(&self) -> Option<&Approval> {
        self.approval.as_ref()
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Record how many bytes were actually moved, for logging at finalize.
    pub fn set_num_bytes(&mut self, num_bytes: u64) {
        self.num_bytes = num_bytes;
    }
}

impl Drop for ActiveTask {
    fn drop(&mut self) {
        if let Some(approval) = self.approval.take() {
            self.regulator
                .finalize(self.kind, &self.channel, self.num_bytes, approval);
        }
    }
}
