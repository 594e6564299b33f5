use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local, NaiveDate};
use tokio::sync::oneshot;

use super::{Admission, AdmissionError, Approval, RequestMeta, TaskKind};
use crate::config::QuotaConfig;

/// One size-bounded tier of admission limits with its live counters.
///
/// A tier with `max_simultaneous == 0` never has a free slot: every task
/// routed to it waits in the deferred queue indefinitely.
#[derive(Debug)]
pub struct Quota {
    limits: QuotaConfig,
    state: Mutex<QuotaState>,
}

#[derive(Debug)]
struct QuotaState {
    current_day: NaiveDate,
    active_tasks: u64,
    total_files_today: u64,
    total_bytes_today: u64,
    pending_files_today: u64,
    pending_bytes_today: u64,
    // Reservations of today's deferred approvals, counted against the daily
    // caps so that promotion can never push the totals over them.
    queued_files_today: u64,
    queued_bytes_today: u64,
    deferred: VecDeque<DeferredEntry>,
    next_ticket: u64,
}

#[derive(Debug)]
struct DeferredEntry {
    ticket: u64,
    day: NaiveDate,
    files: u64,
    bytes: u64,
    wake: oneshot::Sender<()>,
}

/// Snapshot of a tier's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaUsage {
    pub current_day: NaiveDate,
    pub active_tasks: u64,
    pub total_files_today: u64,
    pub total_bytes_today: u64,
    pub pending_files_today: u64,
    pub pending_bytes_today: u64,
    pub deferred: usize,
}

impl QuotaState {
    fn new(day: NaiveDate) -> Self {
        Self {
            current_day: day,
            active_tasks: 0,
            total_files_today: 0,
            total_bytes_today: 0,
            pending_files_today: 0,
            pending_bytes_today: 0,
            queued_files_today: 0,
            queued_bytes_today: 0,
            deferred: VecDeque::new(),
            next_ticket: 0,
        }
    }

    fn new_day(&mut self, day: NaiveDate) {
        self.current_day = day;
        self.total_files_today = 0;
        self.total_bytes_today = 0;
        self.pending_files_today = 0;
        self.pending_bytes_today = 0;
        self.queued_files_today = 0;
        self.queued_bytes_today = 0;
    }

    fn start(&mut self, day: NaiveDate, files: u64, bytes: u64) {
        self.active_tasks += 1;
        if day == self.current_day {
            self.pending_files_today += files;
            self.pending_bytes_today += bytes;
        }
    }

    fn release(&mut self, day: NaiveDate, files: u64, bytes: u64, credit: bool) {
        self.active_tasks = self.active_tasks.saturating_sub(1);
        if day != self.current_day {
            // Approved before the last rollover; its usage is dropped.
            return;
        }
        self.pending_files_today = self.pending_files_today.saturating_sub(files);
        self.pending_bytes_today = self.pending_bytes_today.saturating_sub(bytes);
        if credit {
            self.total_files_today += files;
            self.total_bytes_today += bytes;
        }
    }

    fn unqueue(&mut self, entry: &DeferredEntry) {
        if entry.day == self.current_day {
            self.queued_files_today = self.queued_files_today.saturating_sub(entry.files);
            self.queued_bytes_today = self.queued_bytes_today.saturating_sub(entry.bytes);
        }
    }
}

impl Quota {
    pub fn new(limits: QuotaConfig) -> Self {
        Self {
            limits,
            state: Mutex::new(QuotaState::new(Local::now().date_naive())),
        }
    }

    pub fn limits(&self) -> &QuotaConfig {
        &self.limits
    }

    fn lock(&self) -> MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn usage(&self) -> QuotaUsage {
        let state = self.lock();
        QuotaUsage {
            current_day: state.current_day,
            active_tasks: state.active_tasks,
            total_files_today: state.total_files_today,
            total_bytes_today: state.total_bytes_today,
            pending_files_today: state.pending_files_today,
            pending_bytes_today: state.pending_bytes_today,
            deferred: state.deferred.len(),
        }
    }

    /// Admit a task of `num_bytes` at wall-clock time `now`.
    ///
    /// Rolls the tier over to a new day first when the calendar date has
    /// changed, then checks the daily caps and takes a simultaneous slot or
    /// queues the approval.
    pub fn approve_at(
        self: &Arc<Self>,
        kind: TaskKind,
        now: DateTime<Local>,
        num_bytes: u64,
        meta: RequestMeta,
    ) -> Result<Admission, AdmissionError> {
        let mut state = self.lock();

        let today = now.date_naive();
        if state.current_day != today {
            tracing::info!(
                previous = %state.current_day,
                today = %today,
                "Quota rolled over to a new day"
            );
            state.new_day(today);
        }

        let (files, bytes) = meta.effective(num_bytes);
        if state.total_files_today + state.pending_files_today + state.queued_files_today + files
            > self.limits.max_num_files_per_day
        {
            return Err(AdmissionError::FilesPerDayExceeded);
        }
        if state.total_bytes_today + state.pending_bytes_today + state.queued_bytes_today + bytes
            > self.limits.max_num_bytes_per_day
        {
            return Err(AdmissionError::BytesPerDayExceeded);
        }

        let mut approval = Approval {
            kind,
            quota: Some(Arc::clone(self)),
            effective_files: files,
            effective_bytes: bytes,
            timestamp: now,
            deferred: false,
            delay: None,
        };

        if state.active_tasks < self.limits.max_simultaneous {
            state.start(today, files, bytes);
            return Ok(Admission::Active(approval));
        }

        let (tx, rx) = oneshot::channel();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queued_files_today += files;
        state.queued_bytes_today += bytes;
        state.deferred.push_back(DeferredEntry {
            ticket,
            day: today,
            files,
            bytes,
            wake: tx,
        });
        approval.deferred = true;

        Ok(Admission::Deferred(
            approval,
            DeferredWait {
                quota: Arc::clone(self),
                ticket,
                day: today,
                files,
                bytes,
                wake: rx,
                settled: false,
            },
        ))
    }

    /// Release the slot held by `approval` and credit its effective usage,
    /// then promote deferred approvals in FIFO order. Consumes the approval.
    pub fn finalize(&self, approval: Approval) {
        let mut state = self.lock();
        state.release(
            approval.timestamp.date_naive(),
            approval.effective_files,
            approval.effective_bytes,
            true,
        );
        self.promote(&mut state);

        tracing::info!(
            pending_files_today = state.pending_files_today,
            pending_bytes_today = state.pending_bytes_today,
            total_files_today = state.total_files_today,
            total_bytes_today = state.total_bytes_today,
            active_tasks = state.active_tasks,
            deferred = state.deferred.len(),
            "Finalized task"
        );
    }

    fn promote(&self, state: &mut QuotaState) {
        let mut waiting = VecDeque::with_capacity(state.deferred.len());
        while let Some(entry) = state.deferred.pop_front() {
            if entry.wake.is_closed() {
                state.unqueue(&entry);
                continue;
            }
            if state.active_tasks >= self.limits.max_simultaneous {
                waiting.push_back(entry);
                continue;
            }
            state.unqueue(&entry);
            state.start(entry.day, entry.files, entry.bytes);
            if entry.wake.send(()).is_err() {
                state.release(entry.day, entry.files, entry.bytes, false);
            }
        }
        state.deferred = waiting;
    }

    /// A deferred caller went away before it could proceed.
    fn abandon(&self, wait: &DeferredWait) {
        let mut state = self.lock();
        if let Some(pos) = state.deferred.iter().position(|e| e.ticket == wait.ticket) {
            if let Some(entry) = state.deferred.remove(pos) {
                state.unqueue(&entry);
            }
            return;
        }
        // Promoted but never picked up: hand the slot back unbilled.
        state.release(wait.day, wait.files, wait.bytes, false);
        self.promote(&mut state);
    }
}

/// Handle for a deferred approval. Dropping it before [`DeferredWait::wait`]
/// completes removes the approval from the queue, or returns its slot if it
/// had already been promoted.
#[derive(Debug)]
pub struct DeferredWait {
    quota: Arc<Quota>,
    ticket: u64,
    day: NaiveDate,
    files: u64,
    bytes: u64,
    wake: oneshot::Receiver<()>,
    settled: bool,
}

impl DeferredWait {
    /// Suspend until a finalize on the same tier promotes this approval.
    pub async fn wait(mut self) -> Result<(), AdmissionError> {
        let result = (&mut self.wake).await;
        self.settled = true;
        result.map_err(|_| AdmissionError::Abandoned)
    }
}

impl Drop for DeferredWait {
    fn drop(&mut self) {
        if !self.settled {
            self.quota.abandon(self);
        }
    }
}
