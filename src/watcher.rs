use crate::config::{BacklogPolicy, WatcherConfig};
use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, LedgerError, MailError, WatcherError};
use crate::ledger::{CommitStatus, Ledger, LedgerOutcome};
use crate::mail::MailSource;
use crate::message::{Checkpoint, MessageId, MessageRef, RawMessage};
use crate::parser::AppointmentParser;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

/// Upper bound on listing pages walked in one cycle.
const MAX_LIST_PAGES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherPhase {
    Idle,
    Fetching,
    Processing,
    Committing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listed: usize,
    pub fetched: usize,
    pub already_seen: usize,
    pub duplicates: usize,
    pub notified: usize,
    pub not_appointment: usize,
    pub deferred: usize,
    pub dropped: usize,
    pub failed_transient: usize,
    pub failed_permanent: usize,
    pub ledger_conflicts: usize,
    pub errors: Vec<String>,
}

/// Everything the Processing phase decided, handed to Committing.
#[derive(Default)]
struct Decisions {
    terminal: Vec<(MessageId, LedgerOutcome)>,
    pending_since: Vec<DateTime<Utc>>,
}

/// Polls the mailbox, notifies new appointments and records what was done.
pub struct Watcher {
    source: Arc<dyn MailSource>,
    parser: AppointmentParser,
    dispatcher: Dispatcher,
    ledger: Arc<dyn Ledger>,
    settings: WatcherConfig,
    cycle_lock: tokio::sync::Mutex<()>,
    phase: std::sync::Mutex<WatcherPhase>,
    shutdown: watch::Sender<bool>,
}

impl Watcher {
    pub fn new(
        source: Arc<dyn MailSource>,
        parser: AppointmentParser,
        dispatcher: Dispatcher,
        ledger: Arc<dyn Ledger>,
        settings: WatcherConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            source,
            parser,
            dispatcher,
            ledger,
            settings,
            cycle_lock: tokio::sync::Mutex::new(()),
            phase: std::sync::Mutex::new(WatcherPhase::Idle),
            shutdown,
        }
    }

    pub fn phase(&self) -> WatcherPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: WatcherPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Stop after the current cycle. A cycle in progress takes no new
    /// messages but still commits what it finished.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Continuous mode. Returns on shutdown or on a fatal error.
    pub async fn run(&self) -> Result<(), WatcherError> {
        let mut shutdown = self.shutdown.subscribe();
        info!(
            "Watcher started, polling every {}s",
            self.settings.poll_interval_secs
        );

        while !*shutdown.borrow() {
            match self.run_once().await {
                Ok(_) => {}
                Err(e @ WatcherError::Fatal(_)) => {
                    error!("Stopping watcher: {e}");
                    return Err(e);
                }
                Err(e) => error!("Poll cycle failed: {e}"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                _ = shutdown.wait_for(|stop| *stop) => {}
            }
        }

        info!("Watcher stopped");
        Ok(())
    }

    /// One complete poll cycle. Concurrent callers wait their turn.
    pub async fn run_once(&self) -> Result<CycleReport, WatcherError> {
        let _cycle = self.cycle_lock.lock().await;

        let mut report = CycleReport {
            started_at: Utc::now(),
            ..CycleReport::default()
        };
        self.dispatcher.reset_quota();
        info!("Poll cycle started");

        let result = self.cycle(&mut report).await;
        self.set_phase(WatcherPhase::Idle);
        report.finished_at = Utc::now();

        match result {
            Ok(()) => {
                info!(
                    "Poll cycle finished: listed={} fetched={} notified={} not_appointment={} deferred={} dropped={} failed={} seen={}",
                    report.listed,
                    report.fetched,
                    report.notified,
                    report.not_appointment,
                    report.deferred,
                    report.dropped,
                    report.failed_transient + report.failed_permanent,
                    report.already_seen
                );
                Ok(report)
            }
            Err(e) => {
                error!("Poll cycle aborted: {e}");
                Err(e)
            }
        }
    }

    async fn cycle(&self, report: &mut CycleReport) -> Result<(), WatcherError> {
        self.set_phase(WatcherPhase::Fetching);
        let checkpoint = self.ledger.checkpoint()?;
        let since = match checkpoint {
            Some(cp) => cp.received_at.checked_sub_signed(self.settings.overlap()),
            None => Utc::now().checked_sub_signed(self.settings.initial_lookback()),
        }
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let (unseen, backlog) = self.list_unseen(since, report).await?;
        let (mut messages, fetch_incomplete) = self.fetch_new(unseen, report).await?;
        messages.sort_by(|a, b| (a.received_at, &a.id).cmp(&(b.received_at, &b.id)));
        report.fetched = messages.len();

        self.set_phase(WatcherPhase::Processing);
        let decisions = self.process(&messages, report).await?;

        self.set_phase(WatcherPhase::Committing);
        for (id, outcome) in &decisions.terminal {
            match self.ledger.commit(id, *outcome) {
                Ok(CommitStatus::Recorded) => debug!("{id}: recorded {outcome}"),
                Ok(CommitStatus::AlreadyRecorded) => debug!("{id}: {outcome} already recorded"),
                Err(LedgerError::Conflict {
                    id,
                    existing,
                    attempted,
                }) => {
                    warn!("Ledger conflict for {id}: kept {existing}, refused {attempted}");
                    report.ledger_conflicts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if backlog {
            info!("Older unprocessed messages remain, checkpoint unchanged");
        } else if fetch_incomplete {
            info!("Some messages could not be fetched, checkpoint unchanged");
        } else {
            let target = match decisions.pending_since.iter().min() {
                Some(earliest_pending) => Some(*earliest_pending),
                None => messages.iter().map(|m| m.received_at).max(),
            };
            if let Some(received_at) = target {
                self.ledger.save_checkpoint(&Checkpoint {
                    received_at,
                    updated_at: Utc::now(),
                })?;
                debug!("Checkpoint moved to {received_at}");
            }
        }

        Ok(())
    }

    /// Page through the listing and collect ids the ledger has not seen.
    ///
    /// At most `fetch_limit` ids are kept, the oldest ones, so a backlog
    /// drains in arrival order. The flag reports that unseen messages were
    /// left for a later cycle.
    async fn list_unseen(
        &self,
        since: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(Vec<MessageRef>, bool), WatcherError> {
        let limit = self.settings.fetch_limit.max(1);
        let mut listed = HashSet::new();
        let mut unseen = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0;

        loop {
            let page = self
                .source
                .list_candidates(since, limit, page_token.as_deref())
                .await?;
            pages += 1;
            report.listed += page.refs.len();

            for msg_ref in page.refs {
                if !listed.insert(msg_ref.id.clone()) {
                    report.duplicates += 1;
                } else if self.ledger.has(&msg_ref.id)? {
                    report.already_seen += 1;
                } else {
                    unseen.push(msg_ref);
                }
            }

            page_token = page.next_page;
            if page_token.is_none() {
                break;
            }
            if pages >= MAX_LIST_PAGES {
                warn!("Stopped listing after {pages} pages, the rest waits for a later cycle");
                break;
            }
        }

        // Listings are newest first, so the oldest unseen ids sit at the end.
        let mut backlog = page_token.is_some();
        if unseen.len() > limit {
            debug!("{} unseen message(s), taking the oldest {limit}", unseen.len());
            unseen = unseen.split_off(unseen.len() - limit);
            backlog = true;
        }
        Ok((unseen, backlog))
    }

    /// Fetch the listed messages. The flag reports whether any message
    /// stayed unfetched for a retryable reason.
    async fn fetch_new(
        &self,
        refs: Vec<MessageRef>,
        report: &mut CycleReport,
    ) -> Result<(Vec<RawMessage>, bool), WatcherError> {
        let mut messages = Vec::new();
        let mut incomplete = false;

        for msg_ref in refs {
            match self.source.fetch_message(&msg_ref.id).await {
                Ok(message) => messages.push(message),
                Err(e) if e.is_fatal() => return Err(WatcherError::Fatal(e)),
                Err(MailError::NotFound(id)) => {
                    warn!("Listed message {id} no longer exists");
                    report.errors.push(format!("{id}: not found"));
                }
                Err(e) => {
                    warn!("Could not fetch {}: {e}", msg_ref.id);
                    report.errors.push(format!("{}: {e}", msg_ref.id));
                    incomplete = true;
                }
            }
        }

        Ok((messages, incomplete))
    }

    async fn process(
        &self,
        messages: &[RawMessage],
        report: &mut CycleReport,
    ) -> Result<Decisions, WatcherError> {
        let mut decisions = Decisions::default();
        let mut handled = HashSet::new();

        for (idx, message) in messages.iter().enumerate() {
            if self.is_shutting_down() {
                let remaining = &messages[idx..];
                info!(
                    "Shutdown requested, leaving {} message(s) for the next run",
                    remaining.len()
                );
                decisions
                    .pending_since
                    .extend(remaining.iter().map(|m| m.received_at));
                break;
            }
            if !handled.insert(message.id.clone()) {
                report.duplicates += 1;
                continue;
            }
            if self.ledger.has(&message.id)? {
                report.already_seen += 1;
                continue;
            }

            let record = match self.parser.parse(message) {
                Ok(record) => record,
                Err(reason) => {
                    debug!("{}: not an appointment ({reason})", message.id);
                    report.not_appointment += 1;
                    decisions
                        .terminal
                        .push((message.id.clone(), LedgerOutcome::NotAppointment));
                    continue;
                }
            };

            match self.dispatcher.dispatch(&record).await {
                Ok(_) => {
                    report.notified += 1;
                    decisions
                        .terminal
                        .push((message.id.clone(), LedgerOutcome::Notified));
                }
                Err(DispatchError::QuotaExceeded) => match self.settings.backlog_policy {
                    BacklogPolicy::Defer => {
                        warn!("{}: quota reached, deferred to next cycle", message.id);
                        report.deferred += 1;
                        decisions.pending_since.push(message.received_at);
                    }
                    BacklogPolicy::Drop => {
                        warn!("{}: quota reached, dropped", message.id);
                        report.dropped += 1;
                        decisions
                            .terminal
                            .push((message.id.clone(), LedgerOutcome::Dropped));
                    }
                },
                Err(e @ DispatchError::Permanent(_)) => {
                    error!("{}: {e}", message.id);
                    report.failed_permanent += 1;
                    report.errors.push(format!("{}: {e}", message.id));
                    decisions
                        .terminal
                        .push((message.id.clone(), LedgerOutcome::FailedPermanently));
                }
                Err(e @ DispatchError::Exhausted { .. }) => {
                    error!("{}: {e}", message.id);
                    report.failed_transient += 1;
                    report.errors.push(format!("{}: {e}", message.id));
                    decisions.pending_since.push(message.received_at);
                }
            }
        }

        Ok(decisions)
    }
}
