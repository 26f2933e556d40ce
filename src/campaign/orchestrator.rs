//! The campaign send loop.
//!
//! A run walks the ledger in insertion order, `batch_size` units at a time,
//! one send at a time. The only suspension points are the inter-email and
//! inter-batch delays; both race the run's cancellation token so a pause
//! takes effect without waiting the delay out. A send already on the wire is
//! never aborted, its result is recorded when it returns.
//!
//! Only one `run()` drives the loop at a time. A run started by a resume or a
//! fresh start waits until the previous run has recorded its last send.

use super::ledger::{EmailLogEntry, EmailStatus, Ledger, StatusCounts};
use super::plan::{plan_units, total_batches, WorkUnit};
use super::progress::ProgressReport;
use super::settings::{CampaignConfig, SendMode};
use crate::auth::Account;
use crate::gmail::attachment::Attachment;
use crate::gmail::{MailContent, MailTransport, SendReceipt, TransportError};
use crate::recipients::Recipient;
use crate::template::{EmailTemplate, TemplateContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Please select a sender account first.")]
    MissingAccount,
    #[error("No valid recipients found. Please import recipients first.")]
    NoValidRecipients,
    #[error("The campaign is already running.")]
    AlreadyRunning,
    #[error("The campaign has completed. Restart it to send again.")]
    AlreadyCompleted,
    #[error("The campaign is not running.")]
    NotRunning,
    #[error("The campaign is not paused.")]
    NotPaused,
}

impl CampaignError {
    /// User-correctable problems with what was set up before starting.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            CampaignError::MissingAccount | CampaignError::NoValidRecipients
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStatus {
    pub state: RunState,
    pub start_time: Option<DateTime<Utc>>,
    /// 1-based; 0 before the first start.
    pub current_batch: usize,
}

impl RunStatus {
    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn is_paused(&self) -> bool {
        self.state == RunState::Paused
    }
}

/// Source of time for the send loop, swapped out in tests so delays do not
/// cost wall-clock time.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// What the composer produced: the template and the files to attach.
#[derive(Debug)]
pub struct ComposedEmail {
    pub template: EmailTemplate,
    pub attachments: Vec<Attachment>,
}

// Everything a run needs, captured at the fresh start.
struct CampaignPlan {
    sender: Account,
    email: ComposedEmail,
    config: CampaignConfig,
    units: HashMap<String, WorkUnit>,
}

pub struct Orchestrator {
    transport: Arc<dyn MailTransport>,
    clock: Arc<dyn Clock>,
    ledger: RwLock<Ledger>,
    status: watch::Sender<RunStatus>,
    plan: Mutex<Option<Arc<CampaignPlan>>>,
    cancel: Mutex<CancellationToken>,
    // Bumped by fresh starts and restarts; results from older runs are dropped.
    generation: AtomicU64,
    in_flight: Mutex<Option<String>>,
    // Held for the whole of `run()`.
    runner: AsyncMutex<()>,
}

impl Orchestrator {
    pub fn new(transport: Arc<dyn MailTransport>, clock: Arc<dyn Clock>) -> Self {
        let (status, _) = watch::channel(RunStatus::default());
        Orchestrator {
            transport,
            clock,
            ledger: RwLock::new(Ledger::new()),
            status,
            plan: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            generation: AtomicU64::new(0),
            in_flight: Mutex::new(None),
            runner: AsyncMutex::new(()),
        }
    }

    /// Arms a run. A fresh start plans the units and initializes the ledger;
    /// starting while paused resumes instead. Call [`Orchestrator::run`]
    /// afterwards to drive the sends.
    pub fn start(
        &self,
        sender: Option<&Account>,
        recipients: &[Recipient],
        email: ComposedEmail,
        config: CampaignConfig,
    ) -> Result<(), CampaignError> {
        let sender = sender.ok_or(CampaignError::MissingAccount)?;
        let config = config.clamped();
        let units = plan_units(recipients, config.send_mode);
        if units.is_empty() {
            return Err(CampaignError::NoValidRecipients);
        }

        match self.status().state {
            RunState::Running => return Err(CampaignError::AlreadyRunning),
            RunState::Completed => return Err(CampaignError::AlreadyCompleted),
            RunState::Paused => return self.resume(),
            RunState::Idle => {}
        }

        self.generation.fetch_add(1, Ordering::SeqCst);
        self.ledger_mut()
            .initialize(units.iter().map(|unit| (unit.id.clone(), unit.label.clone())));

        info!(
            "Starting campaign '{}' from {}: {} message(s) in batches of {}",
            config.name,
            sender.email,
            units.len(),
            config.batch_size
        );
        *self.plan_slot() = Some(Arc::new(CampaignPlan {
            sender: sender.clone(),
            email,
            config,
            units: units.into_iter().map(|unit| (unit.id.clone(), unit)).collect(),
        }));

        self.rearm();
        self.status.send_replace(RunStatus {
            state: RunState::Running,
            start_time: Some(self.clock.now()),
            current_batch: 1,
        });
        Ok(())
    }

    /// Continues a paused run. Entries the paused run marked `sending` but
    /// never attempted go back to `pending`.
    pub fn resume(&self) -> Result<(), CampaignError> {
        match self.status().state {
            RunState::Paused => {}
            RunState::Running => return Ok(()),
            _ => return Err(CampaignError::NotPaused),
        }

        let in_flight = self.in_flight_slot().clone();
        let reclaimed = self.ledger_mut().reclaim_stale(in_flight.as_deref());
        if reclaimed > 0 {
            debug!("Returned {} stranded entries to pending", reclaimed);
        }

        self.rearm();
        self.status.send_modify(|status| status.state = RunState::Running);
        info!("Campaign resumed");
        Ok(())
    }

    /// Stops scheduling work at the next checkpoint.
    pub fn pause(&self) -> Result<(), CampaignError> {
        match self.status().state {
            RunState::Running => {
                self.status.send_modify(|status| status.state = RunState::Paused);
                self.cancel_slot().cancel();
                info!("Campaign paused");
                Ok(())
            }
            RunState::Paused => Ok(()),
            _ => Err(CampaignError::NotRunning),
        }
    }

    /// Back to `Idle` with every entry pending, whatever state the run is in.
    pub fn restart(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_slot().cancel();
        self.ledger_mut().reset();
        self.status.send_replace(RunStatus::default());
        info!("Campaign reset");
    }

    /// Drives the armed run until it completes or is paused/restarted, and
    /// returns the state it stopped in. Waits for any previous run to stop
    /// first, then picks up whatever run is armed at that point.
    pub async fn run(&self) -> RunState {
        let _runner = self.runner.lock().await;
        let Some(plan) = self.plan_slot().clone() else {
            return self.status().state;
        };
        let cancel = self.cancel_slot().clone();
        let generation = self.generation.load(Ordering::SeqCst);

        while self.should_continue(&cancel) {
            let Some(batch) = self.next_batch(&plan, generation) else {
                self.complete();
                break;
            };
            debug!(
                "Batch {}: {} message(s)",
                self.status().current_batch,
                batch.len()
            );

            for (position, id) in batch.iter().enumerate() {
                if position > 0 && !self.pause_aware_sleep(plan.config.email_delay(), &cancel).await
                {
                    break;
                }
                if !self.claim(id, &cancel) {
                    break;
                }
                let outcome = self.dispatch(&plan, id).await;
                if self.record(id, outcome, generation) {
                    self.pause_for_authentication();
                    break;
                }
            }

            if !self.should_continue(&cancel) || !self.has_remaining_work(&plan) {
                continue;
            }
            self.status.send_modify(|status| status.current_batch += 1);
            if !self.pause_aware_sleep(plan.config.batch_delay(), &cancel).await {
                break;
            }
        }

        self.status().state
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Change notifications for the run status.
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    pub fn ledger_entries(&self) -> Vec<EmailLogEntry> {
        self.ledger().entries().to_vec()
    }

    pub fn counts(&self) -> StatusCounts {
        self.ledger().snapshot_counts()
    }

    /// The configuration captured by the last fresh start.
    pub fn config(&self) -> Option<CampaignConfig> {
        self.plan_slot().as_ref().map(|plan| plan.config.clone())
    }

    pub fn total_batches(&self) -> usize {
        let units = self.ledger().len();
        self.config()
            .map(|config| total_batches(units, config.batch_size))
            .unwrap_or(0)
    }

    pub fn progress(&self) -> ProgressReport {
        let status = self.status();
        ProgressReport::new(
            self.counts(),
            status.current_batch,
            self.total_batches(),
            status.start_time,
            self.clock.now(),
        )
    }

    fn should_continue(&self, cancel: &CancellationToken) -> bool {
        !cancel.is_cancelled() && self.status().is_running()
    }

    /// Picks the next pending entries, re-queueing failures first when
    /// pending is exhausted and retries are on, and marks them `sending`.
    fn next_batch(&self, plan: &CampaignPlan, generation: u64) -> Option<Vec<String>> {
        let mut ledger = self.ledger_mut();
        if self.generation.load(Ordering::SeqCst) != generation {
            return None;
        }

        let mut batch = ledger.pending_ids(plan.config.batch_size);
        if batch.is_empty() && plan.config.retry_failed_emails {
            let requeued = ledger.requeue_failed(plan.config.max_retries);
            if requeued > 0 {
                info!("Retrying {} failed message(s)", requeued);
                batch = ledger.pending_ids(plan.config.batch_size);
            }
        }
        if batch.is_empty() {
            return None;
        }

        for id in &batch {
            if let Err(e) = ledger.transition(id, EmailStatus::Sending, None, None) {
                error!("Send loop logic error: {}", e);
            }
        }
        Some(batch)
    }

    fn has_remaining_work(&self, plan: &CampaignPlan) -> bool {
        let ledger = self.ledger();
        ledger.entries().iter().any(|entry| match entry.status {
            EmailStatus::Pending => true,
            EmailStatus::Failed => {
                plan.config.retry_failed_emails
                    && entry.retry_count.unwrap_or(0) < plan.config.max_retries
            }
            _ => false,
        })
    }

    fn complete(&self) {
        let mut completed = false;
        self.status.send_modify(|status| {
            if status.state == RunState::Running {
                status.state = RunState::Completed;
                completed = true;
            }
        });
        if completed {
            let counts = self.counts();
            info!(
                "Campaign completed: {} sent, {} failed",
                counts.sent, counts.failed
            );
        }
    }

    // Checkpoint and in-flight marker are set together so a resume either
    // sees the send in flight or the loop sees the pause.
    fn claim(&self, id: &str, cancel: &CancellationToken) -> bool {
        let mut in_flight = self.in_flight_slot();
        if !self.should_continue(cancel) {
            return false;
        }
        *in_flight = Some(id.to_string());
        true
    }

    async fn dispatch(&self, plan: &CampaignPlan, id: &str) -> Result<SendReceipt, TransportError> {
        let Some(unit) = plan.units.get(id) else {
            error!("Send loop logic error: no unit of work for '{}'", id);
            return Err(TransportError::NoRecipients);
        };

        let recipient_email = match plan.config.send_mode {
            SendMode::Standard => unit.recipients.first().map(String::as_str).unwrap_or(""),
            SendMode::Bulk => "",
        };
        let (subject, html_body) = plan.email.template.render(&TemplateContext {
            recipient_email,
            sender_name: &plan.sender.name,
            sender_email: &plan.sender.email,
            campaign_name: &plan.config.name,
        })?;
        let from = plan.sender.mailbox()?;
        let content = MailContent {
            from: &from,
            subject: &subject,
            html_body: &html_body,
            attachments: &plan.email.attachments,
        };

        debug!("Sending {} ({} recipient(s))", unit.label, unit.recipients.len());
        match unit.recipients.as_slice() {
            [single] => self.transport.send_one(single, &content).await,
            many => self.transport.send_bulk(many, &content).await,
        }
    }

    /// Writes the outcome to the ledger. Returns true when the failure was an
    /// authentication problem, which blocks the rest of the run.
    fn record(
        &self,
        id: &str,
        outcome: Result<SendReceipt, TransportError>,
        generation: u64,
    ) -> bool {
        let now = self.clock.now();
        let mut auth_failure = false;
        {
            let mut ledger = self.ledger_mut();
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!("Dropping result for {} from a reset run", id);
            } else {
                let (status, timestamp, error) = match outcome {
                    Ok(receipt) => {
                        debug!("Sent {} (thread {})", id, receipt.thread_id);
                        (EmailStatus::Sent, Some(now), None)
                    }
                    Err(e) if e.is_authentication() => {
                        warn!("Sending blocked for {}: {}", id, e);
                        auth_failure = true;
                        (EmailStatus::Pending, None, Some(e.to_string()))
                    }
                    Err(e) => {
                        warn!("Failed to send {}: {}", id, e);
                        (EmailStatus::Failed, Some(now), Some(e.to_string()))
                    }
                };
                if let Err(e) = ledger.transition(id, status, timestamp, error) {
                    error!("Send loop logic error: {}", e);
                }
            }
        }
        let mut in_flight = self.in_flight_slot();
        if in_flight.as_deref() == Some(id) {
            *in_flight = None;
        }
        auth_failure
    }

    fn pause_for_authentication(&self) {
        self.status.send_modify(|status| {
            if status.state == RunState::Running {
                status.state = RunState::Paused;
            }
        });
        self.cancel_slot().cancel();
        warn!("Campaign paused until the Gmail account is reconnected");
    }

    async fn pause_aware_sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.clock.sleep(duration) => self.should_continue(cancel),
        }
    }

    fn rearm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel_slot() = token.clone();
        token
    }

    fn ledger(&self) -> RwLockReadGuard<'_, Ledger> {
        self.ledger.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn ledger_mut(&self) -> RwLockWriteGuard<'_, Ledger> {
        self.ledger.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn plan_slot(&self) -> MutexGuard<'_, Option<Arc<CampaignPlan>>> {
        self.plan.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_slot(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::demo_accounts;
    use crate::recipients::parse_recipients;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{OnceLock, Weak};
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct InstantClock {
        sleeps: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Clock for InstantClock {
        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    #[derive(Debug, Clone)]
    struct Delivery {
        to: Vec<String>,
        subject: String,
        html_body: String,
    }

    struct FakeTransport {
        deliveries: Mutex<Vec<Delivery>>,
        attempts: AtomicUsize,
        // Addresses mapped to how many more times they fail.
        failures: Mutex<HashMap<String, usize>>,
        authenticated: AtomicBool,
        pause_on_attempt: Option<usize>,
        orchestrator: OnceLock<Weak<Orchestrator>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            FakeTransport {
                deliveries: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                failures: Mutex::new(HashMap::new()),
                authenticated: AtomicBool::new(true),
                pause_on_attempt: None,
                orchestrator: OnceLock::new(),
            }
        }

        fn failing(address: &str, times: usize) -> Self {
            let transport = Self::new();
            transport
                .failures
                .lock()
                .unwrap()
                .insert(address.to_string(), times);
            transport
        }

        fn deliveries(&self) -> Vec<Delivery> {
            self.deliveries.lock().unwrap().clone()
        }

        fn deliver(&self, to: &[String], content: &MailContent<'_>) -> Result<SendReceipt, TransportError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(attempt) == self.pause_on_attempt {
                // The user hits pause while this send is on the wire.
                if let Some(orchestrator) = self.orchestrator.get().and_then(Weak::upgrade) {
                    orchestrator.pause().unwrap();
                }
            }
            if !self.authenticated.load(Ordering::SeqCst) {
                return Err(TransportError::NotAuthenticated);
            }
            {
                let mut failures = self.failures.lock().unwrap();
                if let Some(remaining) = failures.get_mut(&to[0]) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(TransportError::Api {
                            status: 500,
                            message: "Backend Error".to_string(),
                        });
                    }
                }
            }
            self.deliveries.lock().unwrap().push(Delivery {
                to: to.to_vec(),
                subject: content.subject.to_string(),
                html_body: content.html_body.to_string(),
            });
            Ok(SendReceipt {
                id: format!("m{}", attempt),
                thread_id: format!("t{}", attempt),
            })
        }
    }

    #[async_trait]
    impl MailTransport for FakeTransport {
        async fn send_one(&self, to: &str, content: &MailContent<'_>) -> Result<SendReceipt, TransportError> {
            self.deliver(&[to.to_string()], content)
        }

        async fn send_bulk(
            &self,
            to: &[String],
            content: &MailContent<'_>,
        ) -> Result<SendReceipt, TransportError> {
            self.deliver(to, content)
        }
    }

    fn setup(transport: FakeTransport) -> (Arc<Orchestrator>, Arc<FakeTransport>, Arc<InstantClock>) {
        let transport = Arc::new(transport);
        let clock = Arc::new(InstantClock::default());
        let orchestrator = Arc::new(Orchestrator::new(transport.clone(), clock.clone()));
        transport
            .orchestrator
            .set(Arc::downgrade(&orchestrator))
            .unwrap();
        (orchestrator, transport, clock)
    }

    fn email() -> ComposedEmail {
        ComposedEmail {
            template: EmailTemplate::from_content(
                "Hello from {{ sender_name }}",
                "<p>Hi {{ recipient_email }}</p>",
                "test",
            )
            .unwrap(),
            attachments: Vec::new(),
        }
    }

    fn recipients(count: usize) -> Vec<Recipient> {
        let lines: Vec<String> = (0..count).map(|i| format!("user{}@example.com", i)).collect();
        parse_recipients(&lines.join("\n"))
    }

    fn config(batch_size: usize) -> CampaignConfig {
        CampaignConfig {
            batch_size,
            retry_failed_emails: false,
            ..CampaignConfig::default()
        }
    }

    #[tokio::test]
    async fn start_without_account_is_a_configuration_error() {
        let (orchestrator, _, _) = setup(FakeTransport::new());

        let err = orchestrator
            .start(None, &recipients(3), email(), config(2))
            .unwrap_err();

        assert!(matches!(err, CampaignError::MissingAccount));
        assert!(err.is_configuration_error());
        assert!(orchestrator.ledger_entries().is_empty());
        assert_eq!(orchestrator.status(), RunStatus::default());
    }

    #[tokio::test]
    async fn start_without_valid_recipients_leaves_ledger_untouched() {
        let (orchestrator, _, _) = setup(FakeTransport::new());
        let account = &demo_accounts()[0];
        orchestrator
            .start(Some(account), &recipients(2), email(), config(2))
            .unwrap();
        orchestrator.run().await;
        orchestrator.restart();
        let before = orchestrator.ledger_entries();

        let invalid = parse_recipients("nope\na@b\n");
        let err = orchestrator
            .start(Some(account), &invalid, email(), config(2))
            .unwrap_err();

        assert!(matches!(err, CampaignError::NoValidRecipients));
        assert_eq!(orchestrator.ledger_entries(), before);
        assert_eq!(orchestrator.status().state, RunState::Idle);
    }

    #[tokio::test]
    async fn fresh_start_initializes_pending_entries() {
        let (orchestrator, _, _) = setup(FakeTransport::new());
        let mixed = parse_recipients("a@b.com\nbad\nc@d.org\n");

        orchestrator
            .start(Some(&demo_accounts()[0]), &mixed, email(), config(10))
            .unwrap();

        assert_eq!(
            orchestrator.counts(),
            StatusCounts {
                pending: 2,
                sending: 0,
                sent: 0,
                failed: 0
            }
        );
        let status = orchestrator.status();
        assert_eq!(status.state, RunState::Running);
        assert_eq!(status.current_batch, 1);
        assert!(status.start_time.is_some());
    }

    #[tokio::test]
    async fn full_run_sends_everything_in_order() {
        let (orchestrator, transport, clock) = setup(FakeTransport::new());
        let config = config(2);

        orchestrator
            .start(Some(&demo_accounts()[0]), &recipients(5), email(), config.clone())
            .unwrap();
        let state = orchestrator.run().await;

        assert_eq!(state, RunState::Completed);
        let counts = orchestrator.counts();
        assert_eq!(counts.sent, 5);
        assert_eq!(counts.pending + counts.sending + counts.failed, 0);
        assert!(orchestrator
            .ledger_entries()
            .iter()
            .all(|entry| entry.timestamp.is_some()));

        let order: Vec<String> = transport
            .deliveries()
            .iter()
            .map(|d| d.to[0].clone())
            .collect();
        assert_eq!(
            order,
            (0..5)
                .map(|i| format!("user{}@example.com", i))
                .collect::<Vec<_>>()
        );

        // Batches of 2, 2, 1: one email gap in each full batch, a batch gap
        // between batches and none after the last.
        let sleeps = clock.sleeps.lock().unwrap().clone();
        let email_gaps = sleeps.iter().filter(|d| **d == config.email_delay()).count();
        let batch_gaps = sleeps.iter().filter(|d| **d == config.batch_delay()).count();
        assert_eq!(email_gaps, 2);
        assert_eq!(batch_gaps, 2);
        assert_eq!(orchestrator.status().current_batch, 3);
        assert_eq!(orchestrator.total_batches(), 3);
    }

    #[tokio::test]
    async fn messages_are_personalized_per_recipient() {
        let (orchestrator, transport, _) = setup(FakeTransport::new());

        orchestrator
            .start(Some(&demo_accounts()[0]), &recipients(2), email(), config(5))
            .unwrap();
        orchestrator.run().await;

        let deliveries = transport.deliveries();
        assert_eq!(deliveries[0].subject, "Hello from Demo Account");
        assert_eq!(deliveries[1].html_body, "<p>Hi user1@example.com</p>");
    }

    #[tokio::test]
    async fn transport_failure_is_recorded_and_run_continues() {
        let (orchestrator, transport, _) = setup(FakeTransport::failing("user1@example.com", 1));

        orchestrator
            .start(Some(&demo_accounts()[0]), &recipients(3), email(), config(10))
            .unwrap();
        let state = orchestrator.run().await;

        assert_eq!(state, RunState::Completed);
        let counts = orchestrator.counts();
        assert_eq!(counts.sent, 2);
        assert_eq!(counts.failed, 1);
        let failed = orchestrator
            .ledger_entries()
            .into_iter()
            .find(|entry| entry.status == EmailStatus::Failed)
            .unwrap();
        assert_eq!(failed.target, "user1@example.com");
        assert!(failed.error_message.unwrap().contains("Backend Error"));
        assert!(failed.timestamp.is_some());
        assert_eq!(transport.deliveries().len(), 2);
    }

    #[tokio::test]
    async fn failed_entries_are_retried_until_max_retries() {
        let (orchestrator, transport, _) = setup(FakeTransport::failing("user0@example.com", 100));
        let config = CampaignConfig {
            batch_size: 10,
            retry_failed_emails: true,
            max_retries: 2,
            ..CampaignConfig::default()
        };

        orchestrator
            .start(Some(&demo_accounts()[0]), &recipients(2), email(), config)
            .unwrap();
        let state = orchestrator.run().await;

        assert_eq!(state, RunState::Completed);
        let entry = orchestrator.ledger_entries()[0].clone();
        assert_eq!(entry.status, EmailStatus::Failed);
        assert_eq!(entry.retry_count, Some(2));
        // One first attempt plus two retries for the failing address.
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_can_recover_a_transient_failure() {
        let (orchestrator, _, _) = setup(FakeTransport::failing("user0@example.com", 1));
        let config = CampaignConfig {
            batch_size: 10,
            retry_failed_emails: true,
            max_retries: 3,
            ..CampaignConfig::default()
        };

        orchestrator
            .start(Some(&demo_accounts()[0]), &recipients(2), email(), config)
            .unwrap();
        orchestrator.run().await;

        let entry = orchestrator.ledger_entries()[0].clone();
        assert_eq!(entry.status, EmailStatus::Sent);
        assert_eq!(entry.retry_count, Some(1));
        assert_eq!(entry.error_message, None);
    }

    #[tokio::test]
    async fn pause_mid_batch_then_resume_without_resending() {
        let mut transport = FakeTransport::new();
        transport.pause_on_attempt = Some(2);
        let (orchestrator, transport, _) = setup(transport);

        orchestrator
            .start(Some(&demo_accounts()[0]), &recipients(5), email(), config(5))
            .unwrap();
        let state = orchestrator.run().await;

        assert_eq!(state, RunState::Paused);
        let counts = orchestrator.counts();
        // The send in flight at pause time still lands.
        assert_eq!(counts.sent, 2);
        assert_eq!(counts.sending, 3);
        assert_eq!(transport.deliveries().len(), 2);

        orchestrator.resume().unwrap();
        assert_eq!(orchestrator.counts().pending, 3);
        let state = orchestrator.run().await;

        assert_eq!(state, RunState::Completed);
        assert_eq!(orchestrator.counts().sent, 5);
        let delivered: HashSet<String> = transport
            .deliveries()
            .iter()
            .map(|d| d.to[0].clone())
            .collect();
        assert_eq!(delivered.len(), 5);
        assert_eq!(transport.deliveries().len(), 5);
    }

    #[tokio::test]
    async fn start_while_paused_resumes() {
        let mut transport = FakeTransport::new();
        transport.pause_on_attempt = Some(1);
        let (orchestrator, transport, _) = setup(transport);
        let account = demo_accounts()[0].clone();

        orchestrator
            .start(Some(&account), &recipients(3), email(), config(3))
            .unwrap();
        orchestrator.run().await;
        assert!(orchestrator.status().is_paused());
        let started_at = orchestrator.status().start_time;

        orchestrator
            .start(Some(&account), &recipients(3), email(), config(3))
            .unwrap();
        assert_eq!(orchestrator.status().start_time, started_at);
        orchestrator.run().await;

        assert_eq!(orchestrator.counts().sent, 3);
        assert_eq!(transport.deliveries().len(), 3);
    }

    #[tokio::test]
    async fn restart_resets_every_entry() {
        let (orchestrator, _, _) = setup(FakeTransport::failing("user1@example.com", 1));

        orchestrator
            .start(Some(&demo_accounts()[0]), &recipients(3), email(), config(10))
            .unwrap();
        orchestrator.run().await;
        assert_eq!(orchestrator.status().state, RunState::Completed);

        orchestrator.restart();

        assert_eq!(orchestrator.status(), RunStatus::default());
        let entries = orchestrator.ledger_entries();
        assert_eq!(entries.len(), 3);
        for entry in entries {
            assert_eq!(entry.status, EmailStatus::Pending);
            assert_eq!(entry.timestamp, None);
            assert_eq!(entry.error_message, None);
            assert_eq!(entry.retry_count, None);
        }

        orchestrator
            .start(Some(&demo_accounts()[0]), &recipients(3), email(), config(10))
            .unwrap();
        assert_eq!(orchestrator.run().await, RunState::Completed);
        assert_eq!(orchestrator.counts().sent, 3);
    }

    #[tokio::test]
    async fn bulk_mode_sends_one_message_per_500_recipients() {
        let (orchestrator, transport, _) = setup(FakeTransport::new());
        let config = CampaignConfig {
            send_mode: SendMode::Bulk,
            ..config(10)
        };

        orchestrator
            .start(Some(&demo_accounts()[0]), &recipients(1201), email(), config)
            .unwrap();
        assert_eq!(orchestrator.counts().pending, 3);
        assert_eq!(orchestrator.ledger_entries()[2].target, "Batch 3 (201 recipients)");

        orchestrator.run().await;

        let sizes: Vec<usize> = transport.deliveries().iter().map(|d| d.to.len()).collect();
        assert_eq!(sizes, vec![500, 500, 201]);
        assert_eq!(transport.deliveries()[0].html_body, "<p>Hi </p>");
        assert_eq!(orchestrator.counts().sent, 3);
    }

    #[tokio::test]
    async fn missing_authentication_pauses_without_losing_work() {
        let transport = FakeTransport::new();
        transport.authenticated.store(false, Ordering::SeqCst);
        let (orchestrator, transport, _) = setup(transport);

        orchestrator
            .start(Some(&demo_accounts()[0]), &recipients(3), email(), config(3))
            .unwrap();
        let state = orchestrator.run().await;

        assert_eq!(state, RunState::Paused);
        let first = orchestrator.ledger_entries()[0].clone();
        assert_eq!(first.status, EmailStatus::Pending);
        assert!(first.error_message.is_some());
        assert_eq!(orchestrator.counts().failed, 0);

        transport.authenticated.store(true, Ordering::SeqCst);
        orchestrator.resume().unwrap();
        assert_eq!(orchestrator.run().await, RunState::Completed);
        assert_eq!(orchestrator.counts().sent, 3);
    }

    #[tokio::test]
    async fn control_calls_reject_wrong_states() {
        let (orchestrator, _, _) = setup(FakeTransport::new());
        assert!(matches!(orchestrator.pause(), Err(CampaignError::NotRunning)));
        assert!(matches!(orchestrator.resume(), Err(CampaignError::NotPaused)));

        let account = demo_accounts()[0].clone();
        orchestrator
            .start(Some(&account), &recipients(2), email(), config(2))
            .unwrap();
        assert!(matches!(
            orchestrator.start(Some(&account), &recipients(2), email(), config(2)),
            Err(CampaignError::AlreadyRunning)
        ));

        orchestrator.run().await;
        assert!(matches!(
            orchestrator.start(Some(&account), &recipients(2), email(), config(2)),
            Err(CampaignError::AlreadyCompleted)
        ));
    }

    #[tokio::test]
    async fn config_snapshot_is_taken_at_start() {
        let (orchestrator, _, _) = setup(FakeTransport::new());
        let mut config = config(4);

        orchestrator
            .start(Some(&demo_accounts()[0]), &recipients(2), email(), config.clone())
            .unwrap();
        config.batch_size = 1;

        assert_eq!(orchestrator.config().unwrap().batch_size, 4);
        assert_eq!(orchestrator.total_batches(), 1);
    }

    /// Holds every send until the test hands out a permit.
    struct GatedTransport {
        gate: Semaphore,
        attempts: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delivered: Mutex<Vec<String>>,
    }

    impl GatedTransport {
        fn new() -> Self {
            GatedTransport {
                gate: Semaphore::new(0),
                attempts: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                delivered: Mutex::new(Vec::new()),
            }
        }

        async fn wait_for_attempts(&self, count: usize) {
            while self.attempts.load(Ordering::SeqCst) < count {
                tokio::task::yield_now().await;
            }
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MailTransport for GatedTransport {
        async fn send_one(&self, to: &str, _content: &MailContent<'_>) -> Result<SendReceipt, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.delivered.lock().unwrap().push(to.to_string());
            Ok(SendReceipt {
                id: to.to_string(),
                thread_id: to.to_string(),
            })
        }

        async fn send_bulk(
            &self,
            to: &[String],
            content: &MailContent<'_>,
        ) -> Result<SendReceipt, TransportError> {
            self.send_one(&to[0], content).await
        }
    }

    fn gated() -> (Arc<Orchestrator>, Arc<GatedTransport>) {
        let transport = Arc::new(GatedTransport::new());
        let orchestrator = Arc::new(Orchestrator::new(
            transport.clone(),
            Arc::new(InstantClock::default()),
        ));
        (orchestrator, transport)
    }

    fn spawn_run(orchestrator: &Arc<Orchestrator>) -> tokio::task::JoinHandle<RunState> {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    }

    // Gives every spawned task a chance to get as far as it can.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn resume_while_a_send_is_in_flight_waits_for_it() {
        let (orchestrator, transport) = gated();
        orchestrator
            .start(Some(&demo_accounts()[0]), &recipients(3), email(), config(3))
            .unwrap();

        let first = spawn_run(&orchestrator);
        transport.wait_for_attempts(1).await;
        orchestrator.pause().unwrap();
        orchestrator.resume().unwrap();
        let second = spawn_run(&orchestrator);
        settle().await;

        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        // The send on the wire keeps its entry; the rest are pending again.
        let entries = orchestrator.ledger_entries();
        assert_eq!(entries[0].status, EmailStatus::Sending);
        assert_eq!(entries[1].status, EmailStatus::Pending);

        transport.gate.add_permits(3);
        first.await.unwrap();
        assert_eq!(second.await.unwrap(), RunState::Completed);

        assert_eq!(transport.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(
            transport.delivered(),
            vec![
                "user0@example.com".to_string(),
                "user1@example.com".to_string(),
                "user2@example.com".to_string(),
            ]
        );
        assert_eq!(orchestrator.counts().sent, 3);
    }

    #[tokio::test]
    async fn restart_discards_the_result_of_a_send_in_flight() {
        let (orchestrator, transport) = gated();
        orchestrator
            .start(Some(&demo_accounts()[0]), &recipients(2), email(), config(2))
            .unwrap();

        let first = spawn_run(&orchestrator);
        transport.wait_for_attempts(1).await;
        orchestrator.restart();
        transport.gate.add_permits(1);

        assert_eq!(first.await.unwrap(), RunState::Idle);
        assert_eq!(transport.delivered().len(), 1);
        assert_eq!(orchestrator.status(), RunStatus::default());
        for entry in orchestrator.ledger_entries() {
            assert_eq!(entry.status, EmailStatus::Pending);
            assert_eq!(entry.timestamp, None);
            assert_eq!(entry.error_message, None);
        }
    }

    #[tokio::test]
    async fn fresh_start_after_restart_waits_for_the_old_send() {
        let (orchestrator, transport) = gated();
        let account = demo_accounts()[0].clone();
        orchestrator
            .start(Some(&account), &recipients(2), email(), config(2))
            .unwrap();

        let first = spawn_run(&orchestrator);
        transport.wait_for_attempts(1).await;
        orchestrator.restart();
        orchestrator
            .start(Some(&account), &recipients(2), email(), config(2))
            .unwrap();
        let second = spawn_run(&orchestrator);
        settle().await;
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);

        transport.gate.add_permits(3);
        first.await.unwrap();
        assert_eq!(second.await.unwrap(), RunState::Completed);

        assert_eq!(transport.max_active.load(Ordering::SeqCst), 1);
        // The old run's send went out but only the new run's sends are recorded.
        assert_eq!(transport.delivered().len(), 3);
        assert_eq!(orchestrator.counts().sent, 2);
    }

    #[tokio::test]
    async fn sender_name_with_comma_still_sends() {
        let (orchestrator, transport, _) = setup(FakeTransport::new());
        let account = Account {
            id: "9".to_string(),
            email: "john@example.com".to_string(),
            name: "Doe, John".to_string(),
        };

        orchestrator
            .start(Some(&account), &recipients(2), email(), config(2))
            .unwrap();

        assert_eq!(orchestrator.run().await, RunState::Completed);
        assert_eq!(orchestrator.counts().sent, 2);
        assert_eq!(transport.deliveries()[0].subject, "Hello from Doe, John");
    }
}
