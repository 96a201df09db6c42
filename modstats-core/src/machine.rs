//! Reporting state machine
//!
//! Decides, per trigger, whether to prompt for consent, start a report, or do
//! nothing, and records the outcome of each submission durably. A single
//! mutex guards both the consent store and the phase flag, so racing external
//! events (boot, connectivity, consent toggles) observe consistent state and
//! at most one submission is ever in flight per process.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::identity::{DeviceRecord, IdentitySource};
use crate::reporter::{ReportOutcome, Reporter};
use crate::store::ConsentStore;

/// Machine phase. Transitions into `Reporting` and back to `Idle` are
/// strictly sequential; the phase flag, not thread identity, enforces the
/// single-flight invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingConsent,
    Reporting,
}

/// What a trigger invocation decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// First boot: the user was asked for consent, no report this cycle.
    PromptedConsent,
    /// A submission was started on a background task.
    ReportStarted,
    /// Nothing to do: opted out, already checked in, or a report is in flight.
    Skipped,
}

/// Requests a user-visible consent prompt. Fire-and-forget; the machine
/// consumes no return value.
pub trait ConsentPrompt: Send + Sync {
    fn prompt_consent(&self);
}

struct Inner {
    store: ConsentStore,
    phase: Phase,
    in_flight: Option<JoinHandle<()>>,
}

/// The reporting state machine.
///
/// A single instance owns the consent store for the process; external events
/// reach it by reference through the [`crate::dispatch::EventDispatcher`].
pub struct ReportingStateMachine {
    inner: Arc<Mutex<Inner>>,
    identity: Arc<dyn IdentitySource>,
    reporter: Arc<dyn Reporter>,
    prompt: Arc<dyn ConsentPrompt>,
}

impl ReportingStateMachine {
    pub fn new(
        store: ConsentStore,
        identity: Arc<dyn IdentitySource>,
        reporter: Arc<dyn Reporter>,
        prompt: Arc<dyn ConsentPrompt>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                store,
                phase: Phase::Idle,
                in_flight: None,
            })),
            identity,
            reporter,
            prompt,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Single entry point for service starts.
    ///
    /// Returns immediately in all cases; the submission itself runs on a
    /// spawned task so event delivery is never blocked by the network.
    /// Must be called from within a Tokio runtime context.
    pub fn on_trigger(&self) -> Result<TriggerOutcome> {
        let mut inner = self.lock();

        if inner.store.first_boot()? {
            inner.phase = Phase::AwaitingConsent;
            drop(inner);
            tracing::info!("First boot: prompting user for opt-in");
            self.prompt.prompt_consent();
            return Ok(TriggerOutcome::PromptedConsent);
        }

        if !inner.store.opted_in()? {
            tracing::debug!("User has not opted in; skipping report");
            return Ok(TriggerOutcome::Skipped);
        }

        if inner.store.checked_in()? {
            tracing::debug!("Already checked in this boot cycle; skipping report");
            return Ok(TriggerOutcome::Skipped);
        }

        if inner.phase == Phase::Reporting {
            tracing::debug!("Report already in flight; dropping trigger");
            return Ok(TriggerOutcome::Skipped);
        }

        inner.phase = Phase::Reporting;
        tracing::info!("User has opted in; starting report");

        let record = DeviceRecord::collect(self.identity.as_ref());
        let reporter = Arc::clone(&self.reporter);
        let shared = Arc::clone(&self.inner);

        let handle = tokio::spawn(async move {
            let outcome = reporter.submit(&record).await;

            // The completing submission performs its own store write even if a
            // reset arrived meanwhile; whichever write lands last wins.
            let mut inner = shared.lock().unwrap();
            match outcome {
                ReportOutcome::Success => {
                    if let Err(e) = inner.store.set_checked_in(true) {
                        tracing::error!(error = %e, "Failed to persist check-in");
                    }
                    if let Err(e) = inner.store.set_last_checkin_at(Utc::now()) {
                        tracing::error!(error = %e, "Failed to persist check-in time");
                    }
                    tracing::info!("Check-in complete");
                }
                ReportOutcome::Failure(reason) => {
                    // Leave checkedin false so the next eligible trigger retries.
                    if let Err(e) = inner.store.set_checked_in(false) {
                        tracing::error!(error = %e, "Failed to persist check-in state");
                    }
                    tracing::warn!(%reason, "Check-in failed; will retry on a later trigger");
                }
            }
            inner.phase = Phase::Idle;
        });

        inner.in_flight = Some(handle);
        Ok(TriggerOutcome::ReportStarted)
    }

    /// Boot-completed and shutdown notifications: unconditionally clear the
    /// check-in flag so every boot cycle gets at most one successful report
    /// and a prior failure never blocks retry.
    pub fn on_external_reset(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.store.set_checked_in(false)?;
        tracing::debug!("External reset: checkedin cleared");
        Ok(())
    }

    /// Connectivity recovery triggers an opportunistic retry.
    pub fn on_connectivity_changed(&self, has_connectivity: bool) -> Result<TriggerOutcome> {
        let checked_in = self.lock().store.checked_in()?;

        if !checked_in && has_connectivity {
            tracing::debug!("Connectivity restored; attempting report");
            self.on_trigger()
        } else {
            Ok(TriggerOutcome::Skipped)
        }
    }

    /// The one mutation path from the consent UI. Persists the choice,
    /// clears the first-boot flag, and on grant attempts a report right away.
    pub fn on_consent_changed(&self, opted_in: bool) -> Result<TriggerOutcome> {
        {
            let mut inner = self.lock();
            inner.store.set_opted_in(opted_in)?;
            inner.store.clear_first_boot()?;
            if inner.phase == Phase::AwaitingConsent {
                inner.phase = Phase::Idle;
            }
        }

        tracing::info!(opted_in, "Consent updated");

        if opted_in {
            self.on_trigger()
        } else {
            Ok(TriggerOutcome::Skipped)
        }
    }

    /// Await the in-flight submission, if any. Used by CLI commands to drain
    /// before exit and by tests for deterministic assertions.
    pub async fn wait_idle(&self) {
        let handle = self.lock().in_flight.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Run a closure against the consent store under the state lock.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut ConsentStore) -> R) -> R {
        f(&mut self.lock().store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentitySource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StaticIdentity;

    impl IdentitySource for StaticIdentity {
        fn device_hash(&self) -> String {
            "deadbeef".to_string()
        }
        fn device_name(&self) -> String {
            "starlite".to_string()
        }
        fn mod_version(&self) -> String {
            "21.0".to_string()
        }
        fn country_code(&self) -> String {
            "us".to_string()
        }
        fn carrier_name(&self) -> String {
            "T-Mobile".to_string()
        }
        fn carrier_id(&self) -> String {
            "310260".to_string()
        }
    }

    struct FakeReporter {
        outcome: ReportOutcome,
        delay: Option<Duration>,
        submissions: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        last_record: Mutex<Option<DeviceRecord>>,
    }

    impl FakeReporter {
        fn succeeding() -> Arc<Self> {
            Self::with_outcome(ReportOutcome::Success)
        }

        fn failing() -> Arc<Self> {
            Self::with_outcome(ReportOutcome::Failure("server returned 500".to_string()))
        }

        fn with_outcome(outcome: ReportOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                delay: None,
                submissions: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                last_record: Mutex::new(None),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcome: ReportOutcome::Success,
                delay: Some(delay),
                submissions: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                last_record: Mutex::new(None),
            })
        }

        fn submissions(&self) -> usize {
            self.submissions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Reporter for FakeReporter {
        async fn submit(&self, record: &DeviceRecord) -> ReportOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            *self.last_record.lock().unwrap() = Some(record.clone());
            self.submissions.fetch_add(1, Ordering::SeqCst);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    #[derive(Default)]
    struct CountingPrompt {
        prompts: AtomicUsize,
    }

    impl ConsentPrompt for CountingPrompt {
        fn prompt_consent(&self) {
            self.prompts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn machine_with(
        store: ConsentStore,
        reporter: Arc<FakeReporter>,
    ) -> (ReportingStateMachine, Arc<CountingPrompt>) {
        crate::logging::init_test();
        let prompt = Arc::new(CountingPrompt::default());
        let machine = ReportingStateMachine::new(
            store,
            Arc::new(StaticIdentity),
            reporter,
            Arc::clone(&prompt) as Arc<dyn ConsentPrompt>,
        );
        (machine, prompt)
    }

    fn seasoned_store() -> ConsentStore {
        // A store past its first boot, opted in, not yet checked in.
        let mut store = ConsentStore::in_memory();
        store.clear_first_boot().unwrap();
        store
    }

    #[tokio::test]
    async fn first_boot_prompts_and_never_reports() {
        // Scenario A: fresh install, boot trigger
        let reporter = FakeReporter::succeeding();
        let (machine, prompt) = machine_with(ConsentStore::in_memory(), Arc::clone(&reporter));

        let outcome = machine.on_trigger().unwrap();

        assert_eq!(outcome, TriggerOutcome::PromptedConsent);
        assert_eq!(prompt.prompts.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.submissions(), 0);
        assert!(!machine.with_store(|s| s.checked_in()).unwrap());
    }

    #[tokio::test]
    async fn successful_report_sets_checked_in() {
        // Scenario B
        let reporter = FakeReporter::succeeding();
        let (machine, _) = machine_with(seasoned_store(), Arc::clone(&reporter));

        assert_eq!(machine.on_trigger().unwrap(), TriggerOutcome::ReportStarted);
        machine.wait_idle().await;

        assert_eq!(reporter.submissions(), 1);
        assert!(machine.with_store(|s| s.checked_in()).unwrap());
        assert!(machine.with_store(|s| s.last_checkin_at()).unwrap().is_some());

        let record = reporter.last_record.lock().unwrap().clone().unwrap();
        assert_eq!(record.device_hash, "deadbeef");
        assert_eq!(record.device_name, "starlite");
        assert_eq!(record.device_version, "21.0");
        assert_eq!(record.device_country, "us");
        assert_eq!(record.device_carrier, "T-Mobile");
        assert_eq!(record.device_carrier_id, "310260");
    }

    #[tokio::test]
    async fn failed_report_leaves_checked_in_false() {
        // Scenario C
        let reporter = FakeReporter::failing();
        let (machine, prompt) = machine_with(seasoned_store(), Arc::clone(&reporter));

        assert_eq!(machine.on_trigger().unwrap(), TriggerOutcome::ReportStarted);
        machine.wait_idle().await;

        assert_eq!(reporter.submissions(), 1);
        assert!(!machine.with_store(|s| s.checked_in()).unwrap());
        assert_eq!(prompt.prompts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn opted_out_never_reports() {
        // P2: no trigger shape produces a submission while opted out
        let reporter = FakeReporter::succeeding();
        let mut store = seasoned_store();
        store.set_opted_in(false).unwrap();
        let (machine, _) = machine_with(store, Arc::clone(&reporter));

        assert_eq!(machine.on_trigger().unwrap(), TriggerOutcome::Skipped);
        machine.on_external_reset().unwrap();
        assert_eq!(machine.on_trigger().unwrap(), TriggerOutcome::Skipped);
        assert_eq!(
            machine.on_connectivity_changed(true).unwrap(),
            TriggerOutcome::Skipped
        );
        machine.wait_idle().await;

        assert_eq!(reporter.submissions(), 0);
    }

    #[tokio::test]
    async fn repeated_triggers_after_checkin_are_idempotent() {
        // P5
        let reporter = FakeReporter::succeeding();
        let mut store = seasoned_store();
        store.set_checked_in(true).unwrap();
        let (machine, _) = machine_with(store, Arc::clone(&reporter));

        for _ in 0..5 {
            assert_eq!(machine.on_trigger().unwrap(), TriggerOutcome::Skipped);
        }
        machine.wait_idle().await;

        assert_eq!(reporter.submissions(), 0);
    }

    #[tokio::test]
    async fn at_most_one_submission_in_flight() {
        // P1: overlapping triggers while a report is in flight are dropped
        let reporter = FakeReporter::slow(Duration::from_millis(50));
        let (machine, _) = machine_with(seasoned_store(), Arc::clone(&reporter));

        assert_eq!(machine.on_trigger().unwrap(), TriggerOutcome::ReportStarted);
        assert_eq!(machine.on_trigger().unwrap(), TriggerOutcome::Skipped);
        assert_eq!(
            machine.on_connectivity_changed(true).unwrap(),
            TriggerOutcome::Skipped
        );
        machine.wait_idle().await;

        assert_eq!(reporter.submissions(), 1);
        assert_eq!(reporter.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connectivity_after_checkin_is_a_noop() {
        // Scenario D
        let reporter = FakeReporter::succeeding();
        let mut store = seasoned_store();
        store.set_checked_in(true).unwrap();
        let (machine, _) = machine_with(store, Arc::clone(&reporter));

        assert_eq!(
            machine.on_connectivity_changed(true).unwrap(),
            TriggerOutcome::Skipped
        );
        machine.wait_idle().await;

        assert_eq!(reporter.submissions(), 0);
    }

    #[tokio::test]
    async fn connectivity_recovery_retries_exactly_once() {
        // Scenario E
        let reporter = FakeReporter::succeeding();
        let (machine, _) = machine_with(seasoned_store(), Arc::clone(&reporter));

        assert_eq!(
            machine.on_connectivity_changed(false).unwrap(),
            TriggerOutcome::Skipped
        );
        machine.wait_idle().await;
        assert_eq!(reporter.submissions(), 0);

        assert_eq!(
            machine.on_connectivity_changed(true).unwrap(),
            TriggerOutcome::ReportStarted
        );
        machine.wait_idle().await;
        assert_eq!(reporter.submissions(), 1);
    }

    #[tokio::test]
    async fn reset_scopes_checkin_to_one_boot_cycle() {
        // P3
        let reporter = FakeReporter::succeeding();
        let (machine, _) = machine_with(seasoned_store(), Arc::clone(&reporter));

        machine.on_trigger().unwrap();
        machine.wait_idle().await;
        assert!(machine.with_store(|s| s.checked_in()).unwrap());

        machine.on_external_reset().unwrap();
        assert!(!machine.with_store(|s| s.checked_in()).unwrap());

        // Next boot cycle gets its own report
        assert_eq!(machine.on_trigger().unwrap(), TriggerOutcome::ReportStarted);
        machine.wait_idle().await;
        assert_eq!(reporter.submissions(), 2);
        assert!(machine.with_store(|s| s.checked_in()).unwrap());
    }

    #[tokio::test]
    async fn first_boot_clears_once_and_never_reverts() {
        // P4
        let reporter = FakeReporter::succeeding();
        let (machine, _) = machine_with(ConsentStore::in_memory(), Arc::clone(&reporter));

        assert!(machine.with_store(|s| s.first_boot()).unwrap());
        machine.on_consent_changed(false).unwrap();
        assert!(!machine.with_store(|s| s.first_boot()).unwrap());

        // Flipping consent again must not resurrect the flag
        machine.on_consent_changed(true).unwrap();
        machine.wait_idle().await;
        assert!(!machine.with_store(|s| s.first_boot()).unwrap());
    }

    #[tokio::test]
    async fn consent_grant_triggers_immediate_report() {
        let reporter = FakeReporter::succeeding();
        let (machine, prompt) = machine_with(ConsentStore::in_memory(), Arc::clone(&reporter));

        // First boot: only a prompt
        assert_eq!(machine.on_trigger().unwrap(), TriggerOutcome::PromptedConsent);
        assert_eq!(reporter.submissions(), 0);

        // User grants consent from the prompt
        assert_eq!(
            machine.on_consent_changed(true).unwrap(),
            TriggerOutcome::ReportStarted
        );
        machine.wait_idle().await;

        assert_eq!(reporter.submissions(), 1);
        assert_eq!(prompt.prompts.load(Ordering::SeqCst), 1);
        assert!(machine.with_store(|s| s.checked_in()).unwrap());
    }

    #[tokio::test]
    async fn consent_denial_reports_nothing() {
        let reporter = FakeReporter::succeeding();
        let (machine, _) = machine_with(ConsentStore::in_memory(), Arc::clone(&reporter));

        assert_eq!(
            machine.on_consent_changed(false).unwrap(),
            TriggerOutcome::Skipped
        );
        machine.wait_idle().await;

        assert_eq!(reporter.submissions(), 0);
        assert!(!machine.with_store(|s| s.opted_in()).unwrap());
    }

    #[tokio::test]
    async fn reset_during_in_flight_report_lets_it_complete() {
        // A reset only touches the flag; the completing submission still
        // performs its own write, and the last write wins.
        let reporter = FakeReporter::slow(Duration::from_millis(50));
        let (machine, _) = machine_with(seasoned_store(), Arc::clone(&reporter));

        assert_eq!(machine.on_trigger().unwrap(), TriggerOutcome::ReportStarted);
        machine.on_external_reset().unwrap();
        machine.wait_idle().await;

        assert_eq!(reporter.submissions(), 1);
        assert!(machine.with_store(|s| s.checked_in()).unwrap());
    }
}
