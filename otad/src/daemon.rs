//! The daemon loop and the shared agent handle.
//!
//! One task drives the state machine: report the current state,
//! publish a snapshot for the local API, run the state's handler,
//! advance. Operators never touch the machine directly; they post
//! intents through the handle and the daemon interprets them between
//! transitions.

use otad_updates::{FirmwareMetadata, UpdateMetadata};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::active_inactive::{ActiveInactive, SlotFile};
use crate::controller::Controller;
use crate::handlers::{default_factory, HandlerFactory};
use crate::installer::{InstallIfDifferent, TargetComparison};
use crate::settings::SettingsStore;
use crate::states::{State, StateId, Step};

/// Operator requests interpreted by the daemon at the next transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Force an update check from Idle
    StartUpdate,
    /// Cancel an in-flight download
    AbortDownload,
}

/// Read-only view of the machine published for observers.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: StateId,
    pub package_uid: Option<String>,
    pub update: Option<Arc<UpdateMetadata>>,
    pub progress: Option<u8>,
    pub last_error: Option<String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: StateId::Idle,
            package_uid: None,
            update: None,
            progress: None,
            last_error: None,
        }
    }
}

/// Shared handle between the daemon, the local API and the controller.
///
/// Observers read the snapshot; the only write path into the machine
/// is an intent, which the daemon picks up after the current handler
/// yields.
pub struct AgentHandle {
    snapshot: RwLock<Snapshot>,
    cancel: Mutex<Option<CancellationToken>>,
    intent_tx: mpsc::UnboundedSender<Intent>,
}

impl AgentHandle {
    pub fn new(intent_tx: mpsc::UnboundedSender<Intent>) -> Self {
        Self {
            snapshot: RwLock::new(Snapshot::default()),
            cancel: Mutex::new(None),
            intent_tx,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Post an operator intent. Returns whether the machine was in a
    /// state that accepts it.
    pub fn post(&self, intent: Intent) -> bool {
        let state = self.snapshot().state;

        match (intent, state) {
            (Intent::StartUpdate, StateId::Idle) => {
                let _ = self.intent_tx.send(Intent::StartUpdate);
                self.cancel_current();
                true
            }
            (Intent::AbortDownload, StateId::Downloading) => {
                self.cancel_current();
                true
            }
            _ => {
                debug!("intent {intent:?} ignored in state {state}");
                false
            }
        }
    }

    /// Unblock whatever cancellable state is currently running.
    pub fn cancel_current(&self) {
        if let Some(token) = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            token.cancel();
        }
    }

    fn publish(&self, snapshot: Snapshot) {
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    fn register_cancel(&self, token: Option<CancellationToken>) {
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn set_progress(&self, percent: u8) {
        self.snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .progress = Some(percent);
    }

    pub fn set_error(&self, message: String) {
        self.snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error = Some(message);
    }

    pub fn clear_error(&self) {
        self.snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error = None;
    }
}

/// Everything a state handler works against.
pub struct Agent {
    pub settings: SettingsStore,
    pub firmware: FirmwareMetadata,
    pub controller: Box<dyn Controller>,
    pub slots: Box<dyn ActiveInactive>,
    pub policy: Box<dyn InstallIfDifferent>,
    pub handler_factory: HandlerFactory,
    /// Granularity of the poll scheduler's ticks
    pub time_step: Duration,
    pub handle: Arc<AgentHandle>,
}

impl Agent {
    pub fn new(
        settings: SettingsStore,
        firmware: FirmwareMetadata,
        controller: Box<dyn Controller>,
        handle: Arc<AgentHandle>,
    ) -> Self {
        let slot_file = settings.get().storage.slot_file.clone();

        Self {
            settings,
            firmware,
            controller,
            slots: Box::new(SlotFile::new(slot_file)),
            policy: Box::new(TargetComparison),
            handler_factory: default_factory(),
            time_step: Duration::from_secs(1),
            handle,
        }
    }
}

/// Drives the state machine until Exit or an external stop.
pub struct Daemon {
    agent: Agent,
    intent_rx: mpsc::UnboundedReceiver<Intent>,
    stop: CancellationToken,
}

impl Daemon {
    pub fn new(agent: Agent, intent_rx: mpsc::UnboundedReceiver<Intent>, stop: CancellationToken) -> Self {
        Self {
            agent,
            intent_rx,
            stop,
        }
    }

    /// Run to completion. Returns the process exit code: 0 on a clean
    /// external stop, the Exit state's code otherwise.
    pub async fn run(mut self) -> i32 {
        self.stamp_first_poll();

        let mut state = State::idle();

        loop {
            // Publish (and register the cancel token) before the
            // report goes out, so an observer acting on the reported
            // state always finds the matching snapshot and token.
            self.publish(&state);
            self.report(&state).await;

            let step = state.handle(&mut self.agent).await;
            let mut next = match step {
                Step::Next(next) => next,
                Step::Cancelled => State::idle(),
            };

            // Operator intents apply between transitions only.
            while let Ok(intent) = self.intent_rx.try_recv() {
                if intent == Intent::StartUpdate && next.id() == StateId::Idle {
                    info!("operator requested an update check");
                    next = State::UpdateCheck;
                }
            }

            if self.stop.is_cancelled() {
                info!("stop requested, shutting down");
                return 0;
            }

            if let State::Exit(code) = next {
                return code;
            }

            state = next;
        }
    }

    /// The first poll is stamped once, when polling starts on a fresh
    /// device; extra-poll arbitration projects interval boundaries
    /// from it.
    fn stamp_first_poll(&mut self) {
        let polling = &self.agent.settings.get().polling;
        if polling.enabled && polling.first_poll.is_none() {
            let now = chrono::Utc::now();
            if let Err(e) = self.agent.settings.apply(|s| {
                s.polling.first_poll = Some(now);
            }) {
                warn!("failed to record first poll: {e}");
            }
        }
    }

    /// Best-effort report of the state about to be handled.
    async fn report(&self, state: &State) {
        let package_uid = state.reportable_metadata().map(|m| m.package_uid());
        let error = state.error_message();

        if let Err(e) = self
            .agent
            .controller
            .report(state.id().as_str(), package_uid.as_deref(), error.as_deref())
            .await
        {
            warn!("failed to report state {}: {e}", state.id());
        }
    }

    fn publish(&self, state: &State) {
        self.agent
            .handle
            .register_cancel(state.cancel_token().cloned());

        let mut snapshot = self.agent.handle.snapshot();
        snapshot.state = state.id();
        snapshot.update = state.reportable_metadata().cloned();
        snapshot.package_uid = snapshot.update.as_ref().map(|u| u.package_uid());
        if state.id() != StateId::Downloading {
            snapshot.progress = None;
        }
        if let Some(message) = state.error_message() {
            snapshot.last_error = Some(message);
        }

        self.agent.handle.publish(snapshot);
    }
}
