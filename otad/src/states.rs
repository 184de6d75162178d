//! The update lifecycle state machine.
//!
//! Each state is a tagged variant carrying exactly the payload its
//! handler needs: the in-flight update package, a cancellation token
//! for the states that block, or an error cause. Handlers execute to
//! completion on the daemon task and return the next state; a
//! cancelled handler yields without advancing and the daemon resets to
//! Idle.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use otad_updates::UpdateMetadata;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::active_inactive::index_to_install;
use crate::client::{FetchOutcome, ProbeOutcome};
use crate::daemon::Agent;
use crate::error::AgentError;
use crate::installer::Installer;

/// Identity of a state, as reported to the server and the local API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateId {
    Idle,
    Poll,
    UpdateCheck,
    Downloading,
    Installing,
    Installed,
    WaitingForReboot,
    Error,
    Exit,
}

impl StateId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateId::Idle => "idle",
            StateId::Poll => "poll",
            StateId::UpdateCheck => "update-check",
            StateId::Downloading => "downloading",
            StateId::Installing => "installing",
            StateId::Installed => "installed",
            StateId::WaitingForReboot => "waiting-for-reboot",
            StateId::Error => "error",
            StateId::Exit => "exit",
        }
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a handler produced: the next state, or a cancelled yield.
#[derive(Debug)]
pub enum Step {
    Next(State),
    Cancelled,
}

#[derive(Debug)]
pub struct IdleState {
    cancel: CancellationToken,
}

#[derive(Debug)]
pub struct PollState {
    interval: Duration,
    ticks: i64,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub struct DownloadingState {
    update: Arc<UpdateMetadata>,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub struct InstallingState {
    update: Arc<UpdateMetadata>,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub struct ErrorState {
    cause: AgentError,
    update: Option<Arc<UpdateMetadata>>,
}

#[derive(Debug)]
pub enum State {
    Idle(IdleState),
    Poll(PollState),
    UpdateCheck,
    Downloading(DownloadingState),
    Installing(InstallingState),
    Installed(Arc<UpdateMetadata>),
    WaitingForReboot(Arc<UpdateMetadata>),
    Error(ErrorState),
    Exit(i32),
}

impl State {
    pub fn idle() -> Self {
        State::Idle(IdleState {
            cancel: CancellationToken::new(),
        })
    }

    pub fn poll(interval: Duration) -> Self {
        State::Poll(PollState {
            interval,
            ticks: 0,
            cancel: CancellationToken::new(),
        })
    }

    pub fn downloading(update: Arc<UpdateMetadata>) -> Self {
        State::Downloading(DownloadingState {
            update,
            cancel: CancellationToken::new(),
        })
    }

    pub fn installing(update: Arc<UpdateMetadata>) -> Self {
        State::Installing(InstallingState {
            update,
            cancel: CancellationToken::new(),
        })
    }

    pub fn error(cause: AgentError, update: Option<Arc<UpdateMetadata>>) -> Self {
        State::Error(ErrorState { cause, update })
    }

    pub fn id(&self) -> StateId {
        match self {
            State::Idle(_) => StateId::Idle,
            State::Poll(_) => StateId::Poll,
            State::UpdateCheck => StateId::UpdateCheck,
            State::Downloading(_) => StateId::Downloading,
            State::Installing(_) => StateId::Installing,
            State::Installed(_) => StateId::Installed,
            State::WaitingForReboot(_) => StateId::WaitingForReboot,
            State::Error(_) => StateId::Error,
            State::Exit(_) => StateId::Exit,
        }
    }

    /// Token unblocking this state's handler, for the states that can
    /// block.
    pub fn cancel_token(&self) -> Option<&CancellationToken> {
        match self {
            State::Idle(state) => Some(&state.cancel),
            State::Poll(state) => Some(&state.cancel),
            State::Downloading(state) => Some(&state.cancel),
            State::Installing(state) => Some(&state.cancel),
            _ => None,
        }
    }

    /// The update package this state carries, for reporting.
    pub fn reportable_metadata(&self) -> Option<&Arc<UpdateMetadata>> {
        match self {
            State::Downloading(state) => Some(&state.update),
            State::Installing(state) => Some(&state.update),
            State::Installed(update) => Some(update),
            State::WaitingForReboot(update) => Some(update),
            State::Error(state) => state.update.as_ref(),
            _ => None,
        }
    }

    /// The error cause carried by an Error state.
    pub fn error_message(&self) -> Option<String> {
        match self {
            State::Error(state) => Some(state.cause.to_string()),
            _ => None,
        }
    }

    /// Run this state's handler to completion and produce the next
    /// step. The Exit handler is never invoked: the daemon returns its
    /// code on observing the state.
    pub async fn handle(self, agent: &mut Agent) -> Step {
        match self {
            State::Idle(state) => handle_idle(state, agent).await,
            State::Poll(state) => handle_poll(state, agent).await,
            State::UpdateCheck => handle_update_check(agent).await,
            State::Downloading(state) => handle_downloading(state, agent).await,
            State::Installing(state) => handle_installing(state, agent).await,
            State::Installed(_) => Step::Next(State::idle()),
            State::WaitingForReboot(_) => Step::Next(State::idle()),
            State::Error(state) => handle_error(state),
            State::Exit(_) => unreachable!("the exit state is terminal"),
        }
    }
}

/// Idle decides where the machine goes next, or parks the daemon when
/// polling is disabled.
async fn handle_idle(state: IdleState, agent: &mut Agent) -> Step {
    let polling = agent.settings.get().polling.clone();

    if !polling.enabled {
        state.cancel.cancelled().await;
        return Step::Cancelled;
    }

    if polling.extra_interval_secs > 0 {
        let last = polling.last_poll.unwrap_or(DateTime::UNIX_EPOCH);
        let due = last + TimeDelta::seconds(polling.extra_interval_secs as i64);
        if due < Utc::now() {
            return Step::Next(State::UpdateCheck);
        }
    }

    Step::Next(State::poll(polling.interval()))
}

/// Poll counts whole ticks of the configured time step and fires an
/// update check on the interval boundary.
async fn handle_poll(mut state: PollState, agent: &mut Agent) -> Step {
    let time_step = agent.time_step;
    let interval_ticks =
        (state.interval.as_millis() / time_step.as_millis().max(1)).max(1) as i64;

    // One ticker for the whole wait; the first tick fires a full time
    // step from now.
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + time_step, time_step);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                state.ticks += 1;
                if state.ticks > 0 && state.ticks % interval_ticks == 0 {
                    return Step::Next(State::UpdateCheck);
                }
            }
            _ = state.cancel.cancelled() => return Step::Cancelled,
        }
    }
}

/// UpdateCheck probes the server and routes on the outcome. Every
/// branch stamps the poll and clears a consumed extra interval; the
/// retry counter is reset only when an update arrives.
async fn handle_update_check(agent: &mut Agent) -> Step {
    let retries = agent.settings.get().polling.retries;
    let outcome = agent.controller.probe(retries).await;
    let now = Utc::now();

    match outcome {
        Ok(ProbeOutcome {
            update: Some(update),
            ..
        }) => {
            agent.handle.clear_error();

            if let Err(e) = agent.settings.apply(|s| {
                s.polling.last_poll = Some(now);
                s.polling.extra_interval_secs = 0;
                s.polling.retries = 0;
            }) {
                return Step::Next(State::error(e, None));
            }

            Step::Next(State::downloading(Arc::new(update)))
        }
        Ok(ProbeOutcome {
            update: None,
            extra_poll,
        }) => {
            agent.handle.clear_error();

            let polling = agent.settings.get().polling.clone();
            if !extra_poll.is_zero()
                && extra_poll_fits(now, polling.first_poll, polling.interval(), extra_poll)
            {
                info!("server requested an extra poll in {}s", extra_poll.as_secs());
                if let Err(e) = agent.settings.apply(|s| {
                    s.polling.last_poll = Some(now);
                    s.polling.extra_interval_secs = extra_poll.as_secs();
                }) {
                    return Step::Next(State::error(e, None));
                }
                return Step::Next(State::poll(extra_poll));
            }

            if let Err(e) = bump_retries(agent, now) {
                return Step::Next(State::error(e, None));
            }
            Step::Next(State::idle())
        }
        Err(e) => {
            warn!("update check failed: {e}");
            agent.handle.set_error(e.to_string());

            if let Err(persist) = bump_retries(agent, now) {
                return Step::Next(State::error(persist, None));
            }
            Step::Next(State::idle())
        }
    }
}

fn bump_retries(agent: &mut Agent, now: DateTime<Utc>) -> crate::error::Result<()> {
    agent.settings.apply(|s| {
        s.polling.last_poll = Some(now);
        s.polling.extra_interval_secs = 0;
        s.polling.retries += 1;
    })
}

/// A server-requested extra poll is honored only when it would fire
/// before the next regular poll boundary, projected from the first
/// poll by whole intervals.
fn extra_poll_fits(
    now: DateTime<Utc>,
    first_poll: Option<DateTime<Utc>>,
    interval: Duration,
    extra: Duration,
) -> bool {
    let Ok(interval) = TimeDelta::from_std(interval) else {
        return false;
    };
    let Ok(extra) = TimeDelta::from_std(extra) else {
        return false;
    };
    if interval.is_zero() {
        return false;
    }

    let first = first_poll.unwrap_or(DateTime::UNIX_EPOCH);
    let elapsed_ms = (now - first).num_milliseconds();
    let interval_ms = interval.num_milliseconds();

    let next_regular = if elapsed_ms <= 0 {
        first
    } else {
        let steps = (elapsed_ms + interval_ms - 1) / interval_ms;
        first + TimeDelta::milliseconds(interval_ms.saturating_mul(steps))
    };

    now + extra < next_regular
}

/// Downloading fetches the selected object group through the
/// controller, which owns the network work.
async fn handle_downloading(state: DownloadingState, agent: &mut Agent) -> Step {
    let group = match index_to_install(agent.slots.as_ref(), &state.update) {
        Ok(group) => group,
        Err(e) => return Step::Next(State::error(e, Some(state.update))),
    };

    match agent
        .controller
        .fetch(&state.update, group, state.cancel.clone())
        .await
    {
        Ok(FetchOutcome::Complete) => Step::Next(State::installing(state.update)),
        Ok(FetchOutcome::Cancelled) => Step::Cancelled,
        Err(e) => Step::Next(State::error(e, Some(state.update))),
    }
}

/// Installing runs the pipeline, guarded by the package fingerprint so
/// a crash-and-retry never redoes a side-effecting install.
async fn handle_installing(state: InstallingState, agent: &mut Agent) -> Step {
    let package_uid = state.update.package_uid();

    if agent
        .settings
        .get()
        .update
        .last_installed_package_uid
        .as_deref()
        == Some(package_uid.as_str())
    {
        info!("package {package_uid} already installed, waiting for reboot");
        return Step::Next(State::WaitingForReboot(state.update));
    }

    // Recorded before any work begins.
    if let Err(e) = agent.settings.apply(|s| {
        s.update.last_installed_package_uid = Some(package_uid.clone());
    }) {
        return Step::Next(State::error(e, Some(state.update)));
    }

    let settings = agent.settings.snapshot();
    let installer = Installer {
        firmware: &agent.firmware,
        slots: agent.slots.as_ref(),
        policy: agent.policy.as_ref(),
        supported_modes: &settings.update.supported_install_modes,
        factory: &agent.handler_factory,
        read_only: settings.storage.read_only,
    };

    match installer.install_update(&state.update, &settings.update.download_dir) {
        Ok(()) => {
            info!("package {package_uid} installed");
            Step::Next(State::Installed(state.update))
        }
        Err(e) => Step::Next(State::error(e, Some(state.update))),
    }
}

fn handle_error(state: ErrorState) -> Step {
    warn!("{}", state.cause);

    if state.cause.is_fatal() {
        Step::Next(State::Exit(1))
    } else {
        Step::Next(State::idle())
    }
}
