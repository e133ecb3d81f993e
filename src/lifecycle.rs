use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::debug;

/// Lifecycle state of a service guarded by [`StartStopOnce`].
///
/// `Starting` and `Stopping` are only observable while the guarded start or
/// stop callback runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Unstarted = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
    Stopped = 4,
}

impl State {
    fn from_u8(n: u8) -> State {
        match n {
            0 => State::Unstarted,
            1 => State::Starting,
            2 => State::Started,
            3 => State::Stopping,
            _ => State::Stopped,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Unstarted => "Unstarted",
            State::Starting => "Starting",
            State::Started => "Started",
            State::Stopping => "Stopping",
            State::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("{name} has already been started once; state={state}")]
    AlreadyStarted { name: &'static str, state: State },

    #[error("{name} has already stopped once; state={state}")]
    AlreadyStopped { name: &'static str, state: State },

    #[error("{name} cannot be stopped from state {state}")]
    CannotStop { name: &'static str, state: State },

    #[error("{name} is not started; state={state}")]
    NotStarted { name: &'static str, state: State },
}

/// Exactly-once start/stop guard.
///
/// Transitions are made with a single compare-and-swap on an atomic state, so
/// concurrent `start_once`/`stop_once` calls can never both win.
#[derive(Debug)]
pub struct StartStopOnce {
    name: &'static str,
    state: AtomicU8,
}

impl StartStopOnce {
    pub fn new(name: &'static str) -> StartStopOnce {
        StartStopOnce {
            name,
            state: AtomicU8::new(State::Unstarted as u8),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Runs `f` if and only if this is the first start. A failing callback
    /// leaves the service stopped.
    pub async fn start_once<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<LifecycleError>,
    {
        self.transition(State::Unstarted, State::Starting)
            .map_err(|state| LifecycleError::AlreadyStarted {
                name: self.name,
                state,
            })?;

        let result = f().await;
        let next = if result.is_ok() {
            State::Started
        } else {
            State::Stopped
        };
        self.state.store(next as u8, Ordering::SeqCst);
        debug!("{} is now {}", self.name, next);
        result
    }

    /// Runs `f` if and only if the service is started and this is the first
    /// stop. The service is stopped afterwards even if `f` fails.
    pub async fn stop_once<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<LifecycleError>,
    {
        self.transition(State::Started, State::Stopping)
            .map_err(|state| match state {
                State::Stopping | State::Stopped => LifecycleError::AlreadyStopped {
                    name: self.name,
                    state,
                },
                _ => LifecycleError::CannotStop {
                    name: self.name,
                    state,
                },
            })?;

        let result = f().await;
        self.state.store(State::Stopped as u8, Ordering::SeqCst);
        debug!("{} is now {}", self.name, State::Stopped);
        result
    }

    pub fn ready(&self) -> Result<(), LifecycleError> {
        match self.state() {
            State::Started => Ok(()),
            state => Err(LifecycleError::NotStarted {
                name: self.name,
                state,
            }),
        }
    }

    pub fn healthy(&self) -> Result<(), LifecycleError> {
        self.ready()
    }

    fn transition(&self, from: State, to: State) -> Result<(), State> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(State::from_u8)
    }
}
