use std::fmt;
use std::sync::Mutex;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Unstarted,
    Started,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Unstarted => "Unstarted",
            ServiceState::Started => "Started",
            ServiceState::Stopped => "Stopped",
        };
        write!(f, "{}", name)
    }
}

/// Start-once / stop-once guard shared by every long running component.
#[derive(Debug)]
pub struct StateMachine {
    name: &'static str,
    state: Mutex<ServiceState>,
}

impl StateMachine {
    pub fn new(name: &'static str) -> Self {
        StateMachine {
            name,
            state: Mutex::new(ServiceState::Unstarted),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ServiceState {
        *self.lock()
    }

    pub fn is_started(&self) -> bool {
        self.state() == ServiceState::Started
    }

    /// Moves `Unstarted -> Started`. Any other starting state is an error.
    pub fn try_start(&self) -> Result<()> {
        let mut state = self.lock();
        match *state {
            ServiceState::Unstarted => {
                *state = ServiceState::Started;
                Ok(())
            }
            _ => Err(Error::AlreadyStarted(self.name)),
        }
    }

    /// Moves `Started -> Stopped`. Closing twice, or closing something never started, fails.
    pub fn try_stop(&self) -> Result<()> {
        let mut state = self.lock();
        match *state {
            ServiceState::Started => {
                *state = ServiceState::Stopped;
                Ok(())
            }
            ServiceState::Stopped => Err(Error::AlreadyStopped(self.name)),
            ServiceState::Unstarted => Err(Error::NotStarted),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServiceState> {
        // the guarded value is a plain enum, a poisoned lock still holds a valid state
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
