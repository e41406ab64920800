//! Connection session lifecycle for Beacon.
//!
//! A session moves through `Init → Authenticating → Connected →
//! Disconnected`, with `Authenticating → Rejected` as the failure exit.
//! Both end states are terminal. The transition into `Disconnected` is the
//! interesting one: socket errors, explicit logout, and forced closes can
//! race, and unregistration must run exactly once, so
//! [`SessionState::mark_disconnected`] reports whether the caller won.

use thiserror::Error;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket accepted, nothing received yet.
    Init,
    /// Handshake received, credential with the auth validator.
    Authenticating,
    /// Authenticated and registered; the session is live.
    Connected,
    /// Terminal: the connection ended after being live.
    Disconnected,
    /// Terminal: authentication failed; the registry was never touched.
    Rejected,
}

/// Session state errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The requested transition is not legal from the current state.
    #[error("Invalid session transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// State the session was in.
        from: SessionState,
        /// State the transition targeted.
        to: SessionState,
    },
}

impl SessionState {
    fn transition(&mut self, from: SessionState, to: SessionState) -> Result<(), SessionError> {
        if *self == from {
            *self = to;
            Ok(())
        } else {
            Err(SessionError::InvalidTransition { from: *self, to })
        }
    }

    /// Handshake credentials arrived: `Init → Authenticating`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not in `Init`.
    pub fn begin_authentication(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Init, SessionState::Authenticating)
    }

    /// The auth validator resolved an identity: `Authenticating → Connected`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not in `Authenticating`.
    pub fn mark_connected(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Authenticating, SessionState::Connected)
    }

    /// The auth validator refused the credential: `Authenticating → Rejected`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not in `Authenticating`.
    pub fn mark_rejected(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Authenticating, SessionState::Rejected)
    }

    /// The connection ended: `Connected → Disconnected`.
    ///
    /// Idempotent under racing causes: returns `true` only for the call
    /// that performed the transition, which gates unregistration.
    pub fn mark_disconnected(&mut self) -> bool {
        if *self == SessionState::Connected {
            *self = SessionState::Disconnected;
            true
        } else {
            false
        }
    }

    /// Whether the session reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Rejected)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Init
    }
}
