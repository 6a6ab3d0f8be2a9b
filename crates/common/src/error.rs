// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Error types for Loophole

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
}

/// No usable bearer token
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
    #[error("You are not logged in, please log in first")]
    NotLoggedIn,

    #[error("Failed to read token file {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("Token refresh was rejected: {0}")]
    RefreshRejected(String),

    #[error("Your session has expired, please log in again")]
    Reauthenticate,
}

/// Rules the control plane enforces on requested hostnames
pub const HOSTNAME_RULES: &str = "The hostname must start with a letter, \
contain only small letters, numbers and single dashes (-), \
end with a letter or number, \
and be at least 6 characters long";

/// Site registration refused by the control plane
///
/// `message` is the server-provided text, kept verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Invalid hostname: {message}")]
    InvalidHostname { message: String, details: String },

    #[error("Access to this hostname is forbidden: {message}")]
    Forbidden { message: String },

    #[error("Hostname is already taken: {message}")]
    Conflict { message: String },

    #[error("Hostname does not meet the requirements: {message}")]
    Validation { message: String, details: String },

    #[error("Unexpected response from the API (status {status}): {message}")]
    Unexpected {
        status: u16,
        message: String,
        details: String,
    },

    #[error("Could not reach the API: {0}")]
    Transport(String),
}

impl RegistrationError {
    /// The server-provided message
    pub fn message(&self) -> &str {
        match self {
            RegistrationError::InvalidHostname { message, .. }
            | RegistrationError::Forbidden { message }
            | RegistrationError::Conflict { message }
            | RegistrationError::Validation { message, .. }
            | RegistrationError::Unexpected { message, .. } => message,
            RegistrationError::Transport(reason) => reason,
        }
    }
}

/// SSH gateway failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Could not connect to the gateway at {endpoint} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Gateway rejected public key authentication for site {0}")]
    AuthenticationRejected(String),

    #[error("Failed to load SSH identity {path}: {reason}")]
    Identity { path: String, reason: String },

    #[error("Failed to open the remote listener: {0}")]
    ListenFailed(String),
}

/// One relayed connection failed; the tunnel keeps running
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to reach local server at {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Relay interrupted: {0}")]
    Copy(#[from] std::io::Error),
}

/// Malformed daemon command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty message")]
    Empty,

    #[error("Unknown message")]
    Unknown(String),

    #[error("Malformed {command} message: {reason}")]
    Malformed { command: String, reason: String },
}

/// Local server could not be built or started
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("Failed to bind local listener: {0}")]
    Bind(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Invalid local target: {0}")]
    InvalidTarget(String),
}

/// Anything that ends a tunnel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Invalid tunnel request: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("Site {0} already has a running tunnel")]
    SiteInUse(String),

    #[error("Tunnel task ended unexpectedly: {0}")]
    Aborted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_message_is_verbatim() {
        let err = RegistrationError::Conflict {
            message: "The given hostname is already taken by different user".into(),
        };
        assert_eq!(
            err.message(),
            "The given hostname is already taken by different user"
        );
        assert!(err.to_string().ends_with("already taken by different user"));
    }

    #[test]
    fn test_unknown_message_text() {
        assert_eq!(
            ProtocolError::Unknown("FOO".into()).to_string(),
            "Unknown message"
        );
    }

    #[test]
    fn test_tunnel_error_is_transparent() {
        let err: TunnelError = AuthenticationError::NotLoggedIn.into();
        assert_eq!(err.to_string(), AuthenticationError::NotLoggedIn.to_string());
    }
}
