//! CONNECT-time authentication interface.
//!
//! The broker consumes an [`Authenticator`] once per CONNECT; the backing
//! mechanism is the collaborator's business. A refusal maps directly to a
//! CONNACK return code, after which the connection closes.

use thiserror::Error;

use crate::protocol::ConnectReturnCode;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    #[error("unacceptable protocol version")]
    UnacceptableProtocol,
    #[error("client identifier rejected")]
    IdentifierRejected,
    #[error("server unavailable")]
    ServerUnavailable,
    #[error("bad username or password")]
    BadCredentials,
    #[error("not authorized")]
    NotAuthorized,
}

impl ConnectError {
    pub fn return_code(self) -> ConnectReturnCode {
        match self {
            ConnectError::UnacceptableProtocol => ConnectReturnCode::UnacceptableProtocol,
            ConnectError::IdentifierRejected => ConnectReturnCode::IdentifierRejected,
            ConnectError::ServerUnavailable => ConnectReturnCode::ServerUnavailable,
            ConnectError::BadCredentials => ConnectReturnCode::BadCredentials,
            ConnectError::NotAuthorized => ConnectReturnCode::NotAuthorized,
        }
    }
}

/// Identity established for a connection.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub username: Option<String>,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<Identity, ConnectError>;
}

/// Admits every connection; the default for unauthenticated deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(
        &self,
        username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> Result<Identity, ConnectError> {
        Ok(Identity {
            username: username.map(str::to_owned),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_keeps_the_username() {
        let identity = AllowAll.authenticate(Some("probe"), None).unwrap();
        assert_eq!(identity.username.as_deref(), Some("probe"));
    }

    #[test]
    fn refusals_map_to_connack_codes() {
        assert_eq!(
            ConnectError::BadCredentials.return_code(),
            ConnectReturnCode::BadCredentials
        );
        assert_eq!(
            ConnectError::NotAuthorized.return_code(),
            ConnectReturnCode::NotAuthorized
        );
    }
}
