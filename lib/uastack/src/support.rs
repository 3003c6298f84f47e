use std::fmt;
use std::io;
use uabase::status::StatusCode;

/// Transport-level error split. `Wait` marks the recoverable would-block
/// condition on a non-blocking socket; everything else carries the status
/// code that ends the connection or channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(StatusCode),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

impl NetworkError {
    /// The status code to surface for this error; `Wait` maps to Good.
    pub fn status(self) -> StatusCode {
        match self {
            NetworkError::Wait => StatusCode::GOOD,
            NetworkError::Fatal(code) => code,
        }
    }
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> NetworkError {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => NetworkError::Fatal(StatusCode::BAD_CONNECTION_CLOSED),
            _ => NetworkError::Fatal(StatusCode::BAD_COMMUNICATION_ERROR),
        }
    }
}

impl From<StatusCode> for NetworkError {
    fn from(code: StatusCode) -> NetworkError {
        NetworkError::Fatal(code)
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetworkError::Wait => f.write_str("wait"),
            NetworkError::Fatal(code) => write!(f, "fatal: {}", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_is_wait() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetworkError::Wait);
        assert_eq!(err.status(), StatusCode::GOOD);
    }

    #[test]
    fn test_reset_is_connection_closed() {
        let err: NetworkError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(err, NetworkError::Fatal(StatusCode::BAD_CONNECTION_CLOSED));
        assert_eq!(err.status(), StatusCode::BAD_CONNECTION_CLOSED);
    }

    #[test]
    fn test_other_errors_are_communication_errors() {
        let err: NetworkError = io::Error::from(io::ErrorKind::OutOfMemory).into();
        assert_eq!(err, NetworkError::Fatal(StatusCode::BAD_COMMUNICATION_ERROR));
    }
}
