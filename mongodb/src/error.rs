//! Driver error classification.

use changefeed_core::SourceError;
use mongodb::error::{Error, ErrorKind, WriteFailure};
use std::io;

/// Classify a driver error into the listener's fault taxonomy.
#[must_use]
pub fn source_error(error: &Error) -> SourceError {
    match error.kind.as_ref() {
        ErrorKind::Io(io_error) => match io_error.kind() {
            io::ErrorKind::TimedOut => SourceError::ConnectTimeout(io_error.to_string()),
            io::ErrorKind::WriteZero | io::ErrorKind::BrokenPipe => {
                SourceError::SocketWrite(io_error.to_string())
            }
            _ => SourceError::SocketRead(io_error.to_string()),
        },
        ErrorKind::ServerSelection { message, .. } => SourceError::ConnectTimeout(message.clone()),
        ErrorKind::ConnectionPoolCleared { message, .. } => SourceError::SocketRead(message.clone()),
        ErrorKind::Command(command) => SourceError::CommandFailure {
            code: command.code,
            message: command.message.clone(),
        },
        ErrorKind::Write(WriteFailure::WriteConcernError(concern)) => {
            SourceError::WriteConcernFailure(concern.message.clone())
        }
        _ => SourceError::Other(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_by_kind() {
        let timeout = Error::from(io::Error::new(io::ErrorKind::TimedOut, "deadline"));
        assert!(matches!(source_error(&timeout), SourceError::ConnectTimeout(_)));

        let reset = Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(source_error(&reset), SourceError::SocketRead(_)));

        let pipe = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(matches!(source_error(&pipe), SourceError::SocketWrite(_)));
    }

    #[test]
    fn network_faults_are_transient() {
        let reset = Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(source_error(&reset).is_transient());
    }
}
