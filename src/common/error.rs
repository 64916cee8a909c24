use thiserror::Error;

/// 单次探测过程中可能出现的错误。
///
/// 按类别分组：连接层（refused/timeout/DNS）、TLS 层、协议握手层。
/// Checker 根据 [`CheckErrorKind`] 决定落盘的 verdict。
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CheckError {
    /// Try to extract a CheckError from an anyhow::Error, or classify the
    /// underlying error heuristically (e.g. io::Error kinds).
    pub fn classify(err: &anyhow::Error) -> CheckErrorKind {
        if let Some(ce) = err.downcast_ref::<CheckError>() {
            return ce.kind();
        }
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return match io_err.kind() {
                std::io::ErrorKind::ConnectionRefused => CheckErrorKind::ConnectionRefused,
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => CheckErrorKind::ConnectionRefused,
                std::io::ErrorKind::TimedOut => CheckErrorKind::ConnectionTimeout,
                _ => CheckErrorKind::Io,
            };
        }
        CheckErrorKind::Other
    }

    /// Get the kind/category of this error.
    pub fn kind(&self) -> CheckErrorKind {
        match self {
            CheckError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => CheckErrorKind::ConnectionRefused,
                std::io::ErrorKind::TimedOut => CheckErrorKind::ConnectionTimeout,
                _ => CheckErrorKind::Io,
            },
            CheckError::DnsResolutionFailed(_) => CheckErrorKind::DnsResolutionFailed,
            CheckError::ConnectionRefused(_) => CheckErrorKind::ConnectionRefused,
            CheckError::ConnectionTimeout(_) => CheckErrorKind::ConnectionTimeout,
            CheckError::TlsHandshakeFailed(_) => CheckErrorKind::TlsHandshakeFailed,
            CheckError::HandshakeRejected(_) => CheckErrorKind::HandshakeRejected,
            CheckError::Other(_) => CheckErrorKind::Other,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckErrorKind {
    Io,
    DnsResolutionFailed,
    ConnectionRefused,
    ConnectionTimeout,
    TlsHandshakeFailed,
    HandshakeRejected,
    Other,
}

impl CheckErrorKind {
    /// Whether the endpoint actively turned us down, as opposed to an
    /// internal failure on our side.
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            CheckErrorKind::DnsResolutionFailed
                | CheckErrorKind::ConnectionRefused
                | CheckErrorKind::TlsHandshakeFailed
                | CheckErrorKind::HandshakeRejected
                | CheckErrorKind::Io
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CheckErrorKind::Io => "IO",
            CheckErrorKind::DnsResolutionFailed => "DNS_FAILED",
            CheckErrorKind::ConnectionRefused => "CONN_REFUSED",
            CheckErrorKind::ConnectionTimeout => "CONN_TIMEOUT",
            CheckErrorKind::TlsHandshakeFailed => "TLS_FAILED",
            CheckErrorKind::HandshakeRejected => "HANDSHAKE_REJECTED",
            CheckErrorKind::Other => "OTHER",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_io_refused() {
        let err: anyhow::Error =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert_eq!(CheckError::classify(&err), CheckErrorKind::ConnectionRefused);
    }

    #[test]
    fn classify_io_timeout() {
        let err: anyhow::Error =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(CheckError::classify(&err), CheckErrorKind::ConnectionTimeout);
    }

    #[test]
    fn classify_check_error_passthrough() {
        let err: anyhow::Error = CheckError::TlsHandshakeFailed("bad cert".into()).into();
        assert_eq!(CheckError::classify(&err), CheckErrorKind::TlsHandshakeFailed);
    }

    #[test]
    fn classify_unknown_is_other() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(CheckError::classify(&err), CheckErrorKind::Other);
    }

    #[test]
    fn rejection_kinds() {
        assert!(CheckErrorKind::ConnectionRefused.is_rejection());
        assert!(CheckErrorKind::TlsHandshakeFailed.is_rejection());
        assert!(CheckErrorKind::HandshakeRejected.is_rejection());
        assert!(!CheckErrorKind::ConnectionTimeout.is_rejection());
        assert!(!CheckErrorKind::Other.is_rejection());
    }

    #[test]
    fn kind_as_str() {
        assert_eq!(CheckErrorKind::ConnectionTimeout.as_str(), "CONN_TIMEOUT");
        assert_eq!(CheckErrorKind::HandshakeRejected.as_str(), "HANDSHAKE_REJECTED");
    }
}
