use crate::dialog::DialogId;
use crate::transaction::key::TransactionKey;
use crate::transport::SipAddr;

#[derive(Debug, Clone)]
pub enum Error {
    SipMessageError(String),
    TransportLayerError(String, SipAddr),
    TransactionError(String, TransactionKey),
    EndpointError(String),
    DialogError(String, DialogId),
    Error(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::SipMessageError(e) => write!(f, "sip message error: {}", e),
            Error::TransportLayerError(e, addr) => {
                write!(f, "transport layer error: {} ({})", e, addr)
            }
            Error::TransactionError(e, key) => write!(f, "transaction error: {} ({})", e, key),
            Error::EndpointError(e) => write!(f, "endpoint error: {}", e),
            Error::DialogError(e, id) => write!(f, "dialog error: {} ({})", e, id),
            Error::Error(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::SipMessageError(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Error(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::Error(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}
