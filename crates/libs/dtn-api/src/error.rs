//! Error taxonomy for the API adapter (§4.9, §7), matching the per-crate
//! `thiserror` enum convention.

use dtn_core::DtnError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] rmp_serde::encode::Error),
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("message exceeds the maximum frame size")]
    FrameTooLarge,
    #[error("session is in POLL state; only cancel_poll is accepted")]
    InPoll,
    #[error("session closed")]
    Closed,
    #[error("the daemon did not reply before the call was dropped")]
    NoReply,
}

impl From<ApiError> for DtnError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Io(e) => DtnError::NetIo(e.to_string()),
            ApiError::Codec(e) => DtnError::Protocol(e.to_string()),
            ApiError::Decode(e) => DtnError::Protocol(e.to_string()),
            ApiError::FrameTooLarge => DtnError::Protocol("frame too large".into()),
            ApiError::InPoll => DtnError::PolicyReject("session in POLL state".into()),
            ApiError::Closed => DtnError::NetIo("session closed".into()),
            ApiError::NoReply => DtnError::Protocol("daemon did not reply".into()),
        }
    }
}

/// Numeric status codes returned on the wire, per §6's enumerated set.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    Einval = 1,
    Ecodec = 2,
    Ecomm = 3,
    Econnect = 4,
    Etimeout = 5,
    Esize = 6,
    Enotfound = 7,
    Einternal = 8,
    Einpoll = 9,
    Ebusy = 10,
}

impl StatusCode {
    pub fn from_api_error(err: &ApiError) -> Self {
        match err {
            ApiError::Io(_) => StatusCode::Ecomm,
            ApiError::Codec(_) | ApiError::Decode(_) => StatusCode::Ecodec,
            ApiError::FrameTooLarge => StatusCode::Esize,
            ApiError::InPoll => StatusCode::Einpoll,
            ApiError::Closed => StatusCode::Econnect,
            ApiError::NoReply => StatusCode::Einternal,
        }
    }
}
