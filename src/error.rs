use crate::{catalog::Question, epc::Epc};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{device} unavailable: {reason}")]
    DeviceUnavailable {
        device: &'static str,
        reason: String,
    },

    #[error("{device} lost: {reason}")]
    DeviceLost {
        device: &'static str,
        reason: String,
    },

    #[error("frame stream lost sync for {0} bytes")]
    MalformedFrame(usize),

    #[error("tag {0} is not in the answer catalog")]
    UnregisteredTag(Epc),

    #[error("question {0} is not covered by the presented tags")]
    IncompleteAnswers(Question),

    #[error("content quota exhausted")]
    QuotaExceeded,

    #[error("content service rejected the request (HTTP {0})")]
    Auth(u16),

    #[error("content request failed: {0}")]
    Request(String),

    #[error("printer failure: {0}")]
    Printer(String),

    #[error("record upload failed: {0}")]
    Upload(String),

    #[error("inventory deadline passed")]
    Timeout,

    #[error("inventory cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
