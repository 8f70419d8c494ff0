/// Result alias that carries the custom [`BeatSyncError`] type.
pub type Result<T> = std::result::Result<T, BeatSyncError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BeatSyncError {
    /// Tempo must be a positive, finite BPM value producing a finite period.
    #[error("tempo must be a positive, finite BPM value (got {0})")]
    InvalidTempo(f64),
    /// Phases live in the 4-step cycle `0..=3`.
    #[error("phase {0} is outside the 4-step cycle")]
    InvalidPhase(u8),
    /// The attack portion of a tick must be strictly between 0 and 1.
    #[error("attack fraction must lie strictly between 0 and 1 (got {0})")]
    InvalidAttackFraction(f64),
    /// Logical time must stay finite.
    #[error("scheduler time must be finite (got {0})")]
    InvalidTime(f64),
    /// The same observer instance was registered twice.
    #[error("observer is already subscribed as #{0}")]
    AlreadySubscribed(u64),
    /// The scheduler was used after [`shutdown`](crate::BeatScheduler::shutdown).
    #[error("beat scheduler has been shut down")]
    ShutDown,
    /// Time was advanced from inside an observer callback.
    #[error("cannot advance the beat scheduler while it is delivering a tick")]
    ReentrantAdvance,
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around JSON (de)serialisation errors.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl BeatSyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for BeatSyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BeatSyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
