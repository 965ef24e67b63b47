//! Error kinds shared by the store, the runner and the user-facing actions.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    #[error("invalid schedule time '{time}': {reason}")]
    InvalidScheduleTime { time: String, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl Error {
    pub fn zone_not_found(id: u32) -> Self {
        Self::NotFound {
            kind: "zone",
            id: u64::from(id),
        }
    }

    pub fn schedule_not_found(id: u32) -> Self {
        Self::NotFound {
            kind: "schedule",
            id: u64::from(id),
        }
    }

    pub fn invalid_time(time: &str, reason: impl Into<String>) -> Self {
        Self::InvalidScheduleTime {
            time: time.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_kind_and_id() {
        assert_eq!(Error::zone_not_found(7).to_string(), "zone 7 not found");
        assert_eq!(
            Error::schedule_not_found(2).to_string(),
            "schedule 2 not found"
        );
    }

    #[test]
    fn invalid_time_message_carries_input() {
        let msg = Error::invalid_time("25:00 PM", "hour out of range").to_string();
        assert!(msg.contains("25:00 PM"), "got: {msg}");
        assert!(msg.contains("hour out of range"), "got: {msg}");
    }
}
