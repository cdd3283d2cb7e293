//! ---
//! swm_section: "03-persistence-logging"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Lifecycle status shared by updates and operations."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an update or one of its operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Known but not yet started.
    Pending,
    /// Started and awaiting completion.
    Started,
    /// Completed successfully.
    Finished,
    /// Cancelled before completion.
    Aborted,
    /// Completed with a failure.
    Error,
}

impl Status {
    /// Stored column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Started => "STARTED",
            Status::Finished => "FINISHED",
            Status::Aborted => "ABORTED",
            Status::Error => "ERROR",
        }
    }

    /// Whether no further transition is expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Finished | Status::Aborted | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a stored status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Status::Pending),
            "STARTED" => Ok(Status::Started),
            "FINISHED" => Ok(Status::Finished),
            "ABORTED" => Ok(Status::Aborted),
            "ERROR" => Ok(Status::Error),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

impl ToSql for Status {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Status {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|err| FromSqlError::Other(Box::new(err)))
    }
}
