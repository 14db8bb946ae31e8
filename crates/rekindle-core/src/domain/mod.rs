// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Core domain types: function identity, status, epochs and stored records.
//!
//! A function invocation is identified by a [`FunctionId`], the pair of a
//! logical function type and a business instance key. Every persisted row
//! carries an [`Epoch`] used as a fencing token: a write is only accepted by
//! the store when the caller's expected epoch matches the stored one.
//!
//! ```text
//!                 ┌──────────────┐
//!   create ──────►│  Executing   │◄──────────────┐
//!                 └──────────────┘               │ become leader (epoch + 1)
//!                  │     │      │                │
//!          succeed │     │ fail │ postpone       │
//!                  ▼     ▼      ▼                │
//!          ┌──────────┐ ┌────────┐ ┌───────────┐ │
//!          │Succeeded │ │ Failed │ │ Postponed │─┤
//!          └──────────┘ └────────┘ └───────────┘ │
//!                           └────────────────────┘
//! ```

mod outcome;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use outcome::{IntoOutcome, Metadata, Outcome};

/// Fencing token of a function row. Incremented by exactly one on every leadership change.
pub type Epoch = i64;

/// Heartbeat counter bumped while a body executes.
pub type SignOfLife = i64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&$name> for $name {
            fn from(value: &$name) -> Self {
                value.clone()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Logical function name, shared by all instances of one registered body.
    FunctionTypeId
);

string_id!(
    /// Business key of one invocation within a function type.
    FunctionInstanceId
);

/// Composite primary key of a stored function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionId {
    /// Function type.
    pub type_id: FunctionTypeId,
    /// Function instance.
    pub instance_id: FunctionInstanceId,
}

impl FunctionId {
    /// Create a function id from its two parts.
    pub fn new(
        type_id: impl Into<FunctionTypeId>,
        instance_id: impl Into<FunctionInstanceId>,
    ) -> Self {
        Self {
            type_id: type_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_id, self.instance_id)
    }
}

/// Lifecycle status of a stored function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// A leader is (or was, before crashing) running the body.
    Executing,
    /// The body completed successfully.
    Succeeded,
    /// The body failed.
    Failed,
    /// The body asked to be resumed at a later time.
    Postponed,
}

impl Status {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Executing => "executing",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Postponed => "postponed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "executing" => Ok(Status::Executing),
            "succeeded" => Ok(Status::Succeeded),
            "failed" => Ok(Status::Failed),
            "postponed" => Ok(Status::Postponed),
            other => Err(Error::storage(
                "decode_status",
                format!("unknown status '{other}'"),
            )),
        }
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<(String, String)> {
    let json = serde_json::to_string(value)?;
    Ok((json, std::any::type_name::<T>().to_string()))
}

/// Serialized function parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredParameter {
    /// JSON payload.
    pub json: String,
    /// Type tag of the serialized value.
    pub type_name: String,
}

impl StoredParameter {
    /// Serialize a parameter value.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        let (json, type_name) = encode_json(value)?;
        Ok(Self { json, type_name })
    }

    /// Deserialize the parameter value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.json)?)
    }
}

/// Serialized function result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResult {
    /// JSON payload.
    pub json: String,
    /// Type tag of the serialized value.
    pub type_name: String,
}

impl StoredResult {
    /// Serialize a result value.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        let (json, type_name) = encode_json(value)?;
        Ok(Self { json, type_name })
    }

    /// Deserialize the result value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.json)?)
    }
}

/// Serialized scrapbook. `json` stays empty until the first save or persisted outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredScrapbook {
    /// JSON payload, if any state has been persisted.
    pub json: Option<String>,
    /// Type tag of the scrapbook.
    pub type_name: String,
}

/// Failure recorded for a function whose body did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFailure {
    /// Kind of failure, usually the error's type name.
    pub kind: String,
    /// Rendered error message.
    pub message: String,
}

impl StoredFailure {
    /// Create a failure record.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Record an error value, tagging it with its type name.
    pub fn from_error<E: fmt::Display + ?Sized>(error: &E) -> Self {
        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: format!("{error:#}"),
        }
    }

    /// Record a panic payload caught at the execution boundary.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "function body panicked".to_string()
        };
        Self {
            kind: "panic".to_string(),
            message,
        }
    }
}

impl fmt::Display for StoredFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

/// Persisted function row, as returned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFunction {
    /// Primary key.
    pub function_id: FunctionId,
    /// Serialized parameter.
    pub parameter: StoredParameter,
    /// Serialized scrapbook, present for functions registered with one.
    pub scrapbook: Option<StoredScrapbook>,
    /// Current status.
    pub status: Status,
    /// Result, once succeeded.
    pub result: Option<StoredResult>,
    /// Failure, once failed.
    pub failure: Option<StoredFailure>,
    /// Due time, while postponed.
    pub postponed_until: Option<DateTime<Utc>>,
    /// Current fencing epoch.
    pub epoch: Epoch,
    /// Last heartbeat value.
    pub sign_of_life: SignOfLife,
}

/// Projection returned by status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFunctionStatus {
    /// Instance key within the queried function type.
    pub instance_id: FunctionInstanceId,
    /// Current fencing epoch.
    pub epoch: Epoch,
    /// Last heartbeat value.
    pub sign_of_life: SignOfLife,
    /// Current status.
    pub status: Status,
    /// Due time, while postponed.
    pub postponed_until: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        sku: String,
    }

    #[test]
    fn test_function_id_display() {
        let id = FunctionId::new("orders", "order-42");
        assert_eq!(id.to_string(), "orders:order-42");
        assert_eq!(id.type_id.as_str(), "orders");
        assert_eq!(id.instance_id.as_str(), "order-42");
    }

    #[test]
    fn test_status_round_trips_through_storage_string() {
        for status in [
            Status::Executing,
            Status::Succeeded,
            Status::Failed,
            Status::Postponed,
        ] {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!("sleeping".parse::<Status>().is_err());
    }

    #[test]
    fn test_stored_parameter_carries_type_tag() {
        let order = Order {
            id: 7,
            sku: "A-1".to_string(),
        };
        let stored = StoredParameter::encode(&order).unwrap();
        assert!(stored.type_name.ends_with("Order"));
        assert_eq!(stored.decode::<Order>().unwrap(), order);
    }

    #[test]
    fn test_stored_result_decode_type_mismatch() {
        let stored = StoredResult::encode(&"text").unwrap();
        let err = stored.decode::<u64>().unwrap_err();
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");
    }

    #[test]
    fn test_failure_from_error() {
        let err = std::io::Error::other("disk full");
        let failure = StoredFailure::from_error(&err);
        assert!(failure.kind.ends_with("Error"));
        assert_eq!(failure.message, "disk full");
    }

    #[test]
    fn test_failure_from_panic_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let failure = StoredFailure::from_panic(payload.as_ref());
        assert_eq!(failure.kind, "panic");
        assert_eq!(failure.message, "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(StoredFailure::from_panic(payload.as_ref()).message, "owned boom");
    }
}
