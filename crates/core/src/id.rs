//! Identifiers for jobs, job trees and working copy managers.
//!
//! All three are UUIDv7 so log lines and stats sort in scheduling order.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! engine_id {
    ($(#[$doc:meta])* $t:ident) => {
        $(#[$doc])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(Uuid);

        impl $t {
            /// Allocate a fresh id. The scheduler does this when a job is
            /// enqueued, so only tests and adapters need `from_uuid`.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        /// Parses the hyphenated form written by `Display`, e.g. from a log line.
        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s)
                    .map(Self)
                    .map_err(|e| CoreError::invalid_id(format!("{}: {e}", stringify!($t))))
            }
        }
    };
}

engine_id! {
    /// One scheduled job, unique across schedulers.
    JobId
}

engine_id! {
    /// A root job and every child scheduled beneath it. Working copy managers
    /// are bound to one tree.
    JobTreeId
}

engine_id! {
    /// One working copy manager; appears in its errors and log fields.
    ManagerId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_its_own_display_form() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_garbage_with_type_name() {
        let err = "not-a-uuid".parse::<JobTreeId>().unwrap_err();
        match err {
            CoreError::InvalidId(msg) => assert!(msg.starts_with("JobTreeId")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn wraps_an_existing_uuid_without_changing_it() {
        let uuid = Uuid::now_v7();
        let id = JobId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), &uuid);
        assert_eq!(id.to_string(), uuid.to_string());
    }

    #[test]
    fn serializes_as_plain_uuid_string() {
        let id = ManagerId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
