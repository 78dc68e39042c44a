//! Subscription keys.
//!
//! A key is a flat string built from the optional run id, thread id, and event
//! type in a fixed join order, so equal inputs always produce an identical
//! key. The empty combination is the wildcard `"all"`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::EventType;
use crate::ids::{RunId, ThreadId};

/// Wildcard key matching every event.
pub const WILDCARD: &str = "all";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    /// Build a key from the given components. Join order is fixed:
    /// `run:<id>|thread:<id>|type:<t>`.
    pub fn compose(
        run_id: Option<&RunId>,
        thread_id: Option<&ThreadId>,
        event_type: Option<&EventType>,
    ) -> Self {
        let mut parts = Vec::with_capacity(3);
        if let Some(run) = run_id {
            parts.push(format!("run:{run}"));
        }
        if let Some(thread) = thread_id {
            parts.push(format!("thread:{thread}"));
        }
        if let Some(t) = event_type {
            parts.push(format!("type:{t}"));
        }
        if parts.is_empty() {
            Self::all()
        } else {
            Self(parts.join("|"))
        }
    }

    /// The wildcard key.
    pub fn all() -> Self {
        Self(WILDCARD.to_owned())
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
