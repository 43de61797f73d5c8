//! Queue topology: names derived only from domain and instance identity.
//!
//! | Role          | Name              |
//! |---------------|-------------------|
//! | requests-in   | `D`               |
//! | responses-in  | `D-I`             |
//! | responses-out | `D-I-completed`   |

/// Transport header carrying a computed re-route address. Stripped before final delivery.
pub const DYNAMIC_DESTINATION_HEADER: &str = "dynamic-destination";

const RESPONSES_OUT_SUFFIX: &str = "completed";

/// Shared, competing-consumer request queue of a domain.
#[must_use]
pub fn requests_in(domain: &str) -> String {
    domain.to_string()
}

/// Private response inbox of one instance.
#[must_use]
pub fn responses_in(domain: &str, instance_id: &str) -> String {
    format!("{domain}-{instance_id}")
}

/// Private response staging queue of one instance.
#[must_use]
pub fn responses_out(domain: &str, instance_id: &str) -> String {
    format!("{domain}-{instance_id}-{RESPONSES_OUT_SUFFIX}")
}

/// The three queues an instance listens on or publishes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub requests_in: String,
    pub responses_in: String,
    pub responses_out: String,
}

impl QueueTopology {
    #[must_use]
    pub fn for_instance(domain: &str, instance_id: &str) -> Self {
        Self {
            requests_in: requests_in(domain),
            responses_in: responses_in(domain, instance_id),
            responses_out: responses_out(domain, instance_id),
        }
    }
}
