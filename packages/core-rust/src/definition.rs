//! Service definitions (provider side) and service addresses (caller side).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Version requested by a caller that means "the newest registered version".
pub const LATEST_VERSION: i32 = 0;

/// Version assigned to a definition registered without a positive version.
pub const DEFAULT_VERSION: i32 = 1;

/// A service exposed by a provider under an alias and version.
///
/// `service_class_name` is the implementation locator: the key under which
/// the provider registered a factory for the implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub service_alias: String,
    pub service_class_name: String,
    pub service_version: i32,
}

impl ServiceDefinition {
    /// Creates a definition, normalizing a non-positive version to [`DEFAULT_VERSION`].
    #[must_use]
    pub fn new(
        service_alias: impl Into<String>,
        service_class_name: impl Into<String>,
        service_version: i32,
    ) -> Self {
        Self {
            service_alias: service_alias.into(),
            service_class_name: service_class_name.into(),
            service_version: normalize_version(service_version),
        }
    }

    /// The version this definition is stored under in a registry.
    #[must_use]
    pub fn effective_version(&self) -> i32 {
        normalize_version(self.service_version)
    }
}

impl fmt::Display for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SERVICE DEF {{ {} : v{} }}",
            self.service_alias, self.service_version
        )
    }
}

/// Normalizes a registration version: `0` and negatives become [`DEFAULT_VERSION`].
#[must_use]
pub fn normalize_version(version: i32) -> i32 {
    if version > 0 {
        version
    } else {
        DEFAULT_VERSION
    }
}

/// Caller-facing target descriptor.
///
/// A `service_version` of [`LATEST_VERSION`] asks the provider for its newest
/// registered version of the alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAddress {
    pub service_domain_name: String,
    pub service_alias: String,
    #[serde(default)]
    pub service_version: i32,
}

impl ServiceAddress {
    #[must_use]
    pub fn new(
        service_domain_name: impl Into<String>,
        service_alias: impl Into<String>,
        service_version: i32,
    ) -> Self {
        Self {
            service_domain_name: service_domain_name.into(),
            service_alias: service_alias.into(),
            service_version,
        }
    }

    /// Address of the newest version of `service_alias` in `service_domain_name`.
    #[must_use]
    pub fn latest(service_domain_name: impl Into<String>, service_alias: impl Into<String>) -> Self {
        Self::new(service_domain_name, service_alias, LATEST_VERSION)
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.service_version == LATEST_VERSION {
            write!(f, "{}.{}@latest", self.service_domain_name, self.service_alias)
        } else {
            write!(
                f,
                "{}.{}@v{}",
                self.service_domain_name, self.service_alias, self.service_version
            )
        }
    }
}
