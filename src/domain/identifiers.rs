//! Identifiers for the gateway's configured entities
//!
//! Names of tenants, routes and services are validated once at the config
//! boundary; everything downstream works with these newtypes. Credentials
//! never print their contents through `Debug` or `Display`.

use nutype::nutype;
use std::fmt;
use uuid::Uuid;

/// Name of a billing/quota boundary
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Serialize,
        Deserialize,
        AsRef,
        Display
    )
)]
pub struct TenantName(String);

/// Name of a provider+model+policy binding that requests target
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Serialize,
        Deserialize,
        AsRef,
        Display
    )
)]
pub struct RouteName(String);

/// Human-readable label of the calling service, recorded in telemetry
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef, Display)
)]
pub struct ServiceLabel(String);

/// Upstream model identifier as the provider knows it
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 256),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef, Display)
)]
pub struct ModelName(String);

/// Opaque bearer credential identifying a caller
#[nutype(
    validate(not_empty, len_char_max = 512),
    derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef)
)]
pub struct ServiceToken(String);

impl fmt::Debug for ServiceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceToken(***)")
    }
}

/// Resolved provider secret
#[nutype(
    validate(not_empty),
    derive(Clone, PartialEq, Eq, Serialize, Deserialize, AsRef)
)]
pub struct ProviderApiKey(String);

impl fmt::Debug for ProviderApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderApiKey(***)")
    }
}

/// Correlation id for one inbound request
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRef
))]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }

    /// Parse an id supplied by the client, if it is a well-formed UUID
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self::new)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::generate()
    }
}
