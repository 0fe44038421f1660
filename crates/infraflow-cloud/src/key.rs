//! Resource identity and normalized lifecycle status

use crate::error::CloudError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies one provisioned entity: provider, resource type and name.
///
/// The textual form is `provider/type/name`. Names may themselves contain
/// `/` (e.g. cloud resource paths); only the first two separators split.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey {
    pub provider: String,
    pub resource_type: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        provider: impl Into<String>,
        resource_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.resource_type, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(provider), Some(resource_type), Some(name))
                if !provider.is_empty() && !resource_type.is_empty() && !name.is_empty() =>
            {
                Ok(Self::new(provider, resource_type, name))
            }
            _ => Err(CloudError::InvalidKey(format!(
                "'{}' (expected provider/type/name)",
                s
            ))),
        }
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = CloudError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}

/// Backend-independent lifecycle status.
///
/// Always trimmed and upper-case, so `"active"` and `" ACTIVE "` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct StatusToken(String);

impl StatusToken {
    pub const CREATING: &'static str = "CREATING";
    pub const ACTIVE: &'static str = "ACTIVE";
    pub const UPDATING: &'static str = "UPDATING";
    pub const DELETING: &'static str = "DELETING";
    pub const DELETED: &'static str = "DELETED";
    pub const FAILED: &'static str = "FAILED";

    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StatusToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StatusToken {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for StatusToken {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<StatusToken> for String {
    fn from(token: StatusToken) -> Self {
        token.0
    }
}

impl PartialEq<str> for StatusToken {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for StatusToken {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
