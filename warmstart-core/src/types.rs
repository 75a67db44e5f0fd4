// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated identifiers.
//!
//! Following the "Newtype" pattern in Rust to ensure valid state by construction.
//! All types validate their invariants at creation time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Maximum length of an image reference.
const MAX_IMAGE_NAME_LEN: usize = 255;
/// Maximum length of an external container identifier.
const MAX_CONTAINER_ID_LEN: usize = 128;

/// Process-unique VM identifier, assigned monotonically by the coordinator.
///
/// The control plane and the resource pool treat the decimal rendering as an
/// opaque key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(u64);

impl VmId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for VmId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Validated container image reference (e.g. `docker.io/library/nginx:1.17-alpine`).
/// Must be non-empty, at most 255 chars, and contain no whitespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageName(String);

impl ImageName {
    /// Create a new ImageName with validation.
    pub fn new(name: impl Into<String>) -> Result<Self, HardValidationError> {
        let name = name.into();

        if name.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "image",
                value: name,
                reason: "Image name cannot be empty".to_string(),
            });
        }

        if name.len() > MAX_IMAGE_NAME_LEN {
            return Err(HardValidationError::InvalidFieldValue {
                field: "image",
                value: name.clone(),
                reason: format!(
                    "Image name too long: {} chars (max {})",
                    name.len(),
                    MAX_IMAGE_NAME_LEN
                ),
            });
        }

        if name.chars().any(char::is_whitespace) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "image",
                value: name,
                reason: "Image name must not contain whitespace".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ImageName {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ImageName> for String {
    fn from(name: ImageName) -> Self {
        name.0
    }
}

/// Validated external container identifier, as handed out by the CRI front end.
/// Must be non-empty, at most 128 chars, alphanumeric with `-`, `_` or `.`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Create a new ContainerId with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "container_id",
                value: id,
                reason: "Container ID cannot be empty".to_string(),
            });
        }

        if id.len() > MAX_CONTAINER_ID_LEN {
            return Err(HardValidationError::InvalidFieldValue {
                field: "container_id",
                value: id.clone(),
                reason: format!(
                    "Container ID too long: {} chars (max {})",
                    id.len(),
                    MAX_CONTAINER_ID_LEN
                ),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "container_id",
                value: id,
                reason: "Container ID must contain only alphanumeric characters, '-', '_' and '.'"
                    .to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}
