// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Validated linux network interface names.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// A string which has been checked to be a legal linux network interface name.
///
/// Legal names are 1 to 15 bytes of alphanumeric ASCII, `.`, `-` and `_` (the kernel reserves a
/// 16th byte for the terminating NUL).
#[repr(transparent)]
#[derive(Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct InterfaceName(String);

/// Errors which may occur when mapping a general `String` into an [`InterfaceName`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IllegalInterfaceName {
    /// Names must have at least one character.
    #[error("interface name must be at least one character")]
    Empty,
    /// `.` and `..` are reserved.
    #[error("name must not be . or ..")]
    OnlyDots(String),
    /// Longer than [`InterfaceName::MAX_LEN`] bytes.
    #[error("interface name {0} is too long")]
    TooLong(String),
    /// Contains a character outside of alphanumeric ASCII and `.-_`.
    #[error(
        "interface name {0} contains illegal characters (only alphanumeric ASCII and .-_ are permitted)"
    )]
    IllegalCharacters(String),
}

impl InterfaceName {
    /// The maximum legal length of a linux network interface name, not counting the trailing NUL.
    pub const MAX_LEN: usize = 15;

    /// Wrap one of the fixed names this crate manages.
    ///
    /// Only meant for compile time constants; a unit test checks every such constant is legal.
    pub(crate) fn fixed(name: &'static str) -> Self {
        debug_assert!(Self::try_from(name).is_ok(), "illegal fixed name {name}");
        InterfaceName(name.to_string())
    }

    /// View the name as a `&str`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for InterfaceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for InterfaceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for InterfaceName {
    type Error = IllegalInterfaceName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        const LEGAL_PUNCT: [char; 3] = ['.', '-', '_'];
        if value.is_empty() {
            return Err(IllegalInterfaceName::Empty);
        }
        if value == "." || value == ".." {
            return Err(IllegalInterfaceName::OnlyDots(value));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || LEGAL_PUNCT.contains(&c))
        {
            return Err(IllegalInterfaceName::IllegalCharacters(value));
        }
        if value.len() > InterfaceName::MAX_LEN {
            return Err(IllegalInterfaceName::TooLong(value));
        }
        Ok(InterfaceName(value))
    }
}

impl TryFrom<&str> for InterfaceName {
    type Error = IllegalInterfaceName;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl From<InterfaceName> for String {
    fn from(value: InterfaceName) -> Self {
        value.0
    }
}

impl PartialEq<str> for InterfaceName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for InterfaceName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
