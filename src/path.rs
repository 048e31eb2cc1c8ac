//! Actor paths.
//!
//! An [`ActorPath`] is an [`Address`] followed by a sequence of path elements, written
//! `protocol://system@host:port/user/name`. Paths of remotely deployed actors embed the address of the
//! deploying node as elements, for example
//! `test://remote-sys@localhost:12346/remote/test/RemotingSpec@localhost:12345/user/blub`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{address::Address, error::PathParseError};

/// The element under which user actors live.
pub const USER_GUARDIAN: &str = "user";

/// The element under which actors deployed by other nodes live.
pub const REMOTE_MOUNT: &str = "remote";

/// The address and element sequence naming an actor.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ActorPath {
    address: Address,
    elements: Vec<String>,
}

impl ActorPath {
    /// The root path of a node.
    pub fn root(address: Address) -> Self {
        ActorPath {
            address,
            elements: Vec::new(),
        }
    }

    /// The path of the user guardian of a node, e.g. `test://sys@host:1/user`.
    pub fn user_guardian(address: Address) -> Self {
        ActorPath {
            address,
            elements: vec![USER_GUARDIAN.to_string()],
        }
    }

    /// Creates a path from an address and elements, validating each element.
    pub fn from_elements<I, S>(address: Address, elements: I) -> Result<Self, PathParseError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut path = ActorPath::root(address);
        for element in elements {
            path = path.child(element)?;
        }
        Ok(path)
    }

    /// Parses a full path such as `test://sys@host:1/user/a`.
    pub fn parse(s: &str) -> Result<Self, PathParseError> {
        s.parse()
    }

    /// Returns the path of the child named `name`.
    ///
    /// Returns an error if `name` is empty or contains `/`.
    pub fn child(&self, name: impl Into<String>) -> Result<Self, PathParseError> {
        let name = name.into();
        if !is_valid_element(&name) {
            return Err(PathParseError::InvalidElement {
                path: self.to_string(),
                element: name,
            });
        }
        let mut elements = self.elements.clone();
        elements.push(name);
        Ok(ActorPath {
            address: self.address.clone(),
            elements,
        })
    }

    /// The node address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The path elements below the root.
    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    /// The last element, or `None` for a root path.
    pub fn name(&self) -> Option<&str> {
        self.elements.last().map(String::as_str)
    }

    /// The same elements under a different address.
    pub fn with_address(&self, address: Address) -> Self {
        ActorPath {
            address,
            elements: self.elements.clone(),
        }
    }

    /// Returns the elements following `prefix`, if the path starts with it.
    pub fn elements_after<'a>(&'a self, prefix: &[&str]) -> Option<&'a [String]> {
        if self.elements.len() < prefix.len() {
            return None;
        }
        let (head, tail) = self.elements.split_at(prefix.len());
        head.iter()
            .zip(prefix)
            .all(|(a, b)| a == b)
            .then_some(tail)
    }

    /// Returns `true` if `self` is `other` or one of its ancestors.
    pub fn is_ancestor_of(&self, other: &ActorPath) -> bool {
        self.address == other.address && other.elements.starts_with(&self.elements)
    }
}

pub(crate) fn is_valid_element(element: &str) -> bool {
    !element.is_empty() && !element.contains('/')
}

/// Splits a relative path such as `/user/a/b` into its elements.
pub(crate) fn split_elements(path: &str) -> Option<Vec<String>> {
    let trimmed = path.strip_prefix('/')?;
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    let elements: Vec<String> = trimmed.split('/').map(str::to_string).collect();
    elements
        .iter()
        .all(|element| is_valid_element(element))
        .then_some(elements)
}

impl fmt::Display for ActorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        if self.elements.is_empty() {
            return write!(f, "/");
        }
        for element in &self.elements {
            write!(f, "/{element}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ActorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorPath({self})")
    }
}

impl FromStr for ActorPath {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let scheme_end = s.find("://").map(|i| i + 3).unwrap_or(0);
        let (address, rest) = match s[scheme_end..].find('/') {
            Some(i) => s.split_at(scheme_end + i),
            None => (s, ""),
        };
        let address: Address = address.parse()?;
        let elements = rest
            .split('/')
            .filter(|element| !element.is_empty())
            .map(str::to_string);
        ActorPath::from_elements(address, elements)
    }
}

impl From<ActorPath> for String {
    fn from(path: ActorPath) -> Self {
        path.to_string()
    }
}

impl TryFrom<String> for ActorPath {
    type Error = PathParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Address {
        "test://RemotingSpec@localhost:12345".parse().unwrap()
    }

    #[test]
    fn displays_root_with_trailing_slash() {
        assert_eq!(
            ActorPath::root(addr()).to_string(),
            "test://RemotingSpec@localhost:12345/"
        );
    }

    #[test]
    fn builds_children() {
        let path = ActorPath::root(addr())
            .child("user")
            .unwrap()
            .child("blub")
            .unwrap();
        assert_eq!(path.to_string(), "test://RemotingSpec@localhost:12345/user/blub");
        assert_eq!(path.name(), Some("blub"));
        assert_eq!(path.elements_after(&["user"]), Some(&["blub".to_string()][..]));
        assert_eq!(path.elements_after(&["system"]), None);
    }

    #[test]
    fn rejects_invalid_children() {
        let root = ActorPath::root(addr());
        assert!(root.child("").is_err());
        assert!(root.child("a/b").is_err());
    }

    #[test]
    fn parses_composite_remote_paths() {
        let s = "test://remote-sys@localhost:12346/remote/test/RemotingSpec@localhost:12345/user/blub";
        let path: ActorPath = s.parse().unwrap();
        assert_eq!(path.address().system(), "remote-sys");
        assert_eq!(
            path.elements(),
            ["remote", "test", "RemotingSpec@localhost:12345", "user", "blub"]
        );
        assert_eq!(path.to_string(), s);
    }

    #[test]
    fn parses_root_without_slash() {
        let path: ActorPath = "test://sys@h:1".parse().unwrap();
        assert!(path.elements().is_empty());
    }

    #[test]
    fn ancestry_requires_same_address() {
        let parent: ActorPath = "test://sys@h:1/user".parse().unwrap();
        let child: ActorPath = "test://sys@h:1/user/a".parse().unwrap();
        let foreign: ActorPath = "test://other@h:1/user/a".parse().unwrap();
        assert!(parent.is_ancestor_of(&child));
        assert!(!child.is_ancestor_of(&parent));
        assert!(!parent.is_ancestor_of(&foreign));
    }

    #[test]
    fn splits_relative_paths() {
        assert_eq!(split_elements("/a/b"), Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(split_elements("/"), Some(vec![]));
        assert_eq!(split_elements("a/b"), None);
        assert_eq!(split_elements("/a//b"), None);
    }
}
