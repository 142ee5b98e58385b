//! Peer identity and reserved-slot tagging.

use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};

/// Identity of a peer participating in the overlay.
///
/// Equality and hashing are by [`PeerSpec::name`] alone: two specs naming
/// the same peer are the same peer even if their known `endpoints` differ,
/// the way the teacher's `AddressablePeer` compares only on `peer_id` and
/// lets `addresses` accumulate independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSpec {
  /// Unique identifier for this peer. Opaque to this crate; the
  /// `PeerConnections` collaborator is the one that knows how to turn a
  /// name into an actual link.
  pub name: String,

  /// Whatever endpoint information the transport needs to dial this peer.
  /// Never interpreted here.
  pub endpoints: HashSet<String>,
}

impl PeerSpec {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      endpoints: HashSet::new(),
    }
  }

  pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
    self.endpoints.insert(endpoint.into());
    self
  }
}

impl Eq for PeerSpec {}
impl PartialEq for PeerSpec {
  fn eq(&self, other: &Self) -> bool {
    self.name == other.name
  }
}

impl std::hash::Hash for PeerSpec {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.name.hash(state);
  }
}

impl From<&str> for PeerSpec {
  fn from(name: &str) -> Self {
    PeerSpec::new(name)
  }
}

impl fmt::Display for PeerSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.name)
  }
}

/// Symbolic label for a reserved active-view slot, e.g. `storage`, `router`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(pub String);

impl Tag {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }
}

impl fmt::Display for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<&str> for Tag {
  fn from(name: &str) -> Self {
    Tag::new(name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn equality_is_by_name_only() {
    let a = PeerSpec::new("alice").with_endpoint("10.0.0.1:1");
    let b = PeerSpec::new("alice").with_endpoint("10.0.0.2:2");
    assert_eq!(a, b);
  }

  #[test]
  fn distinct_names_are_distinct() {
    assert_ne!(PeerSpec::new("alice"), PeerSpec::new("bob"));
  }
}
