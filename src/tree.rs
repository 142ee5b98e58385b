//! The `BroadcastTree` collaborator (§2, §4.8): out of scope, referenced
//! only by interface. No teacher counterpart exists — `anoma-network`
//! has no tree-relay fallback — so this follows the same
//! trait-for-external-collaborator shape as `transport.rs`.

use std::time::Duration;

use tracing::{debug, warn};

use crate::{
  peer::PeerSpec,
  wire::{Frame, RelayMessage},
};

/// Supplies eager-peer out-links for tree-based broadcast relay. An
/// external spanning-tree maintenance component the protocol does not
/// build or own.
pub trait BroadcastTree: Send + Sync {
  /// Eager out-links for this node, excluding self. May time out
  /// internally; `tree_refresh`'s caller treats an empty result the
  /// same as a timeout (§5: "treat as no out-links and continue").
  fn eager_out_links(&self, self_peer: &PeerSpec) -> Vec<PeerSpec>;
}

/// Default timeout budget for an out-link query, per §5. Not enforced
/// here directly — whatever `BroadcastTree` impl is injected is
/// expected to honor its own timeout and return what it has.
pub const OUT_LINK_QUERY_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Transitive relay via broadcast-tree eager out-links (§4.8).
///
/// Caches the out-links fetched by the `tree_refresh` timer and uses
/// them to fan out `RELAY_MESSAGE` when a direct dispatch to the
/// message's target fails.
pub struct TreeForwarder {
  out_links: Vec<PeerSpec>,
}

impl TreeForwarder {
  pub fn new() -> Self {
    Self {
      out_links: Vec::new(),
    }
  }

  /// Refreshes the cached out-link set. Invoked by the `tree_refresh`
  /// timer (§4.5).
  pub fn refresh(&mut self, tree: &dyn BroadcastTree, self_peer: &PeerSpec) {
    self.out_links = tree.eager_out_links(self_peer);
    debug!("tree out-links refreshed: {} links", self.out_links.len());
  }

  pub fn out_links(&self) -> &[PeerSpec] {
    &self.out_links
  }

  /// Builds the set of `RELAY_MESSAGE` frames to fan out when direct
  /// dispatch to `target` has failed, per §4.8: forward to each cached
  /// out-link excluding self and the target, with `ttl = relay_ttl`.
  pub fn fanout(
    &self,
    target: &PeerSpec,
    inner: bytes::Bytes,
    relay_ttl: u16,
    self_peer: &PeerSpec,
  ) -> Vec<(PeerSpec, Frame)> {
    if relay_ttl == 0 {
      warn!("relay ttl is 0, dropping relay to {target}");
      return Vec::new();
    }

    self
      .out_links
      .iter()
      .filter(|p| *p != self_peer && *p != target)
      .map(|p| {
        (
          p.clone(),
          Frame::RelayMessage(RelayMessage {
            target: target.clone(),
            inner: inner.clone(),
            ttl: relay_ttl,
          }),
        )
      })
      .collect()
  }
}

impl Default for TreeForwarder {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
pub(crate) mod mock {
  use super::*;

  pub struct MockBroadcastTree {
    links: Vec<PeerSpec>,
  }

  impl MockBroadcastTree {
    pub fn new(links: Vec<PeerSpec>) -> Self {
      Self { links }
    }
  }

  impl BroadcastTree for MockBroadcastTree {
    fn eager_out_links(&self, self_peer: &PeerSpec) -> Vec<PeerSpec> {
      self.links.iter().filter(|p| *p != self_peer).cloned().collect()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{mock::MockBroadcastTree, *};

  fn peer(name: &str) -> PeerSpec {
    PeerSpec::new(name)
  }

  #[test]
  fn refresh_excludes_self() {
    let tree = MockBroadcastTree::new(vec![peer("me"), peer("a"), peer("b")]);
    let mut forwarder = TreeForwarder::new();
    forwarder.refresh(&tree, &peer("me"));
    assert_eq!(forwarder.out_links().len(), 2);
  }

  #[test]
  fn fanout_excludes_self_and_target() {
    let tree = MockBroadcastTree::new(vec![peer("a"), peer("b"), peer("target")]);
    let mut forwarder = TreeForwarder::new();
    forwarder.refresh(&tree, &peer("me"));

    let frames = forwarder.fanout(&peer("target"), bytes::Bytes::new(), 3, &peer("me"));
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|(p, _)| p.name != "target"));
  }

  #[test]
  fn fanout_drops_on_zero_ttl() {
    let tree = MockBroadcastTree::new(vec![peer("a")]);
    let mut forwarder = TreeForwarder::new();
    forwarder.refresh(&tree, &peer("me"));
    assert!(forwarder
      .fanout(&peer("target"), bytes::Bytes::new(), 0, &peer("me"))
      .is_empty());
  }
}
