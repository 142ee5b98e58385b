use std::time::Duration;

use crate::peer::Tag;

/// Peer-service wide configuration, read once when the [`crate::Coordinator`]
/// is constructed.
#[derive(Debug, Clone)]
pub struct Config {
  /// Active-view cap. `|ActiveView|` never exceeds this, counting unfilled
  /// reserved slots as occupying capacity.
  pub max_active_size: usize,

  /// Random-promotion target: the active view is considered starved (and
  /// eligible for promotion) below this size.
  pub min_active_size: usize,

  /// Passive-view cap.
  pub max_passive_size: usize,

  /// Active Random Walk Length: TTL for FORWARD_JOIN.
  pub arwl: u16,

  /// Passive Random Walk Length: TTL threshold inside FORWARD_JOIN below
  /// which the joiner is also deposited into the passive view.
  pub prwl: u16,

  /// Local tag advertised in JOIN/NEIGHBOR frames, if any.
  pub tag: Option<Tag>,

  /// Tags to reserve at startup. Must not exceed `max_active_size`.
  pub reservations: Vec<Tag>,

  /// Enable the random-promotion timer.
  pub random_promotion: bool,

  /// Passive-view shuffle period.
  pub passive_view_shuffle_period: Duration,

  /// Random-promotion timer period.
  pub random_promotion_period: Duration,

  /// Broadcast-tree out-link refresh period.
  pub tree_refresh_period: Duration,

  /// TTL used for tree-forwarded relays.
  pub relay_ttl: u16,

  /// Enable the transitive (tree-forward) relay fallback.
  pub broadcast: bool,

  /// Directory holding the persisted epoch file, if any. `None` keeps the
  /// epoch in memory only (starts at 0 every restart) — useful for tests.
  pub data_dir: Option<std::path::PathBuf>,

  /// If `false`, inbound `forward_message` frames bypass the Coordinator's
  /// view-consulting fallback entirely and are handed to the calling
  /// application directly. This crate treats that delivery path as
  /// out-of-scope and only records the flag (see `forward_message`).
  pub disable_fast_receive: bool,

  /// `k_active` sample size used when composing an exchange.
  pub shuffle_active_sample: usize,

  /// `k_passive` sample size used when composing an exchange.
  pub shuffle_passive_sample: usize,
}

impl Config {
  /// `true` if the active view (counting unfilled reserved slots) has
  /// reached `max_active_size`.
  pub fn is_active_full(&self, active_len: usize, unfilled_reserved: usize) -> bool {
    active_len + unfilled_reserved >= self.max_active_size
  }

  /// `true` if the active view (counting unfilled reserved slots) is below
  /// `min_active_size`.
  pub fn is_active_starved(&self, active_len: usize, unfilled_reserved: usize) -> bool {
    active_len + unfilled_reserved < self.min_active_size
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      max_active_size: 6,
      min_active_size: 3,
      max_passive_size: 30,
      arwl: 6,
      prwl: 6,
      tag: None,
      reservations: Vec::new(),
      random_promotion: true,
      passive_view_shuffle_period: Duration::from_millis(10_000),
      random_promotion_period: Duration::from_millis(5_000),
      tree_refresh_period: Duration::from_millis(1_000),
      relay_ttl: 3,
      broadcast: false,
      data_dir: None,
      disable_fast_receive: true,
      shuffle_active_sample: 3,
      shuffle_passive_sample: 4,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_spec() {
    let cfg = Config::default();
    assert_eq!(cfg.max_active_size, 6);
    assert_eq!(cfg.min_active_size, 3);
    assert_eq!(cfg.max_passive_size, 30);
    assert_eq!(cfg.arwl, 6);
    assert_eq!(cfg.prwl, 6);
  }

  #[test]
  fn active_full_counts_unfilled_reserved_slots() {
    let cfg = Config {
      max_active_size: 4,
      ..Config::default()
    };
    assert!(cfg.is_active_full(3, 1));
    assert!(!cfg.is_active_full(2, 1));
  }
}
