//! Error kinds surfaced to callers of the peer-service API.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
  /// Returned by `leave`, `sync_join`, `on_up`, `on_down` and
  /// `update_members`: deliberately unimplemented, per the source's
  /// treatment of `leave`.
  #[error("operation not implemented")]
  NotImplemented,

  /// `reserve` was called but all active-view slots already carry a
  /// reservation.
  #[error("no available active-view slots for reservation")]
  NoAvailableSlots,

  /// `forward_message` (or `send_message`) targeted a peer currently
  /// listed as partitioned from this node.
  #[error("peer is partitioned")]
  Partitioned,

  /// The transport has no connection to this peer and none is pending.
  #[error("peer is disconnected")]
  Disconnected,

  /// The transport has a connection attempt in flight but it has not
  /// completed yet.
  #[error("peer is not yet connected")]
  NotYetConnected,

  /// Init-time error: more reservation tags were configured than
  /// `max_active_size` allows. Fatal — the caller should not start the
  /// Coordinator.
  #[error(
    "{requested} reservations exceed max_active_size ({max_active_size})"
  )]
  ReservationLimitExceeded {
    requested: usize,
    max_active_size: usize,
  },

  /// The Coordinator actor task is gone (its receiver was dropped).
  #[error("coordinator is no longer running")]
  CoordinatorGone,
}
