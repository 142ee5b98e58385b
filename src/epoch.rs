//! Restart epoch persistence and the disconnect-id ordering scheme.

use std::{
  cmp::Ordering,
  fs,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Non-negative integer identifying a "lifetime" of the local node.
/// Strictly increases across restarts.
pub type Epoch = u64;

/// Ordered pair `(epoch, counter)`. Counter increments per disconnect
/// emitted to a given peer within a given local epoch. Ordered
/// lexicographically: epoch dominates, counter breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DisconnectId {
  pub epoch: Epoch,
  pub counter: u64,
}

impl DisconnectId {
  pub fn new(epoch: Epoch, counter: u64) -> Self {
    Self { epoch, counter }
  }
}

impl std::fmt::Display for DisconnectId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "({}, {})", self.epoch, self.counter)
  }
}

/// An identifier that may arrive either as a bare epoch (a `JOIN`'s
/// `peer_epoch`) or as a full `(epoch, counter)` pair (a `NEIGHBOR` or
/// `DISCONNECT`'s id). [`crate::message_id::is_addable`] compares either
/// shape against a stored `DisconnectId`.
#[derive(Debug, Clone, Copy)]
pub enum IncomingId {
  Epoch(Epoch),
  Full(DisconnectId),
}

impl From<Epoch> for IncomingId {
  fn from(epoch: Epoch) -> Self {
    IncomingId::Epoch(epoch)
  }
}

impl From<DisconnectId> for IncomingId {
  fn from(id: DisconnectId) -> Self {
    IncomingId::Full(id)
  }
}

impl IncomingId {
  /// Compares this incoming id against a previously stored `DisconnectId`.
  /// A bare epoch only compares epochs; a full id compares the whole pair.
  pub fn at_least(&self, stored: &DisconnectId) -> bool {
    match self {
      IncomingId::Epoch(epoch) => *epoch >= stored.epoch,
      IncomingId::Full(id) => id.cmp(stored) != Ordering::Less,
    }
  }
}

/// The external disk key/value this crate persists the local epoch
/// through. Referenced only by interface — the default `FileEpochStorage`
/// is a minimal, crate-local stand-in, not a production KV.
pub trait EpochPersistence: Send + Sync {
  fn read(&self) -> Option<Epoch>;
  fn write(&self, epoch: Epoch);
}

/// Plain-file backed persistence at `<data_dir>/peer_service/cluster_state`.
pub struct FileEpochStorage {
  path: PathBuf,
}

impl FileEpochStorage {
  pub fn new(data_dir: impl AsRef<Path>) -> Self {
    Self {
      path: data_dir.as_ref().join("peer_service").join("cluster_state"),
    }
  }
}

impl EpochPersistence for FileEpochStorage {
  fn read(&self) -> Option<Epoch> {
    match fs::read_to_string(&self.path) {
      Ok(contents) => contents.trim().parse().ok(),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
      Err(err) => {
        warn!("failed to read epoch file {:?}: {err}", self.path);
        None
      }
    }
  }

  fn write(&self, epoch: Epoch) {
    if let Some(parent) = self.path.parent() {
      if let Err(err) = fs::create_dir_all(parent) {
        warn!("failed to create epoch directory {parent:?}: {err}");
        return;
      }
    }
    if let Err(err) = fs::write(&self.path, epoch.to_string()) {
      warn!("failed to persist epoch to {:?}: {err}", self.path);
    }
  }
}

/// In-memory persistence, used when no `data_dir` is configured (and in
/// tests): the epoch resets to 0 every restart.
#[derive(Default)]
pub struct InMemoryEpochStorage {
  value: parking_lot::Mutex<Option<Epoch>>,
}

impl EpochPersistence for InMemoryEpochStorage {
  fn read(&self) -> Option<Epoch> {
    *self.value.lock()
  }

  fn write(&self, epoch: Epoch) {
    *self.value.lock() = Some(epoch);
  }
}

/// Durable monotonic restart counter.
///
/// On construction, reads the last persisted epoch (or starts at 0),
/// increments it by one, and rewrites it. Disk write failures are
/// non-fatal: they're logged and the in-memory epoch still advances.
pub struct EpochStore {
  storage: Box<dyn EpochPersistence>,
  epoch: Epoch,
}

impl EpochStore {
  pub fn open(storage: Box<dyn EpochPersistence>) -> Self {
    let previous = storage.read().unwrap_or(0);
    let epoch = previous + 1;
    storage.write(epoch);
    debug!("epoch store opened at {epoch} (previous {previous})");
    Self { storage, epoch }
  }

  pub fn from_data_dir(data_dir: Option<&Path>) -> Self {
    match data_dir {
      Some(dir) => Self::open(Box::new(FileEpochStorage::new(dir))),
      None => Self::open(Box::new(InMemoryEpochStorage::default())),
    }
  }

  pub fn current(&self) -> Epoch {
    self.epoch
  }

  /// Re-persists the current epoch. Invoked after every active-view
  /// mutation per §4.3 step 6. Non-fatal on failure.
  pub fn persist(&self) {
    self.storage.write(self.epoch);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn disconnect_id_orders_lexicographically() {
    assert!(DisconnectId::new(3, 4) < DisconnectId::new(3, 5));
    assert!(DisconnectId::new(2, 100) < DisconnectId::new(3, 0));
    assert_eq!(DisconnectId::new(1, 1), DisconnectId::new(1, 1));
  }

  #[test]
  fn bare_epoch_compares_only_epoch() {
    let stored = DisconnectId::new(5, 10);
    assert!(IncomingId::Epoch(5).at_least(&stored));
    assert!(IncomingId::Epoch(6).at_least(&stored));
    assert!(!IncomingId::Epoch(4).at_least(&stored));
  }

  #[test]
  fn full_id_compares_pair() {
    let stored = DisconnectId::new(5, 10);
    assert!(IncomingId::Full(DisconnectId::new(5, 10)).at_least(&stored));
    assert!(IncomingId::Full(DisconnectId::new(5, 11)).at_least(&stored));
    assert!(!IncomingId::Full(DisconnectId::new(5, 9)).at_least(&stored));
    assert!(!IncomingId::Full(DisconnectId::new(4, 999)).at_least(&stored));
  }

  #[test]
  fn epoch_increments_across_opens() {
    let storage = std::sync::Arc::new(InMemoryEpochStorage::default());

    struct Shared(std::sync::Arc<InMemoryEpochStorage>);
    impl EpochPersistence for Shared {
      fn read(&self) -> Option<Epoch> {
        self.0.read()
      }
      fn write(&self, epoch: Epoch) {
        self.0.write(epoch)
      }
    }

    let first = EpochStore::open(Box::new(Shared(storage.clone())));
    assert_eq!(first.current(), 1);
    let second = EpochStore::open(Box::new(Shared(storage.clone())));
    assert_eq!(second.current(), 2);
  }

  #[test]
  fn file_storage_round_trips() {
    let dir = std::env::temp_dir().join(format!(
      "peer-service-epoch-test-{}",
      std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);

    let first = EpochStore::from_data_dir(Some(&dir));
    assert_eq!(first.current(), 1);
    drop(first);

    let second = EpochStore::from_data_dir(Some(&dir));
    assert_eq!(second.current(), 2);

    let _ = fs::remove_dir_all(&dir);
  }
}
