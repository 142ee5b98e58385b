//! Periodic timers (§4.5): passive-view shuffle, random promotion, and
//! broadcast-tree out-link refresh. Grounded on the teacher's `Config`
//! timer fields (`shuffle_interval`, `shuffle_probability`) and the
//! `tokio::spawn` + periodic-interval idiom `runloop.rs` uses for its
//! own event loop — generalized here into independent cooperative
//! tasks that post events into the Coordinator's command queue rather
//! than mutating state directly (§5.1, "Transport exit as message").

use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};
use tracing::debug;

use crate::{config::Config, coordinator::Command};

/// Spawns the three periodic timer tasks described in §4.5. Each posts
/// its own event variant into `commands`; they never touch Coordinator
/// state directly. Returns the task handles so the caller can abort
/// them on shutdown.
pub(crate) fn spawn_all(
  config: &Config,
  commands: UnboundedSender<Command>,
) -> Vec<JoinHandle<()>> {
  let mut handles = vec![spawn_periodic(
    config.passive_view_shuffle_period,
    commands.clone(),
    || Command::TimerShuffle,
  )];

  if config.random_promotion {
    handles.push(spawn_periodic(
      config.random_promotion_period,
      commands.clone(),
      || Command::TimerRandomPromotion,
    ));
  }

  if config.broadcast {
    handles.push(spawn_periodic(config.tree_refresh_period, commands, || {
      Command::TimerTreeRefresh
    }));
  }

  handles
}

fn spawn_periodic(
  period: std::time::Duration,
  commands: UnboundedSender<Command>,
  mut event: impl FnMut() -> Command + Send + 'static,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(period);
    // The first tick fires immediately; skip it so timers don't race
    // the Coordinator's own startup.
    ticker.tick().await;
    loop {
      ticker.tick().await;
      if commands.send(event()).is_err() {
        debug!("coordinator gone, stopping timer task");
        break;
      }
    }
  })
}
