//! Update listener: drains the provider's live stream into the owner.

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use ent_provider::UpdateStream;

use crate::store::Command;

/// Consume `updates` one item at a time. Each item is handed to the owner and
/// the next one is not pulled until the owner has finished with it.
///
/// Cancellation is only observed while waiting for the next item, so a
/// shutdown never interrupts a pass or an acknowledgment.
pub(crate) fn spawn_update_listener(
    mut updates: UpdateStream,
    commands: mpsc::Sender<Command>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut delivered: u64 = 0;
        loop {
            let item = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                next = updates.next() => match next {
                    Some(item) => item,
                    None => {
                        info!("transaction update stream ended");
                        break;
                    }
                },
            };

            delivered += 1;
            let (reply, done) = oneshot::channel();
            if commands
                .send(Command::StreamItem { item, reply })
                .await
                .is_err()
            {
                break;
            }
            if done.await.is_err() {
                // Owner stopped before taking the item.
                break;
            }
        }
        debug!(delivered, "update listener exiting");
    })
}
