//! Single-slot mailbox pairing a command with its reply.
//!
//! The server handles one command at a time, so at most one reply is ever
//! outstanding. The receive loop deposits replies; the command path waits
//! for them. A reply nobody collected is replaced by the next one.

use crate::error::{ClientError, Result};
use crate::protocol::Reply;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use log::warn;

pub(crate) fn reply_slot() -> (ReplyDepositor, ReplyWaiter) {
    let (sender, receiver) = bounded(1);
    (
        ReplyDepositor {
            sender,
            evictor: receiver.clone(),
        },
        ReplyWaiter { receiver },
    )
}

/// Receive-loop side of the mailbox. Dropping it wakes waiters.
pub(crate) struct ReplyDepositor {
    sender: Sender<Reply>,
    evictor: Receiver<Reply>,
}

impl ReplyDepositor {
    /// Put a reply in the slot, evicting an unread one
    pub(crate) fn deposit(&self, reply: Reply) {
        let mut reply = reply;
        loop {
            match self.sender.try_send(reply) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if let Ok(stale) = self.evictor.try_recv() {
                        warn!("⚠️ Discarding unread reply to {}", stale.command());
                    }
                    reply = rejected;
                }
                // Only reachable once every waiter is gone
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Command side of the mailbox
pub(crate) struct ReplyWaiter {
    receiver: Receiver<Reply>,
}

impl ReplyWaiter {
    /// Drop replies that arrived while no command was in flight
    pub(crate) fn discard_stale(&self) -> usize {
        let mut discarded = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(stale) => {
                    warn!("⚠️ Dropping unsolicited reply to {}", stale.command());
                    discarded += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return discarded,
            }
        }
    }

    /// Block until a reply arrives or the receive loop ends
    pub(crate) fn wait(&self) -> Result<Reply> {
        self.receiver
            .recv()
            .map_err(|_| ClientError::ConnectionClosed)
    }
}
