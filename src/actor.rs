//! One task per session
//!
//! Each live session is owned by a single tokio task that drains a bounded
//! mailbox. Joins, commands, disconnects and timer wake-ups all arrive as
//! [`Envelope`]s on that mailbox, so they are applied strictly in dequeue
//! order and never race each other. After every envelope the task publishes
//! a fresh [`SessionView`] on a watch channel for lock-free readers.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, sleep_until},
};
use tracing::{debug, info};

use crate::{
    Error,
    presence::{Id, Role},
    session::{IncomingMessage, Phase, Session, SessionView},
    timer::{self, Schedule},
    tunnel::Tunnel,
};

/// Reply channel for commands
pub type Reply = oneshot::Sender<Result<(), Error>>;

/// Everything a session task can be asked to do
pub enum Envelope<T> {
    /// Attach a participant
    Join {
        /// Participant id
        participant: Id,
        /// Display name
        name: String,
        /// Requested role
        role: Role,
        /// Tunnel for outbound frames
        tunnel: T,
        /// Where to send the outcome
        reply: Reply,
    },
    /// Detach a participant's tunnel
    Disconnect {
        /// Participant id
        participant: Id,
        /// Where to send the outcome
        reply: Reply,
    },
    /// A message from a participant
    Message {
        /// Sender id
        sender: Id,
        /// The message
        message: IncomingMessage,
        /// Where to send the outcome
        reply: Reply,
    },
    /// A timer wake-up
    TimerWake {
        /// Epoch of the schedule that produced it
        epoch: u64,
    },
    /// Tear the session down now
    Shutdown,
}

impl<T> std::fmt::Debug for Envelope<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Join {
                participant, role, ..
            } => f
                .debug_struct("Join")
                .field("participant", participant)
                .field("role", role)
                .finish_non_exhaustive(),
            Self::Disconnect { participant, .. } => f
                .debug_struct("Disconnect")
                .field("participant", participant)
                .finish_non_exhaustive(),
            Self::Message {
                sender, message, ..
            } => f
                .debug_struct("Message")
                .field("sender", sender)
                .field("message", message)
                .finish_non_exhaustive(),
            Self::TimerWake { epoch } => f.debug_struct("TimerWake").field("epoch", epoch).finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Spawns a task that turns a schedule into wake-ups on the mailbox
///
/// The task only holds a weak sender, so it never keeps a finished session
/// alive.
fn spawn_ticker<T: Tunnel>(schedule: Schedule, mailbox: mpsc::WeakSender<Envelope<T>>) {
    tokio::spawn(timer::drive(schedule, move |epoch| {
        let mailbox = mailbox.clone();
        async move {
            match mailbox.upgrade() {
                Some(sender) => sender.send(Envelope::TimerWake { epoch }).await.is_ok(),
                None => false,
            }
        }
    }));
}

/// Drives a session until it ends, is shut down, or idles past the grace period
///
/// A session is idle when its match is complete or nobody is connected. The
/// grace period starts when the session becomes idle and is cancelled if it
/// becomes active again.
pub async fn run<T: Tunnel>(
    mut session: Session<T>,
    mut mailbox: mpsc::Receiver<Envelope<T>>,
    wakes: mpsc::WeakSender<Envelope<T>>,
    view: watch::Sender<Arc<SessionView>>,
    grace_period: Duration,
) {
    let code = session.code();
    let mut deadline = Some(Instant::now() + grace_period);

    loop {
        let envelope = tokio::select! {
            envelope = mailbox.recv() => envelope,
            () = async {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                info!(session = %code, "grace period elapsed");
                break;
            }
        };

        let Some(envelope) = envelope else {
            debug!(session = %code, "mailbox closed");
            break;
        };

        match envelope {
            Envelope::Join {
                participant,
                name,
                role,
                tunnel,
                reply,
            } => {
                let _ = reply.send(session.join(participant, name, role, tunnel));
            }
            Envelope::Disconnect { participant, reply } => {
                let _ = reply.send(session.disconnect(participant));
            }
            Envelope::Message {
                sender,
                message,
                reply,
            } => {
                let result = session.receive_message(sender, message, |schedule| {
                    spawn_ticker(schedule, wakes.clone());
                });
                let _ = reply.send(result);
            }
            Envelope::TimerWake { epoch } => session.receive_wake(epoch),
            Envelope::Shutdown => {
                info!(session = %code, "shutdown requested");
                break;
            }
        }

        if session.is_ended() {
            break;
        }

        view.send_replace(Arc::new(session.view()));

        let idle = session.phase() == Phase::MatchComplete || !session.any_connected();
        deadline = if idle {
            Some(deadline.unwrap_or_else(|| Instant::now() + grace_period))
        } else {
            None
        };
    }

    session.close();
    view.send_replace(Arc::new(session.view()));
}
