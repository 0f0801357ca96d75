//! Session registry
//!
//! Maps access codes to live session tasks. The map is the only structure
//! shared between callers; everything else about a session is owned by its
//! task and reached through the task's mailbox.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use derive_where::derive_where;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::{
    Error,
    access_code::AccessCode,
    actor::{self, Envelope, Reply},
    config::{EngineSettings, MatchConfig},
    error::Missing,
    presence::{Id, Role},
    question::Question,
    session::{IncomingMessage, Session, SessionView},
    tunnel::Tunnel,
};

/// A cheap, cloneable handle to one session task
#[derive_where(Clone, Debug)]
pub struct SessionHandle<T> {
    code: AccessCode,
    #[derive_where(skip(Debug))]
    mailbox: mpsc::Sender<Envelope<T>>,
    #[derive_where(skip(Debug))]
    view: watch::Receiver<Arc<SessionView>>,
}

impl<T: Tunnel> SessionHandle<T> {
    /// The session's access code
    pub fn code(&self) -> AccessCode {
        self.code
    }

    /// The latest published projection of the session
    pub fn view(&self) -> Arc<SessionView> {
        self.view.borrow().clone()
    }

    /// A receiver notified every time the projection changes
    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionView>> {
        self.view.clone()
    }

    async fn request<F>(&self, envelope: F) -> Result<(), Error>
    where
        F: FnOnce(Reply) -> Envelope<T>,
    {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(envelope(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        response.await.map_err(|_| Error::SessionClosed)?
    }

    /// Attaches a participant to the session
    ///
    /// # Errors
    ///
    /// See [`Session::join`]; [`Error::SessionClosed`] if the task is gone.
    pub async fn join(&self, participant: Id, name: String, role: Role, tunnel: T) -> Result<(), Error> {
        self.request(|reply| Envelope::Join {
            participant,
            name,
            role,
            tunnel,
            reply,
        })
        .await
    }

    /// Forwards a participant message to the session
    ///
    /// # Errors
    ///
    /// See [`Session::receive_message`]; [`Error::SessionClosed`] if the task
    /// is gone.
    pub async fn send(&self, sender: Id, message: IncomingMessage) -> Result<(), Error> {
        self.request(|reply| Envelope::Message {
            sender,
            message,
            reply,
        })
        .await
    }

    /// Marks a participant as disconnected
    ///
    /// # Errors
    ///
    /// See [`Session::disconnect`]; [`Error::SessionClosed`] if the task is
    /// gone.
    pub async fn disconnect(&self, participant: Id) -> Result<(), Error> {
        self.request(|reply| Envelope::Disconnect { participant, reply })
            .await
    }

    /// Asks the session task to tear down
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the task is already gone.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.mailbox
            .send(Envelope::Shutdown)
            .await
            .map_err(|_| Error::SessionClosed)
    }

    /// Resolves once the session task has finished
    pub async fn closed(&self) {
        self.mailbox.closed().await;
    }
}

/// All live sessions, keyed by access code
#[derive_where(Clone)]
pub struct Registry<T> {
    sessions: Arc<DashMap<AccessCode, SessionHandle<T>>>,
    settings: EngineSettings,
}

impl<T: Tunnel> Default for Registry<T> {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl<T: Tunnel> Registry<T> {
    /// Creates an empty registry
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            settings,
        }
    }

    /// Creates a session and spawns its task
    ///
    /// Must be called from within a tokio runtime. The session removes
    /// itself from the registry when its task ends.
    ///
    /// # Errors
    ///
    /// * [`Error::AccessCodeTaken`] if a live session uses `code`
    /// * [`Error::InvalidConfig`] if `config` or a question is invalid
    pub fn create_session(
        &self,
        code: AccessCode,
        questions: Vec<Question>,
        config: MatchConfig,
    ) -> Result<SessionHandle<T>, Error> {
        let entry = match self.sessions.entry(code) {
            Entry::Occupied(_) => return Err(Error::AccessCodeTaken),
            Entry::Vacant(entry) => entry,
        };

        let session = Session::new(code, questions, config)?;

        let (mailbox, inbox) = mpsc::channel(self.settings.mailbox_capacity);
        let (view_sender, view) = watch::channel(Arc::new(session.view()));
        let wakes = mailbox.downgrade();

        let handle = SessionHandle {
            code,
            mailbox,
            view,
        };
        entry.insert(handle.clone());

        let sessions = self.sessions.clone();
        let grace_period = self.settings.grace_period;
        let own_mailbox = handle.mailbox.clone();
        tokio::spawn(async move {
            actor::run(session, inbox, wakes, view_sender, grace_period).await;
            sessions.remove_if(&code, |_, current| own_mailbox.same_channel(&current.mailbox));
            info!(session = %code, "session torn down");
        });

        Ok(handle)
    }

    /// Finds a live session
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no session uses `code`.
    pub fn lookup(&self, code: AccessCode) -> Result<SessionHandle<T>, Error> {
        self.sessions
            .get(&code)
            .map(|handle| handle.clone())
            .ok_or(Error::NotFound(Missing::Session))
    }

    /// Attaches a participant to a session
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown code, otherwise see
    /// [`SessionHandle::join`].
    pub async fn join(
        &self,
        code: AccessCode,
        participant: Id,
        name: String,
        role: Role,
        tunnel: T,
    ) -> Result<(), Error> {
        self.lookup(code)?
            .join(participant, name, role, tunnel)
            .await
    }

    /// Dispatches a participant message to a session
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown code, otherwise see
    /// [`SessionHandle::send`].
    pub async fn send(&self, code: AccessCode, sender: Id, message: IncomingMessage) -> Result<(), Error> {
        self.lookup(code)?.send(sender, message).await
    }

    /// Marks a participant as disconnected
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown code, otherwise see
    /// [`SessionHandle::disconnect`].
    pub async fn disconnect(&self, code: AccessCode, participant: Id) -> Result<(), Error> {
        self.lookup(code)?.disconnect(participant).await
    }

    /// The latest projection of a session
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown code.
    pub fn view(&self, code: AccessCode) -> Result<Arc<SessionView>, Error> {
        Ok(self.lookup(code)?.view())
    }

    /// Tears a session down immediately and removes it
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown code.
    pub async fn end_session(&self, code: AccessCode) -> Result<(), Error> {
        let handle = self.lookup(code)?;
        if handle.shutdown().await.is_err() {
            warn!(session = %code, "session task already gone");
        }
        self.sessions
            .remove_if(&code, |_, current| current.mailbox.same_channel(&handle.mailbox));
        Ok(())
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no live sessions
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
