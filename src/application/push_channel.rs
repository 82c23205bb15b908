use crate::domain::models::{SessionPayload, SessionUpdate};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::push_connector::PushConnector;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;

pub type MessageHandler = Arc<dyn Fn(&SessionUpdate) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    entries: Vec<(u64, MessageHandler)>,
}

#[derive(Default)]
struct Shared {
    handlers: Mutex<Handlers>,
    /// Bumped on every connect and disconnect. A reader only dispatches while
    /// its own generation is current.
    generation: AtomicU64,
}

impl Shared {
    fn handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, generation: u64, update: &SessionUpdate) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let handlers: Vec<MessageHandler> = self
            .handlers()
            .entries
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(update);
        }
    }
}

/// Registration returned by `PushChannel::on_message`; dropping it removes
/// the handler.
#[must_use = "the handler is removed when the subscription is dropped"]
pub struct MessageSubscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Drop for MessageSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handlers().entries.retain(|(id, _)| *id != self.id);
        }
    }
}

/// One persistent push connection, opened and closed with the authenticated
/// session. Channel failures are logged and never reach callers.
pub struct PushChannel<C: PushConnector> {
    connector: Arc<C>,
    url: String,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl<C: PushConnector + 'static> PushChannel<C> {
    pub fn new(connector: Arc<C>, url: impl Into<String>) -> Self {
        Self {
            connector,
            url: url.into(),
            shared: Arc::new(Shared::default()),
            reader: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Replaces any open connection with a new one.
    pub fn connect(&self) {
        let mut reader = self.reader();
        if let Some(previous) = reader.take() {
            previous.abort();
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let connector = Arc::clone(&self.connector);
        let shared = Arc::clone(&self.shared);
        let url = self.url.clone();
        *reader = Some(tokio::spawn(async move {
            read_frames(connector, shared, url, generation).await;
        }));
    }

    /// Closes the connection synchronously. No handler runs for frames that
    /// arrive afterwards.
    pub fn disconnect(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(reader) = self.reader().take() {
            reader.abort();
            tracing::debug!(url = %self.url, "push channel disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.reader()
            .as_ref()
            .is_some_and(|reader| !reader.is_finished())
    }

    pub fn on_message<F>(&self, handler: F) -> MessageSubscription
    where
        F: Fn(&SessionUpdate) + Send + Sync + 'static,
    {
        let mut handlers = self.shared.handlers();
        handlers.next_id += 1;
        let id = handlers.next_id;
        handlers.entries.push((id, Arc::new(handler)));
        MessageSubscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn handler_count(&self) -> usize {
        self.shared.handlers().entries.len()
    }
}

impl<C: PushConnector> PushChannel<C> {
    fn reader(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: PushConnector> Drop for PushChannel<C> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader().take() {
            reader.abort();
        }
    }
}

/// Parses one text frame. `Ok(None)` for well-formed frames of another kind.
pub fn parse_frame(text: &str) -> Result<Option<SessionUpdate>, InfraError> {
    let payload: SessionPayload = serde_json::from_str(text)?;
    if !payload.is_session_update() {
        return Ok(None);
    }
    match payload.into_update().map_err(InfraError::Protocol)? {
        Some(update) => Ok(Some(update)),
        None => Err(InfraError::Protocol(
            "session update without fsm_state".to_string(),
        )),
    }
}

async fn read_frames<C: PushConnector>(
    connector: Arc<C>,
    shared: Arc<Shared>,
    url: String,
    generation: u64,
) {
    let mut frames = match connector.open(&url).await {
        Ok(frames) => frames,
        Err(error) => {
            tracing::warn!(%url, %error, "push channel failed to open");
            return;
        }
    };
    tracing::info!(%url, "push channel connected");

    while let Some(frame) = frames.next().await {
        let text = match frame {
            Ok(text) => text,
            Err(error) => {
                tracing::warn!(%url, %error, "push channel error");
                return;
            }
        };
        match parse_frame(&text) {
            Ok(Some(update)) => shared.dispatch(generation, &update),
            Ok(None) => tracing::trace!("ignoring push frame of another kind"),
            Err(error) => tracing::warn!(%error, "dropping push frame"),
        }
    }
    tracing::info!(%url, "push channel closed");
}
