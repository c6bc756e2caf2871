//! Write-behind journal to the message store
//!
//! Destinations record persistent messages while holding their own lock,
//! which must never await. They push operations onto this journal and a
//! background task applies them to the [`MessageStore`] in order.
//!
//! The task is spawned on the first recorded operation (or by [`Journal::start`])
//! so nothing accumulates in the channel without a reader. Outside a tokio
//! runtime, or after [`Journal::stop`], operations are dropped with a warning.

use std::sync::Arc;

use gatemq_storage::MessageStore;
use gatemq_types::{DestinationKey, Message, MessageId};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

enum JournalOp {
    Append {
        destination: DestinationKey,
        message: Arc<Message>,
    },
    Remove {
        destination: DestinationKey,
        message_id: MessageId,
    },
    RemoveDestination {
        destination: DestinationKey,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct JournalState {
    tx: Option<mpsc::UnboundedSender<JournalOp>>,
    task: Option<JoinHandle<()>>,
    stopped: bool,
}

/// Handle for recording store operations
#[derive(Clone)]
pub struct Journal {
    store: Arc<dyn MessageStore>,
    state: Arc<Mutex<JournalState>>,
}

impl Journal {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(JournalState::default())),
        }
    }

    /// Spawn the task applying operations to the store. Returns false if it
    /// is already running, was stopped, or there is no runtime.
    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        if state.stopped || state.tx.is_some() {
            return false;
        }
        self.spawn(&mut state)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().tx.is_some()
    }

    pub fn append(&self, destination: &DestinationKey, message: &Arc<Message>) {
        if message.is_persistent() {
            self.record(JournalOp::Append {
                destination: destination.clone(),
                message: message.clone(),
            });
        }
    }

    pub fn remove(&self, destination: &DestinationKey, message: &Message) {
        if message.is_persistent() {
            self.record(JournalOp::Remove {
                destination: destination.clone(),
                message_id: message.id.clone(),
            });
        }
    }

    pub fn remove_destination(&self, destination: &DestinationKey) {
        self.record(JournalOp::RemoveDestination {
            destination: destination.clone(),
        });
    }

    /// Wait until everything recorded so far has reached the store.
    /// Returns immediately if the journal task is not running.
    pub async fn flush(&self) {
        let Some(tx) = self.state.lock().tx.clone() else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(JournalOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Apply what is queued, then stop the task for good.
    pub async fn stop(&self) {
        let task = {
            let mut state = self.state.lock();
            state.stopped = true;
            // Dropping the sender lets the task drain and finish
            state.tx = None;
            state.task.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn record(&self, op: JournalOp) {
        let mut state = self.state.lock();
        if state.tx.is_none() && (state.stopped || !self.spawn(&mut state)) {
            warn!("Journal not running, store operation dropped");
            return;
        }
        if let Some(tx) = &state.tx {
            let _ = tx.send(op);
        }
    }

    fn spawn(&self, state: &mut JournalState) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            return false;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        state.task = Some(runtime.spawn(run(rx, self.store.clone())));
        state.tx = Some(tx);
        debug!("Journal task started");
        true
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<JournalOp>, store: Arc<dyn MessageStore>) {
    while let Some(op) = rx.recv().await {
        let result = match op {
            JournalOp::Append {
                destination,
                message,
            } => store.append(&destination, &message).await,
            JournalOp::Remove {
                destination,
                message_id,
            } => store.remove(&destination, &message_id).await,
            JournalOp::RemoveDestination { destination } => {
                store.remove_destination(&destination).await.map(|_| ())
            }
            JournalOp::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        };
        if let Err(e) = result {
            error!(error = %e, "Failed to apply journal operation");
        }
    }
    debug!("Journal task finished");
}
