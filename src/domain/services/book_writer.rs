//! Ordered background saves for the position book.
//!
//! The engine queues a snapshot while it holds its book lock and moves on.
//! A single writer thread drains the queue in order and hands only the
//! newest pending snapshot to the store, so a slow disk never holds the
//! book lock or parks an async worker.

use crate::domain::errors::PersistenceError;
use crate::domain::repositories::book_store::{BookSnapshot, BookStore};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error};

#[derive(Debug, Default)]
struct Progress {
    queued: u64,
    saved: u64,
    failures: u64,
    closed: bool,
}

type Shared = Arc<(Mutex<Progress>, Condvar)>;

fn progress(shared: &Shared) -> MutexGuard<'_, Progress> {
    shared.0.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the writer closed however its thread ends, so `flush` never waits
/// on a dead writer
struct CloseOnExit(Shared);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        progress(&self.0).closed = true;
        self.0 .1.notify_all();
    }
}

pub struct BookWriter {
    tx: Option<mpsc::UnboundedSender<(u64, BookSnapshot)>>,
    shared: Shared,
    handle: Option<JoinHandle<()>>,
}

impl BookWriter {
    pub fn spawn(store: Arc<dyn BookStore>) -> Result<Self, PersistenceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared: Shared = Arc::new((Mutex::new(Progress::default()), Condvar::new()));
        let handle = std::thread::Builder::new()
            .name("book-writer".to_string())
            .spawn({
                let shared = shared.clone();
                move || run(store, rx, shared)
            })
            .map_err(|source| PersistenceError::Io {
                path: "book-writer".to_string(),
                source,
            })?;
        Ok(Self {
            tx: Some(tx),
            shared,
            handle: Some(handle),
        })
    }

    /// Queue `snapshot` behind every earlier one. Callers hold the book lock,
    /// which fixes the order.
    pub fn queue(&self, snapshot: BookSnapshot) {
        let mut state = progress(&self.shared);
        state.queued += 1;
        let seq = state.queued;
        let sent = self
            .tx
            .as_ref()
            .map(|tx| tx.send((seq, snapshot)).is_ok())
            .unwrap_or(false);
        if !sent {
            error!("Book writer is gone; snapshot #{} not saved", seq);
        }
    }

    /// Block until everything queued so far has reached the store
    pub fn flush(&self) {
        let (_, cvar) = &*self.shared;
        let mut state = progress(&self.shared);
        let target = state.queued;
        while state.saved < target && !state.closed {
            state = cvar.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Saves the store rejected since start
    pub fn failures(&self) -> u64 {
        progress(&self.shared).failures
    }
}

impl Drop for BookWriter {
    fn drop(&mut self) {
        // closing the queue lets the thread finish what is pending
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Book writer thread panicked");
            }
        }
    }
}

fn run(
    store: Arc<dyn BookStore>,
    mut rx: mpsc::UnboundedReceiver<(u64, BookSnapshot)>,
    shared: Shared,
) {
    let _close = CloseOnExit(shared.clone());
    while let Some((mut seq, mut snapshot)) = rx.blocking_recv() {
        // every snapshot is the whole book; only the newest matters
        while let Ok((next_seq, next)) = rx.try_recv() {
            seq = next_seq;
            snapshot = next;
        }
        let result = store.save(&snapshot);

        let mut state = progress(&shared);
        match result {
            Ok(()) => debug!("Book snapshot #{} saved", seq),
            Err(e) => {
                error!("Failed to persist position book: {}", e);
                state.failures += 1;
            }
        }
        state.saved = seq;
        shared.1.notify_all();
    }
}
