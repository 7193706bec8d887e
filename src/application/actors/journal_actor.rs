//! Writes every engine event to the journal.
//!
//! Runs beside the engine on its own broadcast subscription. Without a
//! writable journal the events are only logged.

use crate::domain::events::EngineEvent;
use crate::persistence::journal::EventJournal;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JournalStats {
    pub written: u64,
    pub logged_only: u64,
    pub failed: u64,
    pub lagged: u64,
}

pub struct JournalActor {
    journal: Option<EventJournal>,
    stats: JournalStats,
}

impl JournalActor {
    pub fn spawn(
        journal: Option<EventJournal>,
        events: broadcast::Receiver<EngineEvent>,
    ) -> JoinHandle<JournalStats> {
        let actor = Self {
            journal,
            stats: JournalStats::default(),
        };
        tokio::spawn(actor.run(events))
    }

    /// Consume events until every publisher is gone
    async fn run(mut self, mut events: broadcast::Receiver<EngineEvent>) -> JournalStats {
        info!(
            "JournalActor started ({})",
            match &self.journal {
                Some(journal) if !journal.is_read_only() => "writing",
                _ => "log only",
            }
        );
        loop {
            match events.recv().await {
                Ok(event) => self.handle(event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Journal fell behind, {} event(s) skipped", skipped);
                    self.stats.lagged += skipped;
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("JournalActor stopped: {:?}", self.stats);
        self.stats
    }

    async fn handle(&mut self, event: EngineEvent) {
        match &self.journal {
            Some(journal) if !journal.is_read_only() => match journal.record(&event).await {
                Ok(record) => {
                    debug!("Journaled {} #{}", record.event_type, record.id);
                    self.stats.written += 1;
                }
                Err(e) => {
                    error!("Failed to journal {}: {}", event.kind(), e);
                    self.stats.failed += 1;
                }
            },
            _ => {
                let payload = serde_json::to_string(&event).unwrap_or_default();
                info!("event {} {}", event.kind(), payload);
                self.stats.logged_only += 1;
            }
        }
    }
}
