use crate::error::{Error, Result};
use crate::registry::ServerId;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

const MAX_EVENTS: usize = 1000;

/// Server lifecycle event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerLifecycleEvent {
    /// Instance registered and scaffolded
    Created,
    /// Spawn requested
    Starting,
    /// Server became ready
    Started,
    /// Server stopped on request
    Stopped,
    /// Server died without a stop, or never became ready
    Crashed,
    /// Server restarted by the crash policy
    Restarted,
    /// Instance renamed
    Renamed,
    /// Instance removed from the registry
    Destroyed,
    /// Live session found with no running instance behind it
    OrphanDetected,
    /// Orphaned session taken over by its instance
    Adopted,
}

/// Server lifecycle event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEvent {
    /// Server ID
    pub id: ServerId,
    /// Server name at the time of the event
    pub name: String,
    /// Event type
    pub event: ServerLifecycleEvent,
    /// Event timestamp
    pub timestamp: SystemTime,
    /// Event details
    pub details: Option<String>,
    #[serde(skip)]
    sequence: u64,
}

#[derive(Debug, Default)]
struct EventLog {
    events: VecDeque<ServerEvent>,
    next_sequence: u64,
}

/// Bounded in-memory history of lifecycle events.
#[derive(Debug, Clone, Default)]
pub struct ServerLifecycleManager {
    log: Arc<Mutex<EventLog>>,
}

impl ServerLifecycleManager {
    /// Create a new server lifecycle manager
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, EventLog>> {
        self.log
            .lock()
            .map_err(|_| Error::PersistenceFailed("Failed to lock server events".to_string()))
    }

    /// Record a server event
    pub fn record_event(
        &self,
        id: &ServerId,
        name: &str,
        event: ServerLifecycleEvent,
        details: Option<String>,
    ) -> Result<()> {
        tracing::debug!(server_id = %id, server_name = %name, ?event, ?details, "Lifecycle event");

        let mut log = self.lock()?;
        let sequence = log.next_sequence;
        log.next_sequence += 1;
        log.events.push_back(ServerEvent {
            id: id.clone(),
            name: name.to_string(),
            event,
            timestamp: SystemTime::now(),
            details,
            sequence,
        });

        if log.events.len() > MAX_EVENTS {
            log.events.pop_front();
        }
        Ok(())
    }

    /// Recent events for one server, newest first
    pub fn get_server_events(&self, id: &ServerId, limit: Option<usize>) -> Result<Vec<ServerEvent>> {
        let log = self.lock()?;
        let mut server_events: Vec<ServerEvent> = log
            .events
            .iter()
            .filter(|e| &e.id == id)
            .cloned()
            .collect();

        server_events.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        if let Some(limit) = limit {
            server_events.truncate(limit);
        }
        Ok(server_events)
    }

    /// All events, newest first
    pub fn get_all_events(&self, limit: Option<usize>) -> Result<Vec<ServerEvent>> {
        let log = self.lock()?;
        let mut all_events: Vec<ServerEvent> = log.events.iter().cloned().collect();

        all_events.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        if let Some(limit) = limit {
            all_events.truncate(limit);
        }
        Ok(all_events)
    }
}
