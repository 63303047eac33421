use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crossbeam_channel::Sender;
use tracing::debug;

use crate::manager::operation::OperationKind;

/// Lifecycle and byte-progress events emitted by the transfer core.
///
/// Consumers subscribe by passing a channel sender at manager
/// construction; there are no mutable callback lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Started {
        kind: &'static str,
        name: String,
        size: i64,
    },
    /// Byte progress of the current transfer. Only one transfer is
    /// "current" at a time, no matter how many run concurrently.
    Progress {
        name: String,
        bytes: u64,
        size: i64,
    },
    Retrying {
        kind: &'static str,
        name: String,
        attempt: u32,
    },
    Renamed {
        old: String,
        new: String,
    },
    Completed {
        kind: &'static str,
        name: String,
        size: i64,
    },
    Failed {
        kind: &'static str,
        name: String,
    },
}

struct ActiveTransfer {
    kind: OperationKind,
    size: i64,
    started: Instant,
    bytes: u64,
}

#[derive(Default)]
struct ProgressState {
    active: HashMap<String, ActiveTransfer>,
    current: Option<String>,
}

/// Multiplexes byte-level progress from concurrently active transfers
/// into a single "current transfer" surfaced upstream.
pub(crate) struct ProgressHandler {
    state: Mutex<ProgressState>,
    events: Option<Sender<TransferEvent>>,
}

impl ProgressHandler {
    pub fn new(events: Option<Sender<TransferEvent>>) -> Self {
        Self {
            state: Mutex::new(ProgressState::default()),
            events,
        }
    }

    pub fn send_event(&self, event: TransferEvent) {
        if let Some(tx) = &self.events {
            // A full or disconnected consumer must never stall a transfer.
            let _ = tx.try_send(event);
        }
    }

    /// Register a transfer. The most recently started transfer becomes
    /// the current one.
    pub fn transfer_started(&self, kind: OperationKind, name: &str, size: i64) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.active.insert(
                name.to_string(),
                ActiveTransfer {
                    kind,
                    size,
                    started: Instant::now(),
                    bytes: 0,
                },
            );
            state.current = Some(name.to_string());
        }
        self.send_event(TransferEvent::Started {
            kind: kind.as_str(),
            name: name.to_string(),
            size,
        });
    }

    /// Record byte progress. Only the current transfer's progress is
    /// forwarded upstream; the rest is tracked silently.
    pub fn report(&self, name: &str, bytes: u64) {
        let forward = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let size = match state.active.get_mut(name) {
                Some(transfer) => {
                    transfer.bytes = bytes;
                    transfer.size
                }
                None => return,
            };
            (state.current.as_deref() == Some(name)).then_some(size)
        };
        if let Some(size) = forward {
            self.send_event(TransferEvent::Progress {
                name: name.to_string(),
                bytes,
                size,
            });
        }
    }

    /// Deregister a transfer. If it was the current one, the
    /// longest-running still-active transfer takes over: it is the most
    /// stable candidate for continued reporting.
    pub fn transfer_completed(&self, name: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(transfer) = state.active.remove(name) {
            debug!(
                kind = %transfer.kind,
                bytes = transfer.bytes,
                elapsed_ms = transfer.started.elapsed().as_millis() as u64,
                "transfer '{name}' left the active set"
            );
        }
        if state.current.as_deref() == Some(name) {
            state.current = state
                .active
                .iter()
                .min_by_key(|(_, t)| t.started)
                .map(|(n, _)| n.clone());
        }
    }

    #[cfg(test)]
    pub fn current_transfer(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_started_transfer_is_current() {
        let handler = ProgressHandler::new(None);
        handler.transfer_started(OperationKind::Put, "a", 10);
        handler.transfer_started(OperationKind::Put, "b", 10);
        assert_eq!(handler.current_transfer().as_deref(), Some("b"));
    }

    #[test]
    fn completion_promotes_longest_running_transfer() {
        let handler = ProgressHandler::new(None);
        handler.transfer_started(OperationKind::Get, "oldest", 10);
        handler.transfer_started(OperationKind::Get, "middle", 10);
        handler.transfer_started(OperationKind::Get, "newest", 10);

        handler.transfer_completed("newest");
        assert_eq!(handler.current_transfer().as_deref(), Some("oldest"));

        handler.transfer_completed("oldest");
        assert_eq!(handler.current_transfer().as_deref(), Some("middle"));

        handler.transfer_completed("middle");
        assert_eq!(handler.current_transfer(), None);
    }

    #[test]
    fn only_current_progress_is_forwarded() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handler = ProgressHandler::new(Some(tx));
        handler.transfer_started(OperationKind::Put, "a", 100);
        handler.transfer_started(OperationKind::Put, "b", 200);
        while rx.try_recv().is_ok() {}

        handler.report("a", 10);
        handler.report("b", 20);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![TransferEvent::Progress {
                name: "b".into(),
                bytes: 20,
                size: 200,
            }]
        );
    }

    #[test]
    fn completing_an_unrelated_transfer_keeps_current() {
        let handler = ProgressHandler::new(None);
        handler.transfer_started(OperationKind::Get, "a", 10);
        handler.transfer_started(OperationKind::Get, "b", 10);
        handler.transfer_completed("a");
        assert_eq!(handler.current_transfer().as_deref(), Some("b"));
    }
}
