//! Channel abstractions for Live Objects.
//!
//! The engine consumes decoded messages pushed by the channel layer and
//! hands outbound operations to an [`ObjectsChannel`]. [`MemoryHub`] plays
//! the part of the realtime service for tests and simulation.

use crate::config::ObjectsConfig;
use crate::pipeline::{now_ms, Pipeline};
use async_trait::async_trait;
use liveobjects_core::{ObjectMessage, ObjectState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{trace, warn};

/// Attachment state of the underlying channel, as reported by the channel
/// layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Initialized,
    Attaching,
    /// `has_objects` is false when the service holds no objects for the
    /// channel, in which case no sync sequence will follow.
    Attached {
        has_objects: bool,
    },
    Suspended,
    Detached,
    Failed,
}

impl ChannelState {
    /// Whether live operations are applied and local writes published.
    pub fn is_usable(&self) -> bool {
        !matches!(
            self,
            ChannelState::Suspended | ChannelState::Detached | ChannelState::Failed
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("Channel closed")]
    Closed,
}

/// Outbound half of the channel contract.
#[async_trait]
pub trait ObjectsChannel: Send + Sync + 'static {
    /// Channel name, used in logs.
    fn name(&self) -> &str;

    /// Hand messages to the channel for transmission. Completion means the
    /// channel accepted them, not that they were applied anywhere.
    async fn publish(&self, messages: Vec<ObjectMessage>) -> Result<(), ChannelError>;
}

struct HubLog {
    next_serial: u64,
    next_connection: u64,
    messages: Vec<ObjectMessage>,
}

/// In-memory stand-in for the realtime service.
///
/// Every published message is stamped with the publisher's site code, a
/// serial from a single increasing sequence, a timestamp and a connection
/// id, then appended to the channel log and applied to a server-side engine
/// from which sync snapshots are taken.
pub struct MemoryHub {
    name: String,
    log: Mutex<HubLog>,
    server: Pipeline,
    accepting: AtomicBool,
}

impl MemoryHub {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let server = Pipeline::new(ObjectsConfig::default());
        server.on_channel_state(ChannelState::Attached { has_objects: false });
        Arc::new(Self {
            name: name.into(),
            log: Mutex::new(HubLog {
                next_serial: 1,
                next_connection: 1,
                messages: Vec::new(),
            }),
            server,
            accepting: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a connection publishing under `site_code`.
    pub fn connect(self: &Arc<Self>, site_code: impl Into<String>) -> MemoryChannel {
        let connection_id = {
            let mut log = self.log.lock();
            let id = format!("conn-{}", log.next_connection);
            log.next_connection += 1;
            id
        };
        MemoryChannel {
            hub: self.clone(),
            site_code: site_code.into(),
            connection_id,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Refuse (or resume accepting) published messages.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    fn accept(
        &self,
        site_code: &str,
        connection_id: &str,
        messages: Vec<ObjectMessage>,
    ) -> Result<(), ChannelError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ChannelError::Rejected(format!(
                "channel {} is not accepting messages",
                self.name
            )));
        }

        // The server engine is fed under the log lock so it sees messages in
        // serial order.
        let mut log = self.log.lock();
        let stamped: Vec<ObjectMessage> = messages
            .into_iter()
            .map(|mut msg| {
                let serial = format!("{:020}", log.next_serial);
                log.next_serial += 1;
                msg.connection_id = Some(connection_id.to_string());
                msg.timestamp = Some(now_ms());
                msg.with_origin(site_code, serial)
            })
            .collect();
        log.messages.extend(stamped.iter().cloned());

        trace!(channel = %self.name, site_code, count = stamped.len(), "Hub accepted messages");
        if let Err(e) = self.server.handle_object_messages(stamped) {
            warn!(channel = %self.name, error = %e, "Server engine rejected accepted messages");
        }
        Ok(())
    }

    /// Every message accepted so far, in channel order.
    pub fn messages(&self) -> Vec<ObjectMessage> {
        self.log.lock().messages.clone()
    }

    /// Messages accepted at or after position `from`.
    pub fn messages_since(&self, from: usize) -> Vec<ObjectMessage> {
        let log = self.log.lock();
        log.messages.get(from..).map(<[_]>::to_vec).unwrap_or_default()
    }

    pub fn message_count(&self) -> usize {
        self.log.lock().messages.len()
    }

    /// Server-authoritative state of every object, tombstoned ones included.
    pub fn snapshot(&self) -> Vec<ObjectState> {
        let mut states: Vec<ObjectState> = self
            .server
            .pool()
            .cells()
            .into_iter()
            .map(|cell| cell.read().to_state())
            .collect();
        states.sort_by(|a, b| a.object_id.cmp(&b.object_id));
        states
    }

    /// The snapshot split into pages of at most `page_size` states, each
    /// paired with its sync serial. The last page has an empty cursor.
    pub fn sync_pages(&self, sequence_id: &str, page_size: usize) -> Vec<(String, Vec<ObjectState>)> {
        let states = self.snapshot();
        let chunks: Vec<Vec<ObjectState>> = states
            .chunks(page_size.max(1))
            .map(<[_]>::to_vec)
            .collect();
        let last = chunks.len().saturating_sub(1);

        if chunks.is_empty() {
            return vec![(format!("{}:", sequence_id), Vec::new())];
        }
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, page)| {
                let cursor = if index == last {
                    String::new()
                } else {
                    format!("page{}", index + 1)
                };
                (format!("{}:{}", sequence_id, cursor), page)
            })
            .collect()
    }

    /// The server-side engine, for inspection.
    pub fn server(&self) -> &Pipeline {
        &self.server
    }
}

/// One client's connection to a [`MemoryHub`].
pub struct MemoryChannel {
    hub: Arc<MemoryHub>,
    site_code: String,
    connection_id: String,
    cursor: AtomicUsize,
}

impl MemoryChannel {
    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }

    pub fn site_code(&self) -> &str {
        &self.site_code
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Messages published on the hub since the last call, own echoes
    /// included.
    pub fn drain(&self) -> Vec<ObjectMessage> {
        let total = self.hub.message_count();
        let from = self.cursor.swap(total, Ordering::SeqCst);
        let mut messages = self.hub.messages_since(from);
        messages.truncate(total.saturating_sub(from));
        messages
    }
}

#[async_trait]
impl ObjectsChannel for MemoryChannel {
    fn name(&self) -> &str {
        self.hub.name()
    }

    async fn publish(&self, messages: Vec<ObjectMessage>) -> Result<(), ChannelError> {
        self.hub.accept(&self.site_code, &self.connection_id, messages)
    }
}
