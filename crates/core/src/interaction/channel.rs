//! Client side of a process's interaction channel.

use crate::error::{EngineError, EngineResult};
use crate::interaction::codec::{decode_wire, encode_event};
use crate::state::manager::ExecutionManager;
use cp_protocol::{Event, InteractionRequest, InteractionResponse};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use uuid::Uuid;

/// A live, bidirectional connection to one process.
///
/// Events for the process arrive in emission order. Dropping the channel, or
/// calling [`InteractionChannel::disconnect`], counts as a lost connection:
/// an interactive run waiting on a request moves to `paused`.
pub struct InteractionChannel {
    process_id: Uuid,
    connection_id: Uuid,
    events: mpsc::UnboundedReceiver<Event>,
    manager: ExecutionManager,
}

impl InteractionChannel {
    pub(crate) fn new(
        process_id: Uuid,
        connection_id: Uuid,
        events: mpsc::UnboundedReceiver<Event>,
        manager: ExecutionManager,
    ) -> Self {
        Self {
            process_id,
            connection_id,
            events,
            manager,
        }
    }

    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    /// Next event, or `None` once the channel has been superseded by a newer
    /// attachment.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<Event> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Next event in its wire envelope.
    pub async fn next_wire_event(&mut self) -> Option<EngineResult<String>> {
        let event = self.next_event().await?;
        Some(encode_event(&event))
    }

    /// The request the process is currently waiting on, if any.
    pub async fn outstanding_request(&self) -> EngineResult<Option<InteractionRequest>> {
        Ok(self
            .manager
            .get_state(self.process_id)
            .await?
            .pending_request)
    }

    /// Submit a typed response.
    ///
    /// # Errors
    ///
    /// - `ConnectionLost` if another channel has since attached to the process
    /// - `Protocol` if no request is outstanding or the type is not accepted;
    ///   the process keeps waiting
    /// - `Validation` if the response is semantically invalid; the process
    ///   moves to `error`
    pub async fn respond(&self, response: InteractionResponse) -> EngineResult<()> {
        if !self.manager.is_current_channel(self.process_id, self.connection_id) {
            return Err(EngineError::ConnectionLost(self.process_id));
        }
        self.manager.submit_response(self.process_id, response).await
    }

    /// Decode a raw client message and submit it.
    pub async fn respond_wire(&self, raw: &str) -> EngineResult<()> {
        let response = decode_wire(raw)?;
        self.respond(response).await
    }

    /// Close the channel.
    pub fn disconnect(self) {
        drop(self);
    }
}

impl Drop for InteractionChannel {
    fn drop(&mut self) {
        self.manager.detach(self.process_id, self.connection_id);
    }
}
