use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{EngineCommand, EngineEvent};

/// Broadcast event stream type used by frontend subscribers.
pub type EventStream = broadcast::Receiver<EngineEvent>;

/// Errors returned by engine channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The command receiver side is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Command/event channel pair shared between the engine task and frontends.
#[derive(Clone, Debug)]
pub struct EngineChannels {
    command_tx: mpsc::Sender<EngineCommand>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl EngineChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<EngineCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Clone the command sender.
    pub fn command_sender(&self) -> mpsc::Sender<EngineCommand> {
        self.command_tx.clone()
    }

    /// Clone the event sender.
    pub fn event_sender(&self) -> broadcast::Sender<EngineEvent> {
        self.event_tx.clone()
    }

    /// Subscribe to emitted engine events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Send one command to the engine task.
    pub async fn send_command(&self, command: EngineCommand) -> Result<(), ChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ChannelError::CommandChannelClosed)
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }
}
