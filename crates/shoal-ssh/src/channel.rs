//! Transport-neutral plumbing for one remote command
//!
//! An [`ExecChannel`] is what the orchestrator sees: a stream of
//! [`ChannelEvent`]s coming back and a [`ChannelWriter`] for keystrokes and
//! close requests going out. The transport keeps the other half, a
//! [`ChannelEnd`], inside whatever task drives the real channel.

use shoal_core::{Result, ShoalError};
use tokio::sync::mpsc;

/// Something the remote side did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes from the remote pseudo-terminal
    Data(Vec<u8>),
    /// The remote process reported its exit status
    Exit(u32),
    /// The channel is gone; no further events follow
    Closed,
}

/// Something the local side wants done
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelInput {
    /// Bytes for the remote pseudo-terminal
    Data(Vec<u8>),
    /// Close the channel (the remote process typically gets SIGHUP)
    Close,
}

/// Local half of a remote command channel
#[derive(Debug)]
pub struct ExecChannel {
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    writer: ChannelWriter,
}

impl ExecChannel {
    /// Wait for the next event. A vanished transport reads as `Closed`.
    pub async fn next_event(&mut self) -> ChannelEvent {
        self.events.recv().await.unwrap_or(ChannelEvent::Closed)
    }

    /// A cloneable handle for sending input and close requests
    pub fn writer(&self) -> ChannelWriter {
        self.writer.clone()
    }

    /// Split into the event stream and the writer
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<ChannelEvent>, ChannelWriter) {
        (self.events, self.writer)
    }
}

/// Sends keystrokes and close requests to a remote command
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    input: mpsc::UnboundedSender<ChannelInput>,
}

impl ChannelWriter {
    /// Queue bytes for the remote pseudo-terminal
    pub fn send(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.input
            .send(ChannelInput::Data(bytes.into()))
            .map_err(|_| ShoalError::Channel("channel already closed".to_string()))
    }

    /// Ask the transport to close the channel. Idempotent.
    pub fn close(&self) {
        let _ = self.input.send(ChannelInput::Close);
    }

    /// Whether the transport side has gone away
    pub fn is_closed(&self) -> bool {
        self.input.is_closed()
    }
}

/// Transport half of a remote command channel
#[derive(Debug)]
pub struct ChannelEnd {
    events: mpsc::UnboundedSender<ChannelEvent>,
    input: mpsc::UnboundedReceiver<ChannelInput>,
}

impl ChannelEnd {
    /// Deliver an event. Returns false once the local half is dropped.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Next input request; `None` once every writer is dropped
    pub async fn next_input(&mut self) -> Option<ChannelInput> {
        self.input.recv().await
    }
}

impl Drop for ChannelEnd {
    fn drop(&mut self) {
        let _ = self.events.send(ChannelEvent::Closed);
    }
}

/// Create a connected local/transport channel pair
pub fn exec_pair() -> (ExecChannel, ChannelEnd) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (input_tx, input_rx) = mpsc::unbounded_channel();

    (
        ExecChannel {
            events: event_rx,
            writer: ChannelWriter { input: input_tx },
        },
        ChannelEnd {
            events: event_tx,
            input: input_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_flow_to_local_half() {
        let (mut local, end) = exec_pair();

        assert!(end.emit(ChannelEvent::Data(b"hello\r\n".to_vec())));
        assert!(end.emit(ChannelEvent::Exit(0)));
        drop(end);

        assert_eq!(local.next_event().await, ChannelEvent::Data(b"hello\r\n".to_vec()));
        assert_eq!(local.next_event().await, ChannelEvent::Exit(0));
        assert_eq!(local.next_event().await, ChannelEvent::Closed);
        // Stays closed
        assert_eq!(local.next_event().await, ChannelEvent::Closed);
    }

    #[tokio::test]
    async fn test_writer_reaches_transport() {
        let (local, mut end) = exec_pair();
        let writer = local.writer();

        writer.send(b"ls\n".to_vec()).unwrap();
        writer.close();

        assert_eq!(end.next_input().await, Some(ChannelInput::Data(b"ls\n".to_vec())));
        assert_eq!(end.next_input().await, Some(ChannelInput::Close));
    }

    #[tokio::test]
    async fn test_send_after_transport_gone_fails() {
        let (local, end) = exec_pair();
        drop(end);

        let writer = local.writer();
        assert!(writer.is_closed());
        assert!(matches!(writer.send(b"x".to_vec()), Err(ShoalError::Channel(_))));
    }
}
