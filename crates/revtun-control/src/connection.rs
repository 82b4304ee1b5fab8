//! Outbound side of a control connection

use revtun_proto::{ChannelId, TunnelFrame};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Control connection {0} is closed")]
pub struct ControlClosed(pub ChannelId);

/// Cloneable sender half of a control connection.
///
/// Exposed listeners and external connection pumps hold one of these to push
/// frames to the internal client. Cancelling the shutdown token closes the
/// session and, through child tokens, everything it owns.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    channel_id: ChannelId,
    outbound: mpsc::Sender<TunnelFrame>,
    shutdown: CancellationToken,
}

impl ControlHandle {
    pub fn new(
        channel_id: ChannelId,
        queue_depth: usize,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Receiver<TunnelFrame>) {
        let (outbound, rx) = mpsc::channel(queue_depth.max(1));
        (
            Self {
                channel_id,
                outbound,
                shutdown,
            },
            rx,
        )
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Queue a frame for the internal client, waiting for room
    pub async fn send(&self, frame: TunnelFrame) -> Result<(), ControlClosed> {
        if self.shutdown.is_cancelled() {
            return Err(ControlClosed(self.channel_id.clone()));
        }

        tokio::select! {
            result = self.outbound.send(frame) => {
                result.map_err(|_| ControlClosed(self.channel_id.clone()))
            }
            _ = self.shutdown.cancelled() => Err(ControlClosed(self.channel_id.clone())),
        }
    }

    /// Queue a frame without waiting; returns false if it was not queued
    pub fn try_send(&self, frame: TunnelFrame) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.outbound.is_closed()
    }

    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_reaches_receiver() {
        let (handle, mut rx) =
            ControlHandle::new(ChannelId::from("ctl"), 4, CancellationToken::new());
        handle
            .send(TunnelFrame::disconnected(ChannelId::from("c1")))
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(TunnelFrame::disconnected(ChannelId::from("c1")))
        );
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (handle, _rx) =
            ControlHandle::new(ChannelId::from("ctl"), 4, CancellationToken::new());
        handle.close();

        assert!(handle.is_closed());
        assert_eq!(
            handle
                .send(TunnelFrame::disconnected(ChannelId::from("c1")))
                .await,
            Err(ControlClosed(ChannelId::from("ctl")))
        );
        assert!(!handle.try_send(TunnelFrame::disconnected(ChannelId::from("c1"))));
    }

    #[tokio::test]
    async fn test_blocked_send_is_released_by_close() {
        let (handle, _rx) =
            ControlHandle::new(ChannelId::from("ctl"), 1, CancellationToken::new());
        assert!(handle.try_send(TunnelFrame::disconnected(ChannelId::from("c1"))));

        let sender = handle.clone();
        let pending = tokio::spawn(async move {
            sender
                .send(TunnelFrame::disconnected(ChannelId::from("c2")))
                .await
        });

        tokio::task::yield_now().await;
        handle.close();
        assert!(pending.await.unwrap().is_err());
    }

    #[test]
    fn test_parent_cancellation_reaches_handle() {
        let parent = CancellationToken::new();
        let (handle, _rx) = ControlHandle::new(ChannelId::from("ctl"), 1, parent.child_token());
        parent.cancel();
        assert!(handle.is_closed());
    }
}
