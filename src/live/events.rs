//! Events from the remote live session, delivered over one ordered channel.
//!
//! Every event carries the epoch of the connection that produced it so the
//! lifecycle manager can drop anything that outlived its session.

use crate::audio::pcm::AudioFrame;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// The remote acknowledged the session setup.
    Opened,
    /// One decoded frame of model speech.
    FrameReceived(AudioFrame),
    /// The model abandoned its in-flight reply.
    Interrupted,
    Closed,
    Errored(String),
}

impl LiveEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LiveEvent::Opened => "opened",
            LiveEvent::FrameReceived(_) => "frame_received",
            LiveEvent::Interrupted => "interrupted",
            LiveEvent::Closed => "closed",
            LiveEvent::Errored(_) => "errored",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaggedEvent {
    pub epoch: u64,
    pub event: LiveEvent,
}

pub type EventReceiver = mpsc::UnboundedReceiver<TaggedEvent>;

/// Sending half handed to a connection; stamps its epoch on everything.
#[derive(Debug, Clone)]
pub struct EventSender {
    epoch: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSender {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns false once the receiving side is gone.
    pub fn emit(&self, event: LiveEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// Unbounded so that the network reader never waits on playback.
pub fn event_channel() -> (EventHub, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventHub { tx }, rx)
}

/// Hands out per-epoch senders that all feed the same receiver.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventHub {
    pub fn sender(&self, epoch: u64) -> EventSender {
        EventSender {
            epoch,
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn senders_stamp_their_epoch_on_one_ordered_stream() {
        let (hub, mut rx) = event_channel();
        let old = hub.sender(1);
        let new = hub.sender(2);

        assert!(old.emit(LiveEvent::Opened));
        assert!(new.emit(LiveEvent::Interrupted));
        assert!(old.emit(LiveEvent::Closed));

        let received: Vec<(u64, &'static str)> = vec![
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|tagged| (tagged.epoch, tagged.event.kind()))
        .collect();

        assert_eq!(received, vec![(1, "opened"), (2, "interrupted"), (1, "closed")]);

        drop(rx);
        assert!(!new.emit(LiveEvent::Closed));
    }
}
