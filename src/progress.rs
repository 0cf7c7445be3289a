//! Invalidating downstream progress after a rollback.

use tokio::sync::mpsc::UnboundedSender;

use crate::model::Timestamp;

/// Tells the owning runtime that scheduled or in-flight work for
/// timestamps greater than `timestamp` is invalid and has to be
/// discarded or recomputed.
///
/// Fire-and-forget: nothing about the outcome flows back.
pub trait ProgressResetter {
    fn reset_progress(&mut self, timestamp: Timestamp);
}

impl<F> ProgressResetter for F
where
    F: FnMut(Timestamp),
{
    fn reset_progress(&mut self, timestamp: Timestamp) {
        self(timestamp)
    }
}

/// Forwards resets over a channel to whoever is listening.
#[derive(Debug, Clone)]
pub struct ChannelResetter(UnboundedSender<Timestamp>);

impl ChannelResetter {
    pub fn new(tx: UnboundedSender<Timestamp>) -> Self {
        Self(tx)
    }
}

impl ProgressResetter for ChannelResetter {
    fn reset_progress(&mut self, timestamp: Timestamp) {
        if self.0.send(timestamp).is_err() {
            tracing::debug!("Nobody is listening for progress resets; dropped reset to {timestamp}");
        }
    }
}

#[test]
fn channel_resetter_forwards() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut resetter = ChannelResetter::new(tx);
    resetter.reset_progress(Timestamp(4));
    resetter.reset_progress(Timestamp::ZERO);
    assert_eq!(rx.try_recv(), Ok(Timestamp(4)));
    assert_eq!(rx.try_recv(), Ok(Timestamp(0)));
}

#[test]
fn channel_resetter_tolerates_closed_receiver() {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    drop(rx);
    let mut resetter = ChannelResetter::new(tx);
    resetter.reset_progress(Timestamp(1));
}
