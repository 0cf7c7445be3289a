use serde::Serialize;

use crate::config::SourceConfig;
use crate::errors::fatal;
use crate::errors::ConfigError;
use crate::errors::ProtocolViolation;
use crate::model::ControlCommand;
use crate::model::Message;
use crate::model::SeqNum;
use crate::model::Timestamp;
use crate::progress::ProgressResetter;

use super::CheckpointStore;
use super::Window;

/// The first sequence number a source emits, and what a full reset
/// returns to.
pub const INITIAL_SEQ: SeqNum = SeqNum(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum SourceState {
    Running,
    /// The configured number of messages has been emitted.
    Terminated,
}

/// What one tick produced.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Emission {
    pub seq: SeqNum,
    /// Key of the checkpoint taken on this tick, if one was due.
    pub checkpoint: Option<SeqNum>,
}

impl Emission {
    /// The data message then its watermark, in the order they must
    /// be sent.
    pub fn messages(&self) -> [Message<u64>; 2] {
        let timestamp = Timestamp::from(self.seq);
        [
            Message::Data {
                timestamp,
                payload: self.seq.0,
            },
            Message::Watermark(timestamp),
        ]
    }
}

/// What a rollback did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Rollback {
    /// Checkpoint restored from, or [`None`] for a full reset.
    pub to: Option<SeqNum>,
    /// Number of checkpoints discarded.
    pub discarded: usize,
}

/// Snapshot of the source for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub state: SourceState,
    pub next_seq: SeqNum,
    pub window: Vec<SeqNum>,
    pub checkpoints: Vec<SeqNum>,
    pub rollbacks: u64,
}

/// A source with a sliding window of state which it checkpoints
/// every `checkpoint_freq` ticks and can rewind to any retained
/// checkpoint.
///
/// The window holds the sequence numbers themselves. Logical time is
/// the sequence number, so rewinding to checkpoint `R` means the
/// source resumes at timestamp `R + 1` and everything downstream past
/// `R` is invalid; the [`ProgressResetter`] is told so.
pub struct CheckpointingSource<R> {
    checkpoint_freq: u64,
    num_messages: u64,
    next_seq: SeqNum,
    window: Window<SeqNum>,
    checkpoints: CheckpointStore<SeqNum>,
    resetter: R,
    rollbacks: u64,
}

impl<R> CheckpointingSource<R>
where
    R: ProgressResetter,
{
    pub fn new(config: &SourceConfig, resetter: R) -> Result<Self, ConfigError> {
        config.validate()?;
        let checkpoints = match config.max_checkpoints {
            Some(max_retained) => CheckpointStore::with_retention(max_retained),
            None => CheckpointStore::new(),
        };
        Ok(Self {
            checkpoint_freq: config.checkpoint_freq,
            num_messages: config.num_messages,
            next_seq: INITIAL_SEQ,
            window: Window::new(config.window_size),
            checkpoints,
            resetter,
            rollbacks: 0,
        })
    }

    pub fn state(&self) -> SourceState {
        if self.next_seq.0 > self.num_messages {
            SourceState::Terminated
        } else {
            SourceState::Running
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SourceState::Terminated
    }

    /// The sequence number the next tick will emit.
    pub fn next_seq(&self) -> SeqNum {
        self.next_seq
    }

    pub fn window(&self) -> &Window<SeqNum> {
        &self.window
    }

    pub fn checkpoints(&self) -> &CheckpointStore<SeqNum> {
        &self.checkpoints
    }

    pub fn resetter(&self) -> &R {
        &self.resetter
    }

    pub fn status(&self) -> SourceStatus {
        SourceStatus {
            state: self.state(),
            next_seq: self.next_seq,
            window: self.window.to_vec(),
            checkpoints: self.checkpoints.keys().collect(),
            rollbacks: self.rollbacks,
        }
    }

    /// Advance by one: grow the window, produce the data and
    /// watermark, and checkpoint if one is due.
    ///
    /// Returns [`None`] once terminated.
    pub fn tick(&mut self) -> Result<Option<Emission>, ProtocolViolation> {
        if self.is_terminated() {
            return Ok(None);
        }

        let seq = self.next_seq;
        self.window.push(seq);
        self.next_seq = seq.next();

        let checkpoint = if seq.0 % self.checkpoint_freq == 0 {
            Some(self.checkpoint(seq)?)
        } else {
            None
        };

        if self.is_terminated() {
            tracing::info!("Source emitted all {} messages", self.num_messages);
        }
        Ok(Some(Emission { seq, checkpoint }))
    }

    /// Keyed by the latest sequence number in the window, which is
    /// the one just pushed.
    fn checkpoint(&mut self, key: SeqNum) -> Result<SeqNum, ProtocolViolation> {
        assert_eq!(self.window.latest(), Some(&key));
        self.checkpoints
            .insert(key, self.window.clone())
            .map_err(fatal)?;
        tracing::info!("Checkpointed at latest stored data {key}");
        Ok(key)
    }

    /// Handle a command from the controller.
    ///
    /// Only rollbacks concern a source; anything else is logged and
    /// ignored.
    pub fn on_control(&mut self, cmd: ControlCommand) -> Result<Option<Rollback>, ProtocolViolation> {
        match cmd {
            ControlCommand::Rollback(id) => self.rollback(id).map(Some),
            ControlCommand::ReplicaFailed(replica) => {
                tracing::warn!("Ignoring failure of replica {replica}; sources have no replicas");
                Ok(None)
            }
        }
    }

    /// Rewind to a checkpoint, or start over if there isn't one.
    ///
    /// Starting over assumes nothing downstream has been processed
    /// yet. The source can't check that.
    pub fn rollback(&mut self, id: Option<SeqNum>) -> Result<Rollback, ProtocolViolation> {
        let rollback = match id {
            None => {
                if self.next_seq > INITIAL_SEQ {
                    tracing::warn!(
                        "Starting over after emitting up to {}; assuming nothing downstream was processed",
                        SeqNum(self.next_seq.0 - 1)
                    );
                }
                let discarded = self.checkpoints.len();
                self.next_seq = INITIAL_SEQ;
                self.window.clear();
                self.checkpoints.clear();
                self.resetter.reset_progress(Timestamp::ZERO);
                tracing::info!("Rollback to start over");
                Rollback { to: None, discarded }
            }
            Some(id) => {
                let window = match self.checkpoints.get(&id) {
                    Some(checkpoint) => checkpoint.window().clone(),
                    None => return Err(fatal(ProtocolViolation::UnknownCheckpoint { id })),
                };
                self.next_seq = id.next();
                self.window = window;
                let discarded = self.checkpoints.truncate_after(id);
                self.resetter.reset_progress(Timestamp::from(id));
                tracing::info!("Rollback to checkpoint {id}; discarded {discarded} later checkpoints");
                Rollback {
                    to: Some(id),
                    discarded,
                }
            }
        };
        self.rollbacks += 1;
        Ok(rollback)
    }
}

#[cfg(test)]
use std::{cell::RefCell, rc::Rc};

#[cfg(test)]
type Resets = Rc<RefCell<Vec<Timestamp>>>;

#[cfg(test)]
fn build(
    window_size: usize,
    checkpoint_freq: u64,
    num_messages: u64,
) -> (CheckpointingSource<impl FnMut(Timestamp)>, Resets) {
    let resets = Resets::default();
    let resets_d = resets.clone();
    let config = SourceConfig {
        checkpoint_freq,
        window_size,
        num_messages,
        ..SourceConfig::default()
    };
    let source = CheckpointingSource::new(&config, move |ts| resets_d.borrow_mut().push(ts)).unwrap();
    (source, resets)
}

#[cfg(test)]
fn seqs(items: impl IntoIterator<Item = SeqNum>) -> Vec<u64> {
    items.into_iter().map(|seq| seq.0).collect()
}

#[test]
fn six_ticks_window_and_checkpoints() {
    let (mut source, _resets) = build(3, 2, 100);
    for _ in 0..6 {
        source.tick().unwrap();
    }
    assert_eq!(seqs(source.window().to_vec()), vec![4, 5, 6]);
    assert_eq!(seqs(source.checkpoints().keys()), vec![2, 4, 6]);
    assert_eq!(
        seqs(source.checkpoints().get(&SeqNum(4)).unwrap().window().to_vec()),
        vec![2, 3, 4]
    );
}

#[test]
fn data_comes_before_its_watermark() {
    let (mut source, _resets) = build(3, 2, 100);
    let emission = source.tick().unwrap().unwrap();
    assert_eq!(emission.seq, SeqNum(1));
    assert_eq!(emission.checkpoint, None);
    assert_eq!(
        emission.messages(),
        [
            Message::Data {
                timestamp: Timestamp(1),
                payload: 1
            },
            Message::Watermark(Timestamp(1)),
        ]
    );
    assert_eq!(source.tick().unwrap().unwrap().checkpoint, Some(SeqNum(2)));
}

#[test]
fn rollback_reproduces_sequence() {
    let (mut source, resets) = build(3, 2, 100);
    let original: Vec<_> = (0..10)
        .map(|_| source.tick().unwrap().unwrap().seq.0)
        .collect();

    let rollback = source.rollback(Some(SeqNum(4))).unwrap();
    assert_eq!(
        rollback,
        Rollback {
            to: Some(SeqNum(4)),
            discarded: 3
        }
    );
    assert_eq!(resets.borrow().as_slice(), &[Timestamp(4)]);
    assert_eq!(seqs(source.checkpoints().keys()), vec![2, 4]);
    assert_eq!(seqs(source.window().to_vec()), vec![2, 3, 4]);
    assert!(source.checkpoints().keys().all(|key| key < source.next_seq()));

    let replay: Vec<_> = (0..6)
        .map(|_| source.tick().unwrap().unwrap().seq.0)
        .collect();
    assert_eq!(replay, original[4..].to_vec());
    assert_eq!(seqs(source.window().to_vec()), vec![8, 9, 10]);
    assert_eq!(seqs(source.checkpoints().keys()), vec![2, 4, 6, 8, 10]);
}

#[test]
fn rollback_without_id_starts_over() {
    let (mut source, resets) = build(3, 2, 100);
    for _ in 0..5 {
        source.tick().unwrap();
    }
    let rollback = source.on_control(ControlCommand::Rollback(None)).unwrap();
    assert_eq!(
        rollback,
        Some(Rollback {
            to: None,
            discarded: 2
        })
    );
    assert!(source.window().is_empty());
    assert!(source.checkpoints().is_empty());
    assert_eq!(source.next_seq(), INITIAL_SEQ);
    assert_eq!(resets.borrow().as_slice(), &[Timestamp::ZERO]);
    assert_eq!(source.tick().unwrap().unwrap().seq, SeqNum(1));
}

#[test]
fn rollback_to_unknown_checkpoint_is_fatal() {
    let (mut source, resets) = build(3, 2, 100);
    for _ in 0..4 {
        source.tick().unwrap();
    }
    assert_eq!(
        source.rollback(Some(SeqNum(3))),
        Err(ProtocolViolation::UnknownCheckpoint { id: SeqNum(3) })
    );
    // Nothing moved.
    assert_eq!(source.next_seq(), SeqNum(5));
    assert_eq!(seqs(source.checkpoints().keys()), vec![2, 4]);
    assert!(resets.borrow().is_empty());
}

#[test]
fn terminates_after_configured_count() {
    let (mut source, _resets) = build(3, 2, 3);
    assert_eq!(source.state(), SourceState::Running);
    for _ in 0..3 {
        assert!(source.tick().unwrap().is_some());
    }
    assert_eq!(source.state(), SourceState::Terminated);
    assert_eq!(source.tick().unwrap(), None);

    // A rewind brings it back.
    source.rollback(Some(SeqNum(2))).unwrap();
    assert_eq!(source.state(), SourceState::Running);
    assert_eq!(source.tick().unwrap().unwrap().seq, SeqNum(3));
}

#[test]
fn replica_failure_is_ignored_by_source() {
    use crate::model::ReplicaId;

    let (mut source, resets) = build(3, 2, 100);
    source.tick().unwrap();
    assert_eq!(
        source.on_control(ControlCommand::ReplicaFailed(ReplicaId(0))),
        Ok(None)
    );
    assert_eq!(source.next_seq(), SeqNum(2));
    assert!(resets.borrow().is_empty());
}

#[test]
fn retention_limits_checkpoints() {
    let config = SourceConfig {
        checkpoint_freq: 1,
        window_size: 2,
        num_messages: 100,
        max_checkpoints: Some(2),
        ..SourceConfig::default()
    };
    let mut source = CheckpointingSource::new(&config, |_ts| {}).unwrap();
    for _ in 0..5 {
        source.tick().unwrap();
    }
    assert_eq!(seqs(source.checkpoints().keys()), vec![4, 5]);
    assert_eq!(
        source.rollback(Some(SeqNum(2))),
        Err(ProtocolViolation::UnknownCheckpoint { id: SeqNum(2) })
    );
}
