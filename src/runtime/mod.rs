//! Drives the operator logic as async tasks.
//!
//! Each operator runs as its own task: one sequential thread of
//! control that owns its logic outright, so nothing in here is
//! locked. Operators only talk over tokio channels, which keep order
//! between one producer and one consumer but promise nothing across
//! producers. Acknowledgments from different replicas may interleave
//! however they like.
//!
//! The only place a task waits is a `select!` over its inbound
//! channels, its tick timer, and the [`Shutdown`] signal. Each
//! callback runs to completion before the next wait, so a shutdown
//! never cuts one off partway through.
//!
//! Fatal [`crate::errors::ProtocolViolation`]s end the task with an
//! `Err`. On a clean finish the logic is handed back so you can
//! inspect its final state.

use tokio::sync::watch;

pub(crate) mod ingress;
pub(crate) mod source;

pub use ingress::run_ingress;
pub use ingress::IngressInputs;
pub use ingress::ReplicaOutputs;
pub use source::run_source;

/// Tells operators to stop after whatever they are doing now.
#[derive(Debug)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// The operator's side of a [`ShutdownHandle`].
///
/// If the handle is dropped without triggering, shutdown never
/// comes.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is triggered.
    pub async fn wait(&mut self) {
        loop {
            if self.is_triggered() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle(tx), Shutdown(rx))
}

/// Where an operator publishes its latest status. Starts out
/// [`None`] until the operator has done something.
pub fn status_channel<T>() -> (watch::Sender<Option<T>>, watch::Receiver<Option<T>>) {
    watch::channel(None)
}

#[tokio::test]
async fn shutdown_wakes_waiters() {
    let (handle, shutdown) = shutdown_channel();
    let mut waiter = shutdown.clone();
    let task = tokio::spawn(async move { waiter.wait().await });

    assert!(!shutdown.is_triggered());
    handle.trigger();
    task.await.unwrap();
    assert!(shutdown.is_triggered());
}

#[cfg(test)]
async fn next_payload(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<crate::model::Delivery<u64>>,
) -> crate::model::Item<u64> {
    loop {
        match rx.recv().await {
            Some(crate::model::Delivery::Item(item)) => return item,
            Some(crate::model::Delivery::Watermark(..)) => continue,
            None => panic!("replica channel closed"),
        }
    }
}

#[tokio::test]
async fn rollback_replays_through_the_ingress() {
    use tokio::sync::mpsc;

    use crate::checkpoint::CheckpointingSource;
    use crate::config::IngressConfig;
    use crate::config::SourceConfig;
    use crate::model::Ack;
    use crate::model::ControlCommand;
    use crate::model::SeqNum;
    use crate::model::Timestamp;
    use crate::replication::Ingress;
    use crate::replication::ReplicaSet;

    let (_handle, shutdown) = shutdown_channel();
    let config = SourceConfig {
        checkpoint_freq: 2,
        window_size: 3,
        num_messages: 4,
        tick_interval_ms: 1,
        max_checkpoints: None,
    };
    let source = CheckpointingSource::new(&config, |_: Timestamp| {}).unwrap();
    let (source_control, source_control_rx) = mpsc::unbounded_channel();
    let (data_tx, data) = mpsc::unbounded_channel();
    let (source_status, _) = status_channel();
    let source_task = tokio::spawn(run_source(
        "pipeline_source".to_string(),
        source,
        source_control_rx,
        data_tx,
        config.tick_interval(),
        source_status,
        shutdown.clone(),
    ));

    let replicas = ReplicaSet::from_config(&IngressConfig::default()).unwrap();
    let (outputs, mut receivers) = ReplicaOutputs::channels(&replicas);
    let (acks_tx, acks) = mpsc::unbounded_channel();
    let (ingress_control, control) = mpsc::unbounded_channel::<ControlCommand>();
    let (ingress_status, _) = status_channel();
    let ingress_task = tokio::spawn(run_ingress(
        "pipeline_ingress".to_string(),
        Ingress::new(replicas),
        IngressInputs {
            data,
            acks,
            control,
        },
        outputs,
        ingress_status,
        shutdown,
    ));

    let mut seen = Vec::new();
    for _ in 0..4 {
        for (replica, rx) in receivers.iter_mut() {
            let item = next_payload(rx).await;
            acks_tx.send(Ack::new(item.seq(), *replica)).unwrap();
            if replica.0 == 0 {
                seen.push((item.seq().0, *item.payload()));
            }
        }
    }
    assert_eq!(seen, vec![(0, 1), (1, 2), (2, 3), (3, 4)]);

    source_control
        .send(ControlCommand::Rollback(Some(SeqNum(2))))
        .unwrap();
    let mut replayed = Vec::new();
    for _ in 0..2 {
        for (replica, rx) in receivers.iter_mut() {
            let item = next_payload(rx).await;
            acks_tx.send(Ack::new(item.seq(), *replica)).unwrap();
            if replica.0 == 1 {
                replayed.push((item.seq().0, *item.payload()));
            }
        }
    }
    // Replayed payloads get fresh sequence numbers.
    assert_eq!(replayed, vec![(4, 3), (5, 4)]);

    drop(source_control);
    source_task.await.unwrap().unwrap();
    drop(acks_tx);
    drop(ingress_control);
    let ingress = ingress_task.await.unwrap().unwrap();
    assert!(ingress.buffer().is_empty());
    assert_eq!(ingress.next_seq(), SeqNum(6));
}
