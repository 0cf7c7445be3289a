use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

use crate::errors::prepend_tname;
use crate::errors::ProtocolViolation;
use crate::metrics::IngressMetrics;
use crate::model::Ack;
use crate::model::ControlCommand;
use crate::model::Delivery;
use crate::model::Message;
use crate::model::ReplicaId;
use crate::replication::AckOutcome;
use crate::replication::Fanout;
use crate::replication::Ingress;
use crate::replication::IngressStatus;
use crate::replication::ReplicaSet;
use crate::with_timer;

use super::Shutdown;

/// One channel per replica.
///
/// A retired replica's sender is dropped, so its receiver sees the
/// channel close once it has drained what was already sent.
#[derive(Debug)]
pub struct ReplicaOutputs<P> {
    senders: BTreeMap<ReplicaId, UnboundedSender<Delivery<P>>>,
}

impl<P> Default for ReplicaOutputs<P> {
    fn default() -> Self {
        Self {
            senders: BTreeMap::new(),
        }
    }
}

impl<P> ReplicaOutputs<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a channel for every member of `replicas`.
    pub fn channels(
        replicas: &ReplicaSet,
    ) -> (Self, BTreeMap<ReplicaId, UnboundedReceiver<Delivery<P>>>) {
        let mut outputs = Self::new();
        let mut receivers = BTreeMap::new();
        for replica in replicas.iter() {
            let (tx, rx) = mpsc::unbounded_channel();
            outputs.insert(*replica, tx);
            receivers.insert(*replica, rx);
        }
        (outputs, receivers)
    }

    pub fn insert(&mut self, replica: ReplicaId, tx: UnboundedSender<Delivery<P>>) {
        self.senders.insert(replica, tx);
    }

    pub fn contains(&self, replica: &ReplicaId) -> bool {
        self.senders.contains_key(replica)
    }
}

impl<P> Fanout<P> for ReplicaOutputs<P> {
    fn deliver(&mut self, replica: ReplicaId, delivery: Delivery<P>) {
        match self.senders.get(&replica) {
            Some(tx) => {
                // The item stays buffered; the controller still has
                // to mark the replica failed.
                if tx.send(delivery).is_err() {
                    tracing::warn!("Replica {replica} hung up before being marked failed");
                }
            }
            None => tracing::warn!("No channel to replica {replica}; dropping delivery"),
        }
    }

    fn retire(&mut self, replica: ReplicaId) {
        self.senders.remove(&replica);
    }
}

/// Everything flowing into an ingress.
#[derive(Debug)]
pub struct IngressInputs<P> {
    pub data: UnboundedReceiver<Message<P>>,
    pub acks: UnboundedReceiver<Ack>,
    pub control: UnboundedReceiver<ControlCommand>,
}

enum Event<P> {
    Shutdown,
    Control(Option<ControlCommand>),
    Ack(Option<Ack>),
    Data(Option<Message<P>>),
}

/// Run an ingress until shutdown or until all of its inputs close.
///
/// Control commands take priority over acknowledgments, and those
/// over data, whenever more than one is ready. That way a replica
/// failure is applied before any data that was sent after it.
#[tracing::instrument(name = "ingress", skip_all, fields(operator = %name))]
pub async fn run_ingress<P>(
    name: String,
    mut ingress: Ingress<P>,
    mut inputs: IngressInputs<P>,
    mut outputs: ReplicaOutputs<P>,
    status: watch::Sender<Option<IngressStatus>>,
    mut shutdown: Shutdown,
) -> Result<Ingress<P>, ProtocolViolation>
where
    P: Clone,
{
    let metrics = IngressMetrics::new(&name);
    let mut pending = 0;
    let mut data_open = true;
    let mut acks_open = true;
    let mut control_open = true;

    tracing::info!("Ingress {name} started");
    status.send_replace(Some(ingress.status()));
    while data_open || acks_open || control_open {
        let event = tokio::select! {
            biased;
            _ = shutdown.wait() => Event::Shutdown,
            cmd = inputs.control.recv(), if control_open => Event::Control(cmd),
            ack = inputs.acks.recv(), if acks_open => Event::Ack(ack),
            msg = inputs.data.recv(), if data_open => Event::Data(msg),
        };

        match event {
            Event::Shutdown => {
                tracing::info!("Ingress {name} shutting down");
                break;
            }
            Event::Control(None) => control_open = false,
            Event::Ack(None) => acks_open = false,
            Event::Data(None) => data_open = false,
            Event::Control(Some(cmd)) => {
                if let Err(err) = on_control(&mut ingress, cmd, &mut outputs, &metrics) {
                    tracing::error!("{}", prepend_tname(format!("Ingress {name} stopped: {err}")));
                    return Err(err);
                }
            }
            Event::Ack(Some(ack)) => match ingress.acknowledge(ack) {
                Ok(outcome) => {
                    metrics.ack_count.add(1, &metrics.labels);
                    if outcome == AckOutcome::Reclaimed {
                        metrics.reclaimed_count.add(1, &metrics.labels);
                    }
                }
                Err(_) => metrics.unexpected_ack_count.add(1, &metrics.labels),
            },
            Event::Data(Some(msg)) => {
                let seq = with_timer!(
                    metrics.ingest_histogram,
                    metrics.labels,
                    ingress.on_message(msg, &mut outputs)
                );
                match seq {
                    Some(_) => metrics.item_inp_count.add(1, &metrics.labels),
                    None => metrics.watermark_count.add(1, &metrics.labels),
                }
            }
        }

        let now_pending = ingress.buffer().len() as i64;
        metrics
            .pending_entries
            .add(now_pending - pending, &metrics.labels);
        pending = now_pending;
        status.send_replace(Some(ingress.status()));
    }

    tracing::info!(
        "Ingress {name} finished with {} entries still pending",
        ingress.buffer().len()
    );
    Ok(ingress)
}

fn on_control<P: Clone>(
    ingress: &mut Ingress<P>,
    cmd: ControlCommand,
    outputs: &mut ReplicaOutputs<P>,
    metrics: &IngressMetrics,
) -> Result<(), ProtocolViolation> {
    match cmd {
        ControlCommand::ReplicaFailed(replica) => {
            let outcome = ingress.replica_failed(replica, outputs)?;
            if outcome.removed {
                metrics.replica_failed_count.add(1, &metrics.labels);
                metrics
                    .reclaimed_count
                    .add(outcome.reclaimed.len() as u64, &metrics.labels);
            }
            Ok(())
        }
        cmd => ingress.on_control(cmd, outputs),
    }
}

#[cfg(test)]
struct Harness {
    data: UnboundedSender<Message<u64>>,
    acks: UnboundedSender<Ack>,
    control: UnboundedSender<ControlCommand>,
    replicas: BTreeMap<ReplicaId, UnboundedReceiver<Delivery<u64>>>,
    status: watch::Receiver<Option<IngressStatus>>,
    task: tokio::task::JoinHandle<Result<Ingress<u64>, ProtocolViolation>>,
}

#[cfg(test)]
fn spawn_ingress(replicas: usize, shutdown: Shutdown) -> Harness {
    let set = ReplicaSet::with_count(replicas).unwrap();
    let (outputs, receivers) = ReplicaOutputs::channels(&set);
    let (data_tx, data) = mpsc::unbounded_channel();
    let (acks_tx, acks) = mpsc::unbounded_channel();
    let (control_tx, control) = mpsc::unbounded_channel();
    let (status_tx, status) = super::status_channel();
    let inputs = IngressInputs {
        data,
        acks,
        control,
    };
    let task = tokio::spawn(run_ingress(
        "test_ingress".to_string(),
        Ingress::new(set),
        inputs,
        outputs,
        status_tx,
        shutdown,
    ));
    Harness {
        data: data_tx,
        acks: acks_tx,
        control: control_tx,
        replicas: receivers,
        status,
        task,
    }
}

#[cfg(test)]
async fn next_item(rx: &mut UnboundedReceiver<Delivery<u64>>) -> crate::model::Item<u64> {
    match rx.recv().await {
        Some(Delivery::Item(item)) => item,
        other => panic!("expected an item, got {other:?}"),
    }
}

#[cfg(test)]
use crate::model::SeqNum;
#[cfg(test)]
use crate::model::Timestamp;

#[tokio::test]
async fn replicas_see_items_in_order_then_acks_drain_buffer() {
    let (_handle, shutdown) = super::shutdown_channel();
    let mut h = spawn_ingress(2, shutdown);

    for x in 0..3u64 {
        h.data.send(Message::Data {
            timestamp: Timestamp(x),
            payload: x * 10,
        })
        .unwrap();
    }
    h.data.send(Message::Watermark(Timestamp(3))).unwrap();

    for (replica, rx) in h.replicas.iter_mut() {
        for x in 0..3u64 {
            let item = next_item(rx).await;
            assert_eq!(item.seq(), SeqNum(x));
            assert_eq!(*item.payload(), x * 10);
            h.acks.send(Ack::new(item.seq(), *replica)).unwrap();
        }
        assert!(matches!(
            rx.recv().await,
            Some(Delivery::Watermark(Timestamp(3)))
        ));
    }

    drop(h.data);
    drop(h.acks);
    drop(h.control);
    let ingress = h.task.await.unwrap().unwrap();
    assert!(ingress.buffer().is_empty());
    assert_eq!(ingress.next_seq(), SeqNum(3));

    let status = h.status.borrow().clone().unwrap();
    assert_eq!(status.pending, 0);
    assert_eq!(status.next_seq, SeqNum(3));
}

#[tokio::test]
async fn failed_replica_is_cut_off_and_releases_its_debt() {
    let (_handle, shutdown) = super::shutdown_channel();
    let mut h = spawn_ingress(2, shutdown);

    h.data.send(Message::Data {
        timestamp: Timestamp(0),
        payload: 7,
    })
    .unwrap();
    let mut rx0 = h.replicas.remove(&ReplicaId(0)).unwrap();
    let mut rx1 = h.replicas.remove(&ReplicaId(1)).unwrap();
    let first = next_item(&mut rx1).await;
    assert_eq!(next_item(&mut rx0).await.seq(), first.seq());
    h.acks.send(Ack::new(first.seq(), ReplicaId(1))).unwrap();

    h.control
        .send(ControlCommand::ReplicaFailed(ReplicaId(0)))
        .unwrap();
    h.data.send(Message::Data {
        timestamp: Timestamp(1),
        payload: 8,
    })
    .unwrap();

    assert_eq!(next_item(&mut rx1).await.seq(), SeqNum(1));
    assert!(rx0.recv().await.is_none());

    drop(h.data);
    drop(h.acks);
    drop(h.control);
    let ingress = h.task.await.unwrap().unwrap();
    assert_eq!(ingress.buffer().replicas().len(), 1);
    let pending: Vec<_> = ingress
        .buffer()
        .unacked(&ReplicaId(1))
        .map(|item| item.seq())
        .collect();
    assert_eq!(pending, vec![SeqNum(1)]);
}

#[tokio::test]
async fn losing_the_last_replica_stops_the_ingress() {
    let (_handle, shutdown) = super::shutdown_channel();
    let h = spawn_ingress(1, shutdown);

    h.control
        .send(ControlCommand::ReplicaFailed(ReplicaId(0)))
        .unwrap();
    let res = h.task.await.unwrap();
    assert!(matches!(
        res,
        Err(ProtocolViolation::EmptyReplicaSet { .. })
    ));
}

#[tokio::test]
async fn shutdown_stops_an_idle_ingress() {
    let (handle, shutdown) = super::shutdown_channel();
    let h = spawn_ingress(2, shutdown);

    handle.trigger();
    let ingress = h.task.await.unwrap().unwrap();
    assert_eq!(ingress.next_seq(), SeqNum(0));
    drop(h.data);
}
