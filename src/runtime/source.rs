use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::checkpoint::CheckpointingSource;
use crate::checkpoint::SourceStatus;
use crate::config::TickInterval;
use crate::errors::prepend_tname;
use crate::errors::ProtocolViolation;
use crate::metrics::SourceMetrics;
use crate::model::ControlCommand;
use crate::model::Message;
use crate::progress::ProgressResetter;
use crate::with_timer;

use super::Shutdown;

enum Event {
    Shutdown,
    Control(Option<ControlCommand>),
    Tick,
}

/// Tick a source on a timer and forward what it emits.
///
/// Ticks stop while the source is terminated, but control commands
/// are still handled, so a rollback can start it up again. The task
/// ends on shutdown, when `output` is closed, or once the source is
/// terminated and `control` is closed.
#[tracing::instrument(name = "source", skip_all, fields(operator = %name))]
pub async fn run_source<R>(
    name: String,
    mut source: CheckpointingSource<R>,
    mut control: UnboundedReceiver<ControlCommand>,
    output: UnboundedSender<Message<u64>>,
    interval: TickInterval,
    status: watch::Sender<Option<SourceStatus>>,
    mut shutdown: Shutdown,
) -> Result<CheckpointingSource<R>, ProtocolViolation>
where
    R: ProgressResetter,
{
    let metrics = SourceMetrics::new(&name);
    let mut ticker = tokio::time::interval(interval.as_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut control_open = true;

    tracing::info!("Source {name} started");
    status.send_replace(Some(source.status()));
    'run: loop {
        let running = !source.is_terminated();
        if !running && !control_open {
            break;
        }

        let event = tokio::select! {
            biased;
            _ = shutdown.wait() => Event::Shutdown,
            cmd = control.recv(), if control_open => Event::Control(cmd),
            _ = ticker.tick(), if running => Event::Tick,
        };

        match event {
            Event::Shutdown => {
                tracing::info!("Source {name} shutting down");
                break;
            }
            Event::Control(None) => control_open = false,
            Event::Control(Some(cmd)) => {
                let res = with_timer!(
                    metrics.rollback_histogram,
                    metrics.labels,
                    source.on_control(cmd)
                );
                match res {
                    Ok(Some(_)) => metrics.rollback_count.add(1, &metrics.labels),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(
                            "{}",
                            prepend_tname(format!("Source {name} stopped: {err}"))
                        );
                        return Err(err);
                    }
                }
            }
            Event::Tick => {
                let emission =
                    with_timer!(metrics.tick_histogram, metrics.labels, source.tick())?;
                if let Some(emission) = emission {
                    for msg in emission.messages() {
                        if output.send(msg).is_err() {
                            tracing::info!("Downstream of source {name} hung up");
                            break 'run;
                        }
                    }
                    metrics.item_out_count.add(1, &metrics.labels);
                    if emission.checkpoint.is_some() {
                        metrics.checkpoint_count.add(1, &metrics.labels);
                    }
                }
            }
        }
        status.send_replace(Some(source.status()));
    }

    status.send_replace(Some(source.status()));
    tracing::info!("Source {name} finished at {}", source.next_seq());
    Ok(source)
}

#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
use tokio::sync::mpsc;

#[cfg(test)]
use crate::checkpoint::SourceState;
#[cfg(test)]
use crate::config::SourceConfig;
#[cfg(test)]
use crate::model::SeqNum;
#[cfg(test)]
use crate::model::Timestamp;
#[cfg(test)]
use crate::progress::ChannelResetter;

#[cfg(test)]
type SourceTask = tokio::task::JoinHandle<Result<CheckpointingSource<ChannelResetter>, ProtocolViolation>>;

#[cfg(test)]
struct Harness {
    control: UnboundedSender<ControlCommand>,
    output: UnboundedReceiver<Message<u64>>,
    resets: UnboundedReceiver<Timestamp>,
    status: watch::Receiver<Option<SourceStatus>>,
    task: SourceTask,
}

#[cfg(test)]
fn spawn_source(num_messages: u64, shutdown: Shutdown) -> Harness {
    let config = SourceConfig {
        checkpoint_freq: 2,
        window_size: 3,
        num_messages,
        tick_interval_ms: 1,
        max_checkpoints: None,
    };
    let (resets_tx, resets) = mpsc::unbounded_channel();
    let source = CheckpointingSource::new(&config, ChannelResetter::new(resets_tx)).unwrap();
    let (control_tx, control) = mpsc::unbounded_channel();
    let (output_tx, output) = mpsc::unbounded_channel();
    let (status_tx, status) = super::status_channel();
    let task = tokio::spawn(run_source(
        "test_source".to_string(),
        source,
        control,
        output_tx,
        TickInterval::new(Duration::from_millis(1)),
        status_tx,
        shutdown,
    ));
    Harness {
        control: control_tx,
        output,
        resets,
        status,
        task,
    }
}

/// Read `n` data/watermark pairs and return their sequence numbers.
#[cfg(test)]
async fn read_pairs(rx: &mut UnboundedReceiver<Message<u64>>, n: usize) -> Vec<u64> {
    let mut seqs = Vec::new();
    for _ in 0..n {
        let data = rx.recv().await.unwrap();
        let watermark = rx.recv().await.unwrap();
        assert!(!data.is_watermark());
        assert!(watermark.is_watermark());
        assert_eq!(data.timestamp(), watermark.timestamp());
        seqs.push(data.timestamp().0);
    }
    seqs
}

#[tokio::test]
async fn emits_until_terminated_then_rolls_back_on_command() {
    let (_handle, shutdown) = super::shutdown_channel();
    let mut h = spawn_source(6, shutdown);

    assert_eq!(read_pairs(&mut h.output, 6).await, vec![1, 2, 3, 4, 5, 6]);

    h.control
        .send(ControlCommand::Rollback(Some(SeqNum(4))))
        .unwrap();
    assert_eq!(read_pairs(&mut h.output, 2).await, vec![5, 6]);
    assert_eq!(h.resets.recv().await, Some(Timestamp(4)));

    drop(h.control);
    let source = h.task.await.unwrap().unwrap();
    assert_eq!(source.state(), SourceState::Terminated);
    assert_eq!(
        source.checkpoints().keys().collect::<Vec<_>>(),
        vec![SeqNum(2), SeqNum(4), SeqNum(6)]
    );
    assert!(h.output.recv().await.is_none());

    let status = h.status.borrow().clone().unwrap();
    assert_eq!(status.rollbacks, 1);
    assert_eq!(status.state, SourceState::Terminated);
}

#[tokio::test]
async fn unknown_checkpoint_stops_the_source() {
    let (_handle, shutdown) = super::shutdown_channel();
    let mut h = spawn_source(2, shutdown);

    assert_eq!(read_pairs(&mut h.output, 2).await, vec![1, 2]);
    h.control
        .send(ControlCommand::Rollback(Some(SeqNum(1))))
        .unwrap();
    let res = h.task.await.unwrap();
    assert!(matches!(
        res,
        Err(ProtocolViolation::UnknownCheckpoint { .. })
    ));
}

#[tokio::test]
async fn shutdown_stops_a_running_source() {
    let (handle, shutdown) = super::shutdown_channel();
    let mut h = spawn_source(u64::MAX, shutdown);

    assert_eq!(read_pairs(&mut h.output, 3).await, vec![1, 2, 3]);
    handle.trigger();
    let source = h.task.await.unwrap().unwrap();
    assert_eq!(source.state(), SourceState::Running);
    drop(h.control);
}
