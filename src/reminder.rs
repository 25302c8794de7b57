use crate::clock::Clock;
use crate::ids::StreamId;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

enum Command {
    Update(StreamId),
    Clear(StreamId),
}

/// Tracks streams that need periodic attention. A stream that is updated regularly (at
///  intervals below `min`) is never signalled; once it goes quiet, it appears in a signal batch
///  within `[min, min + max]` of its last update and is then re-stamped so it won't be signalled
///  again until another `min` of silence has passed.
///
/// The reminder owns its scheduling in a spawned task; callers interact purely through message
///  passing, so there is no shared state to lock. Dropping the handle shuts the task down.
pub struct StreamReminder {
    commands: mpsc::UnboundedSender<Command>,
    signals: mpsc::UnboundedReceiver<Vec<StreamId>>,
    task: JoinHandle<()>,
}

impl Drop for StreamReminder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl StreamReminder {
    pub fn new(min: Duration, max: Duration, clock: Arc<dyn Clock>) -> StreamReminder {
        assert!(min < max, "reminder min bound must be below the max bound");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_reminder(min, max, clock, command_rx, signal_tx));

        StreamReminder {
            commands: command_tx,
            signals: signal_rx,
            task,
        }
    }

    /// Records activity on the stream, deferring its next signal.
    pub fn update(&self, stream: StreamId) {
        let _ = self.commands.send(Command::Update(stream));
    }

    /// Forgets the stream; it will not be signalled again until re-updated.
    pub fn clear(&self, stream: StreamId) {
        let _ = self.commands.send(Command::Clear(stream));
    }

    /// The next batch of quiescent streams, or None once the reminder has shut down.
    pub async fn recv(&mut self) -> Option<Vec<StreamId>> {
        self.signals.recv().await
    }
}

async fn run_reminder(
    min: Duration,
    max: Duration,
    clock: Arc<dyn Clock>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    signals: mpsc::UnboundedSender<Vec<StreamId>>,
) {
    // last update time per stream; a tick is scheduled whenever this is non-empty
    let mut active: FxHashMap<StreamId, Instant> = FxHashMap::default();
    let mut next_tick: Option<Instant> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Update(stream)) => {
                    let now = clock.now();
                    active.insert(stream, now);
                    if next_tick.is_none() {
                        next_tick = Some(now + max);
                    }
                }
                Some(Command::Clear(stream)) => {
                    active.remove(&stream);
                    if active.is_empty() {
                        next_tick = None;
                    }
                }
                None => return,
            },

            _ = sleep_until_opt(clock.as_ref(), next_tick), if next_tick.is_some() => {
                let now = clock.now();
                let mut due = active
                    .iter()
                    .filter(|&(_, &at)| now - at > min)
                    .map(|(&stream, _)| stream)
                    .collect::<Vec<_>>();
                for &stream in &due {
                    active.insert(stream, now);
                }
                next_tick = if active.is_empty() { None } else { Some(now + max) };
                if !due.is_empty() {
                    due.sort_unstable();
                    if signals.send(due).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn sleep_until_opt(clock: &dyn Clock, deadline: Option<Instant>) {
    match deadline {
        Some(at) => clock.sleep_until(at).await,
        None => std::future::pending().await,
    }
}
