//! # Ordered concurrent pipeline
//!
//! One generator thread feeds tasks into a bounded queue that N workers drain.
//! Workers process tasks in parallel, but their outputs reach the sink in the
//! exact order the generator produced the tasks.
//!
//! Ordering comes from a ring of gates, one per worker slot:
//!
//! ```text
//!            claim (lock): slot id + first dequeue
//!                 │
//!   ┌─────────────▼─────────────┐
//!   │ process task              │
//!   │ wait on gate[slot]        │
//!   │ write output to sink      │
//!   │ dequeue next message      │
//!   │ open gate[(slot + 1) % N] │──┐
//!   └─────────────▲─────────────┘  │
//!                 └────────────────┘
//! ```
//!
//! Slot ids are claimed together with the first dequeue, so slot `i` always
//! holds message `i`, and every later message `k` lands on slot `k mod N`.
//! Gate 0 is only opened once the last slot has been claimed, so a fast first
//! worker can never write before the others exist. The generator ends a run by
//! pushing one stop marker per worker.
//!
//! The first failure aborts the run: the abort flag is raised, every gate is
//! woken, and the queue is drained so that the generator cannot stay blocked.

use std::{
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::{error::PipelineFailure, Error, Result, QUEUE_FACTOR};

/// A queue entry
pub enum Message<T> {
    Task(T),
    Stop,
}

/// Generator-side handle of the task queue
pub struct TaskSender<T> {
    sender: Sender<Message<T>>,
    abort: Arc<AtomicBool>,
}
impl<T> TaskSender<T> {
    /// Queues a task, blocking while the queue is full
    ///
    /// Returns `false` once the run has been aborted; the generator should
    /// return at that point.
    pub fn send(&self, task: T) -> bool {
        if self.is_aborted() {
            return false;
        }
        self.sender.send(Message::Task(task)).is_ok() && !self.is_aborted()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    fn stop(&self, count: usize) {
        for _ in 0..count {
            if self.is_aborted() || self.sender.send(Message::Stop).is_err() {
                break;
            }
        }
    }
}

/// Per-worker task processing
///
/// One processor is built per slot and never shared, so it may own scratch
/// buffers and decompression contexts.
pub trait TaskProcessor<T>: Send {
    /// Reusable output of one task
    type Output: Default + Send;

    /// Processes a task into `output`, replacing its previous contents
    fn process(&mut self, task: T, output: &mut Self::Output) -> Result<()>;
}

/// Receives outputs in task order, tagged with the worker slot that produced them
pub trait OutputSink<O>: Send {
    fn write(&mut self, slot: usize, output: &O) -> Result<()>;
}

/// Sink copying byte outputs into a writer
pub struct WriterSink<W: Write> {
    inner: W,
    bytes: usize,
}
impl<W: Write> WriterSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, bytes: 0 }
    }

    /// Number of bytes written so far
    #[must_use]
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
impl<W: Write + Send> OutputSink<Vec<u8>> for WriterSink<W> {
    fn write(&mut self, _slot: usize, output: &Vec<u8>) -> Result<()> {
        self.inner.write_all(output)?;
        self.bytes += output.len();
        Ok(())
    }
}

/// A release gate of one worker slot
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    signal: Condvar,
}
impl Gate {
    /// Waits until the gate opens and closes it again, `false` on abort
    fn pass(&self, abort: &AtomicBool) -> bool {
        let mut open = self.open.lock();
        while !*open && !abort.load(Ordering::Acquire) {
            self.signal.wait(&mut open);
        }
        if abort.load(Ordering::Acquire) {
            return false;
        }
        *open = false;
        true
    }

    fn release(&self) {
        *self.open.lock() = true;
        self.signal.notify_one();
    }

    fn wake(&self) {
        let _open = self.open.lock();
        self.signal.notify_all();
    }
}

/// State shared by every thread of a run
struct Shared {
    num_workers: usize,
    next_slot: Mutex<usize>,
    gates: Vec<Gate>,
    abort: Arc<AtomicBool>,
    failure: Mutex<Option<PipelineFailure>>,
}
impl Shared {
    fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            next_slot: Mutex::new(0),
            gates: (0..num_workers).map(|_| Gate::default()).collect(),
            abort: Arc::new(AtomicBool::new(false)),
            failure: Mutex::new(None),
        }
    }

    fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Records the first failure and tears the run down
    fn fail<T>(&self, failure: PipelineFailure, receiver: Option<&Receiver<Message<T>>>) {
        {
            let mut slot = self.failure.lock();
            if slot.is_none() {
                warn!("Aborting pipeline: {failure}");
                *slot = Some(failure);
            }
        }
        self.abort.store(true, Ordering::Release);
        for gate in &self.gates {
            gate.wake();
        }
        if let Some(receiver) = receiver {
            while receiver.try_recv().is_ok() {}
        }
    }
}

/// Raises the abort flag if its thread unwinds
struct PanicGuard<'a> {
    shared: &'a Shared,
    name: String,
}
impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.shared
                .fail::<()>(PipelineFailure::Panicked(self.name.clone()), None);
        }
    }
}

/// Ordered single-producer, multi-consumer executor
#[derive(Debug, Clone, Copy)]
pub struct Pipeline {
    num_workers: usize,
    queue_factor: usize,
}
impl Default for Pipeline {
    fn default() -> Self {
        Self::new(0)
    }
}
impl Pipeline {
    /// Creates a pipeline with `num_workers` workers (0 uses every core)
    #[must_use]
    pub fn new(num_workers: usize) -> Self {
        let num_workers = if num_workers == 0 {
            num_cpus::get()
        } else {
            num_workers
        };
        Self {
            num_workers: num_workers.max(1),
            queue_factor: QUEUE_FACTOR,
        }
    }

    /// Sets the queue capacity per worker
    #[must_use]
    pub fn queue_factor(mut self, queue_factor: usize) -> Self {
        self.queue_factor = queue_factor.max(1);
        self
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Runs the generator, workers, and sink to completion
    ///
    /// `factory` builds the processor of each worker slot. The sink is handed
    /// back once every output has been written.
    pub fn run<T, G, F, P, S>(&self, generator: G, factory: F, sink: S) -> Result<S>
    where
        T: Send,
        G: FnOnce(&TaskSender<T>) -> Result<()> + Send,
        F: Fn(usize) -> Result<P> + Sync,
        P: TaskProcessor<T>,
        S: OutputSink<P::Output>,
    {
        let num_workers = self.num_workers;
        let (sender, receiver) = bounded(self.queue_factor * num_workers);
        let shared = Shared::new(num_workers);
        let sink = Mutex::new(sink);

        debug!("Starting pipeline with {num_workers} workers");
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(num_workers + 1);

            for _ in 0..num_workers {
                let receiver = receiver.clone();
                let (shared, sink, factory) = (&shared, &sink, &factory);
                handles.push(scope.spawn(move || work(shared, receiver, factory, sink)));
            }
            drop(receiver);

            let task_sender = TaskSender {
                sender,
                abort: shared.abort.clone(),
            };
            let shared_ref = &shared;
            handles.push(scope.spawn(move || {
                let _guard = PanicGuard {
                    shared: shared_ref,
                    name: "generator".to_string(),
                };
                match generator(&task_sender) {
                    Ok(()) => task_sender.stop(shared_ref.num_workers),
                    Err(error) => {
                        shared_ref.fail::<T>(PipelineFailure::Generator(Box::new(error)), None);
                    }
                }
            }));

            for handle in handles {
                // panics are recorded by the guard of the panicking thread
                let _ = handle.join();
            }
        });

        if let Some(failure) = shared.failure.into_inner() {
            return Err(Error::from(failure));
        }
        Ok(sink.into_inner())
    }
}

fn work<T, F, P, S>(
    shared: &Shared,
    receiver: Receiver<Message<T>>,
    factory: &F,
    sink: &Mutex<S>,
) where
    F: Fn(usize) -> Result<P>,
    P: TaskProcessor<T>,
    S: OutputSink<P::Output>,
{
    let (slot, mut message) = {
        let mut next_slot = shared.next_slot.lock();
        let slot = *next_slot;
        *next_slot += 1;
        let message = receiver.recv().ok();
        if slot + 1 == shared.num_workers {
            shared.gates[0].release();
        }
        (slot, message)
    };
    let _guard = PanicGuard {
        shared,
        name: format!("worker {slot}"),
    };

    let mut processor = match factory(slot) {
        Ok(processor) => processor,
        Err(error) => {
            shared.fail(
                PipelineFailure::Worker {
                    slot,
                    source: Box::new(error),
                },
                Some(&receiver),
            );
            return;
        }
    };
    let mut output = P::Output::default();
    let next_gate = &shared.gates[(slot + 1) % shared.num_workers];

    while let Some(Message::Task(task)) = message {
        if shared.is_aborted() {
            break;
        }
        if let Err(error) = processor.process(task, &mut output) {
            shared.fail(
                PipelineFailure::Worker {
                    slot,
                    source: Box::new(error),
                },
                Some(&receiver),
            );
            break;
        }
        if !shared.gates[slot].pass(&shared.abort) {
            break;
        }
        if let Err(error) = sink.lock().write(slot, &output) {
            shared.fail(
                PipelineFailure::Sink {
                    slot,
                    source: Box::new(error),
                },
                Some(&receiver),
            );
            break;
        }
        message = receiver.recv().ok();
        next_gate.release();
    }

    if shared.is_aborted() {
        while receiver.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;
    use crate::error::BoundsError;

    /// Formats a task after a random delay
    struct DelayedFormatter {
        rng: SmallRng,
        fail_on: Option<usize>,
        panic_on: Option<usize>,
    }
    impl TaskProcessor<usize> for DelayedFormatter {
        type Output = Vec<u8>;
        fn process(&mut self, task: usize, output: &mut Vec<u8>) -> Result<()> {
            thread::sleep(Duration::from_micros(self.rng.random_range(0..2_000)));
            if self.fail_on == Some(task) {
                return Err(BoundsError::VariantOutOfRange {
                    requested_index: task,
                    max_index: 0,
                }
                .into());
            }
            assert!(self.panic_on != Some(task), "task {task} panicked");
            output.clear();
            output.extend_from_slice(format!("task {task}\n").as_bytes());
            Ok(())
        }
    }

    fn formatter(
        fail_on: Option<usize>,
        panic_on: Option<usize>,
    ) -> impl Fn(usize) -> Result<DelayedFormatter> + Sync {
        move |slot| {
            Ok(DelayedFormatter {
                rng: SmallRng::seed_from_u64(slot as u64 * 31 + 7),
                fail_on,
                panic_on,
            })
        }
    }

    fn expected(num_tasks: usize) -> Vec<u8> {
        (0..num_tasks)
            .flat_map(|task| format!("task {task}\n").into_bytes())
            .collect()
    }

    fn run_tasks(num_workers: usize, num_tasks: usize) -> Result<Vec<u8>> {
        let sink = Pipeline::new(num_workers).run(
            |sender: &TaskSender<usize>| {
                for task in 0..num_tasks {
                    if !sender.send(task) {
                        break;
                    }
                }
                Ok(())
            },
            formatter(None, None),
            WriterSink::new(Vec::new()),
        )?;
        Ok(sink.into_inner())
    }

    // ==================== Ordering Tests ====================

    #[test]
    fn test_ordered_output_under_random_delays() {
        for num_workers in [1, 2, 3, 8] {
            for num_tasks in [0, 1, 2, 7, 64] {
                let output = run_tasks(num_workers, num_tasks).unwrap();
                assert_eq!(
                    output,
                    expected(num_tasks),
                    "workers={num_workers} tasks={num_tasks}"
                );
            }
        }
    }

    #[test]
    fn test_more_tasks_than_queue_capacity() {
        let output = Pipeline::new(2)
            .queue_factor(1)
            .run(
                |sender: &TaskSender<usize>| {
                    for task in 0..200 {
                        sender.send(task);
                    }
                    Ok(())
                },
                formatter(None, None),
                WriterSink::new(Vec::new()),
            )
            .unwrap()
            .into_inner();
        assert_eq!(output, expected(200));
    }

    #[test]
    fn test_sink_sees_round_robin_slots() {
        struct SlotSink(Vec<usize>);
        impl OutputSink<Vec<u8>> for SlotSink {
            fn write(&mut self, slot: usize, _output: &Vec<u8>) -> Result<()> {
                self.0.push(slot);
                Ok(())
            }
        }

        let sink = Pipeline::new(3)
            .run(
                |sender: &TaskSender<usize>| {
                    (0..10).for_each(|task| {
                        sender.send(task);
                    });
                    Ok(())
                },
                formatter(None, None),
                SlotSink(Vec::new()),
            )
            .unwrap();
        assert_eq!(sink.0, (0..10).map(|task| task % 3).collect::<Vec<_>>());
    }

    // ==================== Failure Tests ====================

    #[test]
    fn test_worker_error_aborts_run() {
        let err = Pipeline::new(4)
            .queue_factor(1)
            .run(
                |sender: &TaskSender<usize>| {
                    for task in 0..10_000 {
                        if !sender.send(task) {
                            break;
                        }
                    }
                    Ok(())
                },
                formatter(Some(25), None),
                WriterSink::new(Vec::new()),
            )
            .err()
            .unwrap();
        assert!(err.is_pipeline_failure());
        assert!(matches!(
            err,
            Error::PipelineFailure(PipelineFailure::Worker { .. })
        ));
    }

    #[test]
    fn test_generator_error_aborts_run() {
        let err = Pipeline::new(3)
            .run(
                |sender: &TaskSender<usize>| {
                    for task in 0..5 {
                        sender.send(task);
                    }
                    Err(BoundsError::MissingChromosome(9).into())
                },
                formatter(None, None),
                WriterSink::new(Vec::new()),
            )
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::PipelineFailure(PipelineFailure::Generator(_))
        ));
    }

    #[test]
    fn test_worker_panic_aborts_run() {
        let err = Pipeline::new(2)
            .run(
                |sender: &TaskSender<usize>| {
                    for task in 0..50 {
                        if !sender.send(task) {
                            break;
                        }
                    }
                    Ok(())
                },
                formatter(None, Some(3)),
                WriterSink::new(Vec::new()),
            )
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::PipelineFailure(PipelineFailure::Panicked(_))
        ));
    }

    #[test]
    fn test_factory_error_aborts_run() {
        let err = Pipeline::new(2)
            .run(
                |sender: &TaskSender<usize>| {
                    for task in 0..20 {
                        if !sender.send(task) {
                            break;
                        }
                    }
                    Ok(())
                },
                |slot: usize| -> Result<DelayedFormatter> {
                    Err(BoundsError::SubjectOutOfRange {
                        requested_index: slot,
                        max_index: 0,
                    }
                    .into())
                },
                WriterSink::new(Vec::new()),
            )
            .err()
            .unwrap();
        assert!(err.is_pipeline_failure());
    }

    #[test]
    fn test_shared_counter_sees_every_task() {
        struct Counter(Arc<Mutex<usize>>);
        impl TaskProcessor<usize> for Counter {
            type Output = Vec<u8>;
            fn process(&mut self, _task: usize, output: &mut Vec<u8>) -> Result<()> {
                *self.0.lock() += 1;
                output.clear();
                Ok(())
            }
        }

        let count = Arc::new(Mutex::new(0));
        Pipeline::new(0)
            .run(
                |sender: &TaskSender<usize>| {
                    (0..100).for_each(|task| {
                        sender.send(task);
                    });
                    Ok(())
                },
                |_slot| Ok(Counter(count.clone())),
                WriterSink::new(std::io::sink()),
            )
            .unwrap();
        assert_eq!(*count.lock(), 100);
    }
}
