use std::{
    io,
    marker::PhantomData,
    num::{NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    sync::{Arc, mpsc},
    thread::{self, JoinHandle},
};

use comms::specs::OptimizerSpec;
use log::{debug, info};
use parameter_server::{
    optimization::{self, Optimizer},
    service::panic_message,
};
use parking_lot::Mutex;

use crate::{
    Result, WorkerErr,
    model::{Batch, BatchStats, Model, ModelStats},
    overlap::CommOverlapManager,
    replica::{ClientReplica, GradSum},
    sync::Synchronizer,
};

/// The options of a single client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The global id of the client.
    pub client: usize,
    /// Whether to synchronize on a background thread.
    pub overlap: bool,
    /// The amount of steps between commits in overlap mode.
    pub max_compute_iters: NonZeroUsize,
    /// Commits early once the overlap buffer holds this many words.
    pub commit_words: Option<NonZeroU64>,
    /// The amount of steps accumulated before each synchronization otherwise.
    pub tau: NonZeroUsize,
    /// The decay of the parameter moving average, `None` to not keep one.
    pub moving_decay: Option<f32>,
    /// The optimizer applied to the replica between commits in overlap mode.
    pub local_optimizer: Option<OptimizerSpec>,
    /// The batch size the learning rates were tuned for.
    pub batch_words_ref: Option<NonZeroUsize>,
    /// The lock shared by every communication thread of the node, if any.
    pub single_comm: Option<Arc<Mutex<()>>>,
}

impl ClientConfig {
    /// A dense, non overlapping client without extras.
    pub fn new(client: usize) -> Self {
        Self {
            client,
            overlap: false,
            max_compute_iters: NonZeroUsize::MIN,
            commit_words: None,
            tau: NonZeroUsize::MIN,
            moving_decay: None,
            local_optimizer: None,
            batch_words_ref: None,
            single_comm: None,
        }
    }
}

/// How the client reaches the shards.
enum Comm {
    Direct(Box<dyn Synchronizer>),
    Overlap {
        manager: CommOverlapManager,
        local: Option<Box<dyn Optimizer + Send>>,
    },
    /// The overlap thread was stopped and handed the synchronizer back.
    Drained(Box<dyn Synchronizer>),
    /// Left behind while switching modes, only seen after a failed drain.
    Placeholder,
}

/// What a client leaves behind once finished.
#[derive(Debug)]
pub struct ClientOutcome<M> {
    pub client: usize,
    /// The parameters of the final pull, identical on every client.
    pub params: Vec<f32>,
    /// The parameters to checkpoint, the moving average if one was kept.
    pub checkpoint: Vec<f32>,
    pub stats: ModelStats,
    pub model: M,
}

/// One device's training loop: computes gradients and keeps its replica in sync.
pub struct ClientWorker<B, M> {
    client: usize,
    interval: usize,
    commit_words: Option<u64>,
    model: M,
    replica: ClientReplica,
    sum: GradSum,
    comm: Comm,
    _batch: PhantomData<fn(&B)>,
}

impl<B: Batch, M: Model<B>> ClientWorker<B, M> {
    /// Creates a new `ClientWorker`.
    ///
    /// # Arguments
    /// * `config` - The options of the client.
    /// * `model` - The model replica on the client's device.
    /// * `params` - The initial global parameters.
    /// * `sync` - The synchronizer with every shard.
    ///
    /// # Returns
    /// A `WorkerErr::Config` if the model and the parameters disagree in size, or an io
    /// error if the communication thread couldn't be spawned.
    pub fn new(
        config: ClientConfig,
        model: M,
        params: Vec<f32>,
        sync: Box<dyn Synchronizer>,
    ) -> Result<Self> {
        let client = config.client;
        if model.size() != params.len() {
            return Err(WorkerErr::Config(format!(
                "client {client} got {} parameters for a model of {}",
                params.len(),
                model.size()
            )));
        }

        let len = params.len();
        let commit_words = config
            .commit_words
            .filter(|_| config.overlap)
            .map(NonZeroU64::get);

        let (interval, comm) = if config.overlap {
            let manager = CommOverlapManager::spawn(client, sync, &params, config.single_comm)?;
            let local = config
                .local_optimizer
                .map(|spec| optimization::boxed(spec, len, config.batch_words_ref));

            (config.max_compute_iters, Comm::Overlap { manager, local })
        } else {
            (config.tau, Comm::Direct(sync))
        };

        Ok(Self {
            client,
            interval: interval.get(),
            commit_words,
            model,
            replica: ClientReplica::new(params, config.moving_decay),
            sum: GradSum::new(len),
            comm,
            _batch: PhantomData,
        })
    }

    pub fn client(&self) -> usize {
        self.client
    }

    pub fn params(&self) -> &[f32] {
        &self.replica.params
    }

    /// Trains on one batch, synchronizing when the interval is reached.
    pub fn step(&mut self, batch: &B) -> Result<BatchStats> {
        let stats = self
            .model
            .compute_gradients(batch, &self.replica.params, &mut self.replica.grad)
            .map_err(WorkerErr::Model)?;

        let words = batch.words();
        self.sum.add(&self.replica.grad, words)?;
        let due = self.sum.steps >= self.interval
            || self.commit_words.is_some_and(|words| self.sum.words >= words);

        match &mut self.comm {
            Comm::Overlap { manager, local } => {
                if due {
                    manager.commit(&mut self.sum, &mut self.replica.params)?;
                    self.replica.synchronized()?;
                }

                if let Some(optimizer) = local {
                    optimizer.update_params(&self.replica.grad, &mut self.replica.params, words)?;
                }
            }
            Comm::Direct(sync) | Comm::Drained(sync) => {
                if due {
                    synchronize(sync, &mut self.sum, &mut self.replica)?;
                }
            }
            Comm::Placeholder => return Err(self.lost()),
        }

        Ok(stats)
    }

    /// Flushes whatever wasn't synchronized yet and stops the communication thread.
    ///
    /// Steps after a drain synchronize directly.
    pub fn drain(&mut self) -> Result<()> {
        let comm = std::mem::replace(&mut self.comm, Comm::Placeholder);
        self.comm = match comm {
            Comm::Overlap { mut manager, .. } => {
                if !self.sum.is_empty() {
                    manager.commit(&mut self.sum, &mut self.replica.params)?;
                }

                let (sync, last) = manager.stop()?;
                self.replica.params.copy_from_slice(&last);
                self.replica.synchronized()?;
                Comm::Drained(sync)
            }
            Comm::Direct(mut sync) | Comm::Drained(mut sync) => {
                if !self.sum.is_empty() {
                    synchronize(&mut sync, &mut self.sum, &mut self.replica)?;
                }

                Comm::Drained(sync)
            }
            Comm::Placeholder => return Err(self.lost()),
        };

        debug!(client = self.client; "drained");
        Ok(())
    }

    fn lost(&self) -> WorkerErr {
        WorkerErr::Disconnected(format!("client {} lost its synchronizer", self.client))
    }

    /// Writes the checkpoint parameters of the replica at `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.model
            .save(path, self.replica.checkpoint())
            .map_err(WorkerErr::Model)
    }

    pub fn stats(&self) -> ModelStats {
        self.model.collect_stats()
    }

    /// Drains and pulls the final parameters of every shard.
    ///
    /// Every node must have announced it finished for the shards to answer.
    pub fn finish(mut self) -> Result<ClientOutcome<M>> {
        self.drain()?;

        let Comm::Drained(sync) = &mut self.comm else {
            return Err(self.lost());
        };

        sync.pull(&mut self.replica.params)?;
        info!(client = self.client; "pulled the final parameters");

        Ok(ClientOutcome {
            client: self.client,
            checkpoint: self.replica.checkpoint().to_vec(),
            stats: self.model.collect_stats(),
            params: self.replica.params,
            model: self.model,
        })
    }
}

/// Synchronizes the accumulated gradient directly.
fn synchronize(
    sync: &mut Box<dyn Synchronizer>,
    sum: &mut GradSum,
    replica: &mut ClientReplica,
) -> Result<()> {
    sync.synchronize(&sum.sum, &mut replica.params, sum.words, None)?;
    sum.clear();
    replica.synchronized()?;
    Ok(())
}

/// The requests a client thread serves, in order.
pub enum ClientCommand<B> {
    Step(B),
    Save {
        path: PathBuf,
        reply: mpsc::Sender<()>,
    },
    Stats {
        reply: mpsc::Sender<ModelStats>,
    },
    Drain {
        reply: mpsc::Sender<()>,
    },
}

/// The handle to a client running on its own thread.
///
/// Replies only acknowledge success, a failed thread exits and its error is returned by
/// whichever call notices it first.
pub struct ClientHandle<B, M> {
    client: usize,
    tx: Option<mpsc::SyncSender<ClientCommand<B>>>,
    handle: Option<JoinHandle<Result<ClientOutcome<M>>>>,
}

impl<B: Batch, M: Model<B>> ClientHandle<B, M> {
    /// Moves `worker` onto its own thread.
    ///
    /// # Arguments
    /// * `worker` - The client to run.
    /// * `capacity` - The amount of commands that can be queued before senders block.
    ///
    /// # Returns
    /// The handle or an io error if the thread couldn't be spawned.
    pub fn spawn(worker: ClientWorker<B, M>, capacity: usize) -> io::Result<Self> {
        let client = worker.client();
        let (tx, rx) = mpsc::sync_channel(capacity);

        let handle = thread::Builder::new()
            .name(format!("client-{client}"))
            .spawn(move || serve(worker, rx))?;

        Ok(Self {
            client,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn client(&self) -> usize {
        self.client
    }

    /// Queues a training step.
    pub fn step(&mut self, batch: B) -> Result<()> {
        self.send(ClientCommand::Step(batch))
    }

    /// Saves a checkpoint and waits until it's written.
    pub fn save(&mut self, path: PathBuf) -> Result<()> {
        let (reply, ack) = mpsc::channel();
        self.send(ClientCommand::Save { path, reply })?;
        self.wait(ack)
    }

    pub fn stats(&mut self) -> Result<ModelStats> {
        let (reply, ack) = mpsc::channel();
        self.send(ClientCommand::Stats { reply })?;
        self.wait(ack)
    }

    /// Waits until every queued step ran and was synchronized.
    pub fn drain(&mut self) -> Result<()> {
        let (reply, ack) = mpsc::channel();
        self.send(ClientCommand::Drain { reply })?;
        self.wait(ack)
    }

    /// Closes the command channel, letting the client pull and exit.
    pub fn finish(mut self) -> Result<ClientOutcome<M>> {
        self.tx = None;
        self.join()
    }

    fn send(&mut self, command: ClientCommand<B>) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(self.gone());
        };

        if tx.send(command).is_err() {
            return Err(self.failure());
        }

        Ok(())
    }

    fn wait<T>(&mut self, ack: mpsc::Receiver<T>) -> Result<T> {
        ack.recv().map_err(|_| self.failure())
    }

    fn join(&mut self) -> Result<ClientOutcome<M>> {
        let Some(handle) = self.handle.take() else {
            return Err(self.gone());
        };

        handle
            .join()
            .map_err(|panic| WorkerErr::Disconnected(panic_message(&*panic)))?
    }

    /// Collects the error the client thread stopped with.
    fn failure(&mut self) -> WorkerErr {
        self.tx = None;

        match self.join() {
            Err(e) => e,
            Ok(_) => self.gone(),
        }
    }

    fn gone(&self) -> WorkerErr {
        WorkerErr::Disconnected(format!("client {} is no longer running", self.client))
    }
}

/// Runs commands until the channel closes, then finishes the client.
fn serve<B: Batch, M: Model<B>>(
    mut worker: ClientWorker<B, M>,
    rx: mpsc::Receiver<ClientCommand<B>>,
) -> Result<ClientOutcome<M>> {
    info!(client = worker.client(); "client started");

    for command in rx {
        match command {
            ClientCommand::Step(batch) => {
                let stats = worker.step(&batch)?;
                debug!(client = worker.client(), loss = stats.loss; "step done");
            }
            ClientCommand::Save { path, reply } => {
                worker.save(&path)?;
                let _ = reply.send(());
            }
            ClientCommand::Stats { reply } => {
                let _ = reply.send(worker.stats());
            }
            ClientCommand::Drain { reply } => {
                worker.drain()?;
                let _ = reply.send(());
            }
        }
    }

    worker.finish()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::model::ModelErr;

    struct Words(u64);

    impl Batch for Words {
        fn words(&self) -> u64 {
            self.0
        }

        fn size(&self) -> usize {
            1
        }
    }

    /// Writes a gradient of ones, fails on batches of zero words.
    #[derive(Default)]
    struct Ones {
        stats: ModelStats,
        saved: Arc<Mutex<Vec<Vec<f32>>>>,
    }

    impl Model<Words> for Ones {
        fn size(&self) -> usize {
            2
        }

        fn compute_gradients(
            &mut self,
            batch: &Words,
            _: &[f32],
            grad: &mut [f32],
        ) -> std::result::Result<BatchStats, ModelErr> {
            if batch.0 == 0 {
                return Err("empty batch".into());
            }

            grad.fill(1.);
            let stats = BatchStats {
                loss: 1.,
                words: batch.0,
            };

            self.stats.record(stats);
            Ok(stats)
        }

        fn save(&self, _: &Path, params: &[f32]) -> std::result::Result<(), ModelErr> {
            self.saved.lock().push(params.to_vec());
            Ok(())
        }

        fn load(&self, _: &Path) -> std::result::Result<Vec<f32>, ModelErr> {
            Ok(vec![0.; 2])
        }

        fn collect_stats(&self) -> ModelStats {
            self.stats
        }
    }

    type Calls = Arc<Mutex<Vec<(Vec<f32>, u64)>>>;

    /// Subtracts the gradient from the parameters, recording every exchange.
    struct Recorder {
        calls: Calls,
    }

    impl Synchronizer for Recorder {
        fn synchronize(
            &mut self,
            grad: &[f32],
            params: &mut [f32],
            batch_words: u64,
            _: Option<&Mutex<()>>,
        ) -> Result<()> {
            self.calls.lock().push((grad.to_vec(), batch_words));
            params.iter_mut().zip(grad).for_each(|(p, g)| *p -= g);
            Ok(())
        }

        fn pull(&mut self, params: &mut [f32]) -> Result<()> {
            params.fill(7.);
            Ok(())
        }
    }

    fn recorder() -> (Box<dyn Synchronizer>, Calls) {
        let calls = Calls::default();
        let sync = Recorder {
            calls: Arc::clone(&calls),
        };

        (Box::new(sync), calls)
    }

    #[test]
    fn accumulates_tau_steps() {
        let (sync, calls) = recorder();
        let mut config = ClientConfig::new(0);
        config.tau = NonZeroUsize::new(2).unwrap();

        let mut worker = ClientWorker::new(config, Ones::default(), vec![0.; 2], sync).unwrap();
        for words in [3, 4, 5] {
            worker.step(&Words(words)).unwrap();
        }

        assert_eq!(*calls.lock(), [(vec![2., 2.], 7)]);
        assert_eq!(worker.params(), [-2., -2.]);

        worker.drain().unwrap();
        assert_eq!(calls.lock()[1], (vec![1., 1.], 5));
        assert_eq!(worker.params(), [-3., -3.]);
    }

    #[test]
    fn overlap_commits_and_applies_the_local_optimizer() {
        let (sync, calls) = recorder();
        let mut config = ClientConfig::new(0);
        config.overlap = true;
        config.max_compute_iters = NonZeroUsize::new(2).unwrap();
        config.local_optimizer = Some(OptimizerSpec::GradientDescent { learning_rate: 0.5 });

        let mut worker = ClientWorker::new(config, Ones::default(), vec![0.; 2], sync).unwrap();

        worker.step(&Words(1)).unwrap();
        assert_eq!(worker.params(), [-0.5, -0.5]);

        // The commit adopts the initial snapshot before the local step.
        worker.step(&Words(1)).unwrap();
        assert_eq!(worker.params(), [-0.5, -0.5]);

        let outcome = worker.finish().unwrap();
        assert_eq!(*calls.lock(), [(vec![2., 2.], 2)]);
        assert_eq!(outcome.params, [7., 7.]);
        assert_eq!(outcome.stats.batches, 2);
    }

    #[test]
    fn overlap_commits_early_on_words() {
        let (sync, calls) = recorder();
        let mut config = ClientConfig::new(0);
        config.overlap = true;
        config.max_compute_iters = NonZeroUsize::new(10).unwrap();
        config.commit_words = NonZeroU64::new(5);

        let mut worker = ClientWorker::new(config, Ones::default(), vec![0.; 2], sync).unwrap();
        worker.step(&Words(3)).unwrap();
        worker.step(&Words(3)).unwrap();

        let outcome = worker.finish().unwrap();
        assert_eq!(*calls.lock(), [(vec![2., 2.], 6)]);
        assert_eq!(outcome.stats.words, 6);
    }

    #[test]
    fn saves_the_moving_average() {
        let (sync, _) = recorder();
        let mut config = ClientConfig::new(0);
        config.moving_decay = Some(0.5);

        let model = Ones::default();
        let saved = Arc::clone(&model.saved);

        let mut worker = ClientWorker::new(config, model, vec![0.; 2], sync).unwrap();
        worker.step(&Words(1)).unwrap();
        worker.save(Path::new("model.bin")).unwrap();

        // d = min(0.5, 1 / 10)
        let expected = -0.9;
        assert!(saved.lock()[0].iter().all(|p| (p - expected).abs() < 1e-6));
    }

    #[test]
    fn rejects_a_model_of_another_size() {
        let (sync, _) = recorder();
        let res = ClientWorker::new(ClientConfig::new(0), Ones::default(), vec![0.; 3], sync);
        assert!(matches!(res, Err(WorkerErr::Config(_))));
    }

    #[test]
    fn thread_reports_model_failures() {
        let (sync, _) = recorder();
        let worker = ClientWorker::new(ClientConfig::new(3), Ones::default(), vec![0.; 2], sync)
            .unwrap();

        let mut handle = ClientHandle::spawn(worker, 1).unwrap();
        handle.step(Words(2)).unwrap();
        assert_eq!(handle.stats().unwrap().batches, 1);

        handle.step(Words(0)).unwrap();
        let err = handle.drain().unwrap_err();
        assert!(matches!(err, WorkerErr::Model(_)));
    }

    #[test]
    fn thread_pulls_on_finish() {
        let (sync, calls) = recorder();
        let worker = ClientWorker::new(ClientConfig::new(1), Ones::default(), vec![0.; 2], sync)
            .unwrap();

        let mut handle = ClientHandle::spawn(worker, 4).unwrap();
        handle.step(Words(1)).unwrap();
        handle.drain().unwrap();

        let outcome = handle.finish().unwrap();
        assert_eq!(outcome.client, 1);
        assert_eq!(outcome.params, [7., 7.]);
        assert_eq!(calls.lock().len(), 1);
    }
}
