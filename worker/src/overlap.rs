//! Communication in the background while the client keeps computing.

use std::{
    io, mem,
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, warn};
use parameter_server::{service::panic_message, storage::SizeMismatchErr};
use parking_lot::{Condvar, Mutex};

use crate::{Result, WorkerErr, replica::GradSum, sync::Synchronizer};

/// The half of the double buffer the communication thread drains.
#[derive(Debug)]
struct Slot {
    filled: bool,
    stop: bool,
    failed: bool,
    grad: Vec<f32>,
    params: Vec<f32>,
    words: u64,
}

/// The hand-off point between a client and its communication thread.
#[derive(Debug)]
struct CommBuffer {
    slot: Mutex<Slot>,
    cond: Condvar,
}

/// Owns the communication thread of one client.
///
/// The client fills its own gradient sum and swaps it into the buffer once enough steps
/// were computed, getting back the parameters of the previous exchange. Buffers are
/// swapped under the lock, so the client never writes into the buffer being sent and the
/// thread never reads the one being filled.
pub struct CommOverlapManager {
    client: usize,
    buffer: Arc<CommBuffer>,
    handle: Option<JoinHandle<Result<Box<dyn Synchronizer>>>>,
}

impl CommOverlapManager {
    /// Starts the communication thread of `client`.
    ///
    /// # Arguments
    /// * `client` - The global id of the client.
    /// * `sync` - The synchronizer the thread drives.
    /// * `params` - The current parameters of the client.
    /// * `channel` - The lock shared by every communication thread of the node, if any.
    ///
    /// # Returns
    /// The manager or an io error if the thread couldn't be spawned.
    pub fn spawn(
        client: usize,
        sync: Box<dyn Synchronizer>,
        params: &[f32],
        channel: Option<Arc<Mutex<()>>>,
    ) -> io::Result<Self> {
        let buffer = Arc::new(CommBuffer {
            slot: Mutex::new(Slot {
                filled: false,
                stop: false,
                failed: false,
                grad: vec![0.; params.len()],
                params: params.to_vec(),
                words: 0,
            }),
            cond: Condvar::new(),
        });

        let shared = Arc::clone(&buffer);
        let handle = thread::Builder::new()
            .name(format!("comm-overlap-{client}"))
            .spawn(move || run(client, shared, sync, channel))?;

        Ok(Self {
            client,
            buffer,
            handle: Some(handle),
        })
    }

    /// Hands the gradient sum to the communication thread.
    ///
    /// Blocks while the previous exchange is still running. On return `params` holds the
    /// result of that previous exchange and `sum` is empty.
    ///
    /// # Returns
    /// The error of the communication thread if it failed.
    pub fn commit(&mut self, sum: &mut GradSum, params: &mut [f32]) -> Result<()> {
        let mut slot = self.buffer.slot.lock();
        while slot.filled && !slot.failed {
            self.buffer.cond.wait(&mut slot);
        }

        if slot.failed {
            drop(slot);
            return Err(self.failure());
        }

        SizeMismatchErr::check(slot.grad.len(), sum.sum.len())?;
        SizeMismatchErr::check(slot.params.len(), params.len())?;

        mem::swap(&mut slot.grad, &mut sum.sum);
        params.copy_from_slice(&slot.params);
        slot.words = sum.words;
        slot.filled = true;
        drop(slot);

        self.buffer.cond.notify_all();
        sum.clear();
        Ok(())
    }

    /// Stops the communication thread once the pending exchange, if any, is done.
    ///
    /// # Returns
    /// The synchronizer back and the parameters of the last exchange, or the error of the
    /// communication thread.
    pub fn stop(mut self) -> Result<(Box<dyn Synchronizer>, Vec<f32>)> {
        self.signal_stop();

        let sync = self.join()?;
        let params = mem::take(&mut self.buffer.slot.lock().params);
        Ok((sync, params))
    }

    fn signal_stop(&self) {
        self.buffer.slot.lock().stop = true;
        self.buffer.cond.notify_all();
    }

    fn join(&mut self) -> Result<Box<dyn Synchronizer>> {
        let Some(handle) = self.handle.take() else {
            return Err(WorkerErr::Disconnected(format!(
                "communication thread of client {} already joined",
                self.client
            )));
        };

        handle
            .join()
            .map_err(|panic| WorkerErr::Disconnected(panic_message(&*panic)))?
    }

    /// Collects the error the communication thread stopped with.
    fn failure(&mut self) -> WorkerErr {
        match self.join() {
            Err(e) => e,
            Ok(_) => WorkerErr::Disconnected(format!(
                "communication thread of client {} stopped unexpectedly",
                self.client
            )),
        }
    }
}

impl Drop for CommOverlapManager {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.signal_stop();

            if let Err(e) = self.join() {
                let client = self.client;
                warn!(client = client; "communication thread failed: {e}");
            }
        }
    }
}

/// Drains the buffer every time it's filled until told to stop.
fn run(
    client: usize,
    buffer: Arc<CommBuffer>,
    mut sync: Box<dyn Synchronizer>,
    channel: Option<Arc<Mutex<()>>>,
) -> Result<Box<dyn Synchronizer>> {
    loop {
        let (grad, mut params, words) = {
            let mut slot = buffer.slot.lock();
            while !slot.filled && !slot.stop {
                buffer.cond.wait(&mut slot);
            }

            if !slot.filled {
                debug!(client = client; "stopping with nothing pending");
                return Ok(sync);
            }

            (
                mem::take(&mut slot.grad),
                mem::take(&mut slot.params),
                slot.words,
            )
        };

        let res = sync.synchronize(&grad, &mut params, words, channel.as_deref());

        let mut slot = buffer.slot.lock();
        slot.grad = grad;
        slot.params = params;
        slot.filled = false;
        slot.failed = res.is_err();
        drop(slot);

        buffer.cond.notify_all();
        res?;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Adds the gradient onto the parameters, counting exchanges.
    struct Echo {
        exchanges: Arc<AtomicUsize>,
        fail_after: usize,
    }

    impl Synchronizer for Echo {
        fn synchronize(
            &mut self,
            grad: &[f32],
            params: &mut [f32],
            _: u64,
            _: Option<&Mutex<()>>,
        ) -> Result<()> {
            if self.exchanges.fetch_add(1, Ordering::SeqCst) >= self.fail_after {
                return Err(WorkerErr::Transport(io::Error::other("link down")));
            }

            params.iter_mut().zip(grad).for_each(|(p, g)| *p += g);
            Ok(())
        }

        fn pull(&mut self, _: &mut [f32]) -> Result<()> {
            Ok(())
        }
    }

    fn echo(fail_after: usize) -> (Box<dyn Synchronizer>, Arc<AtomicUsize>) {
        let exchanges = Arc::new(AtomicUsize::new(0));
        let sync = Echo {
            exchanges: Arc::clone(&exchanges),
            fail_after,
        };

        (Box::new(sync), exchanges)
    }

    #[test]
    fn params_lag_one_exchange_behind() {
        let (sync, exchanges) = echo(usize::MAX);
        let mut manager = CommOverlapManager::spawn(0, sync, &[0.], None).unwrap();

        let mut sum = GradSum::new(1);
        let mut params = [0.];

        sum.add(&[1.], 1).unwrap();
        manager.commit(&mut sum, &mut params).unwrap();
        assert_eq!(params, [0.]);
        assert!(sum.is_empty());

        sum.add(&[2.], 1).unwrap();
        manager.commit(&mut sum, &mut params).unwrap();
        assert_eq!(params, [1.]);

        let (_, last) = manager.stop().unwrap();
        assert_eq!(last, [3.]);
        assert_eq!(exchanges.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_without_pending_sends_nothing() {
        let (sync, exchanges) = echo(usize::MAX);
        let manager = CommOverlapManager::spawn(0, sync, &[0.; 3], None).unwrap();

        let (_, last) = manager.stop().unwrap();
        assert_eq!(last, [0.; 3]);
        assert_eq!(exchanges.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failure_reaches_the_client() {
        let (sync, _) = echo(0);
        let mut manager = CommOverlapManager::spawn(0, sync, &[0.], None).unwrap();

        let mut sum = GradSum::new(1);
        let mut params = [0.];

        sum.add(&[1.], 1).unwrap();
        manager.commit(&mut sum, &mut params).unwrap();

        sum.add(&[1.], 1).unwrap();
        let err = manager.commit(&mut sum, &mut params).unwrap_err();
        assert!(matches!(err, WorkerErr::Transport(_)));
    }

    #[test]
    fn shared_channel_serializes_exchanges() {
        let channel = Arc::new(Mutex::new(()));
        let mut managers: Vec<_> = (0..3)
            .map(|client| {
                let (sync, _) = echo(usize::MAX);
                CommOverlapManager::spawn(client, sync, &[0.], Some(Arc::clone(&channel)))
                    .unwrap()
            })
            .collect();

        for manager in &mut managers {
            let mut sum = GradSum::new(1);
            sum.add(&[1.], 1).unwrap();
            manager.commit(&mut sum, &mut [0.]).unwrap();
        }

        for manager in managers {
            let (_, last) = manager.stop().unwrap();
            assert_eq!(last, [1.]);
        }
    }
}
