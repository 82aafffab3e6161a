use std::{
    borrow::Cow,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
};

use comms::{
    Transport, inbox,
    mem::MemTransport,
    msg::{Command, Msg, NodeStatus, Payload, PushMeta},
};
use parameter_server::{
    optimization::Optimizer,
    service::ServerShardThread,
    storage::{ParameterShard, Partition, Result},
};

const CLIENTS: usize = 4;
const PUSHES: usize = 50;
const LEN: usize = 9;

/// Subtracts the gradient, failing the test if two updates of one sub-shard overlap.
struct Instrumented {
    busy: AtomicBool,
    updates: Arc<AtomicU64>,
}

impl Optimizer for Instrumented {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32], _: u64) -> Result<()> {
        assert!(!self.busy.swap(true, Ordering::SeqCst), "overlapping updates");

        params.iter_mut().zip(grad).for_each(|(p, g)| *p -= g);
        self.updates.fetch_add(1, Ordering::SeqCst);

        self.busy.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn concurrent_clients_are_serialized_per_sub_shard() {
    let updates = Arc::new(AtomicU64::new(0));
    let partition = Partition::new(LEN, 3).unwrap();
    let shard = ParameterShard::new(0, vec![0.; LEN], partition, 0, |_| Instrumented {
        busy: AtomicBool::new(false),
        updates: Arc::clone(&updates),
    })
    .unwrap();

    let (feed, server_inbox) = inbox::inbox();
    let mut replies = Vec::new();
    let mut links: Vec<Box<dyn Transport>> = Vec::new();

    for _ in 0..CLIENTS {
        let (reply_feed, reply_inbox) = inbox::inbox();
        links.push(Box::new(MemTransport::new(0, reply_feed)));
        replies.push(reply_inbox);
    }

    let server = ServerShardThread::new(0, 1, shard, links, None).unwrap();
    let handle = server.spawn(server_inbox).unwrap();

    let finals: Vec<Vec<f32>> = thread::scope(|s| {
        let workers: Vec<_> = replies
            .into_iter()
            .enumerate()
            .map(|(client, replies)| {
                let mut link = MemTransport::new(client, feed.clone());

                s.spawn(move || {
                    let grad = Msg::Data(Payload::Grad {
                        meta: PushMeta {
                            client: client as u32,
                            batch_words: 2,
                        },
                        grad: Cow::Owned(vec![1.; LEN]),
                    });

                    for _ in 0..PUSHES {
                        link.send(&grad).unwrap();
                        let reply = replies.recv().unwrap();
                        assert!(matches!(reply.msg, Msg::Data(Payload::Params(_))));
                    }

                    link.send(&Msg::Data(Payload::Pull {
                        client: client as u32,
                    }))
                    .unwrap();

                    match replies.recv().unwrap().msg {
                        Msg::Data(Payload::Params(params)) => params.into_owned(),
                        other => panic!("unexpected reply {other:?}"),
                    }
                })
            })
            .collect();

        // Finishing early would turn the remaining pushes into violations.
        let total = (CLIENTS * PUSHES * 3) as u64;
        while updates.load(Ordering::SeqCst) < total && !handle.is_finished() {
            thread::yield_now();
        }

        MemTransport::new(CLIENTS, feed.clone())
            .send(&Msg::Control(Command::Status {
                node: 0,
                status: NodeStatus::Finished,
            }))
            .unwrap();

        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let stats = handle.join().unwrap();
    assert_eq!(stats.updates, (CLIENTS * PUSHES) as u64);
    assert_eq!(stats.words, (CLIENTS * PUSHES * 2) as u64);
    assert_eq!(stats.pulls, CLIENTS);

    let expected = -((CLIENTS * PUSHES) as f32);
    for params in finals {
        assert_eq!(params, vec![expected; LEN]);
    }
}
