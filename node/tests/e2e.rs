use std::{env, fs, net::TcpListener, num::NonZeroUsize, process, thread};

use comms::specs::{OptimizerSpec, ParamGenSpec};
use node::{
    MultiNodeGroup, NodeConfig, NodeErr,
    config::{DemoConfig, NodeAddr},
    demo::{Dataset, LeastSquares, Rows},
    wiring::{self, NodeLinks},
};

const FEATURES: usize = 4;
const ROWS: usize = 512;
const BATCH_ROWS: usize = 16;
const EPOCHS: usize = 5;

fn config(devices: &[usize], rank: usize) -> NodeConfig {
    NodeConfig {
        nodes: devices
            .iter()
            .map(|&devices| NodeAddr {
                addr: "127.0.0.1:0".into(),
                devices,
            })
            .collect(),
        rank,
        drop_rate: 0.,
        overlap: false,
        max_compute_iters: NonZeroUsize::MIN,
        commit_words: None,
        single_comm: false,
        tau: NonZeroUsize::MIN,
        moving_average: false,
        moving_decay: 0.9999,
        optimizer: OptimizerSpec::GradientDescent { learning_rate: 0.2 },
        local_optimizer: None,
        batch_words_ref: None,
        param_gen: ParamGenSpec::Const {
            value: 0.,
            limit: FEATURES + 1,
        },
        seed: Some(5),
        model: None,
        overwrite: false,
        no_reload: false,
        connect_attempts: 50,
        demo: DemoConfig {
            features: FEATURES,
            rows: ROWS,
            batch_rows: BATCH_ROWS,
            epochs: EPOCHS,
            save_every: 0,
        },
    }
}

/// The dataset `node::run` draws from the configured seed.
fn dataset() -> Dataset {
    Dataset::synthetic(FEATURES, ROWS, 5)
}

fn loss(params: &[f32]) -> f32 {
    LeastSquares::new(FEATURES).loss(dataset().rows(), params)
}

fn new_group(config: NodeConfig, links: NodeLinks) -> MultiNodeGroup<Rows, LeastSquares> {
    let devices = config.topology().unwrap().local_devices();
    let models = (0..devices).map(|_| LeastSquares::new(FEATURES)).collect();
    MultiNodeGroup::new(config, links, models).unwrap()
}

fn train(config: NodeConfig, links: NodeLinks) -> Vec<Vec<f32>> {
    let data = dataset();
    let mut group = new_group(config, links);

    for _ in 0..EPOCHS {
        for batch in data.batches(BATCH_ROWS) {
            group.update(batch).unwrap();
        }
    }

    group.finish().unwrap()
}

/// Trains every node of an in-process cluster, returning the replicas of every client.
fn train_cluster(devices: &[usize], tweak: impl Fn(&mut NodeConfig) + Sync) -> Vec<Vec<f32>> {
    let cluster = wiring::mem_cluster(devices).unwrap();
    let tweak = &tweak;

    thread::scope(|s| {
        let handles: Vec<_> = cluster
            .into_iter()
            .enumerate()
            .map(|(rank, links)| {
                s.spawn(move || {
                    let mut config = config(devices, rank);
                    tweak(&mut config);
                    train(config, links)
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    })
}

fn assert_identical(replicas: &[Vec<f32>]) {
    assert!(!replicas.is_empty());
    assert!(replicas.iter().all(|params| params == &replicas[0]));
}

#[test]
fn dense_nodes_end_bit_identical() {
    let replicas = train_cluster(&[1, 1], |_| {});

    assert_eq!(replicas.len(), 2);
    assert_identical(&replicas);
    assert!(loss(&replicas[0]) < loss(&[0.; FEATURES + 1]) * 0.01);
}

#[test]
fn four_batches_are_split_by_rank() {
    let cluster = wiring::mem_cluster(&[1, 1]).unwrap();
    let batches: Vec<Rows> = dataset().batches(BATCH_ROWS).take(4).collect();

    let replicas: Vec<Vec<f32>> = thread::scope(|s| {
        let handles: Vec<_> = cluster
            .into_iter()
            .enumerate()
            .map(|(rank, links)| {
                let batches = batches.clone();

                s.spawn(move || {
                    let mut group = new_group(config(&[1, 1], rank), links);
                    for batch in batches {
                        group.update(batch).unwrap();
                    }

                    let replicas = group.finish().unwrap();
                    assert_eq!(group.batch_iter(), 4);
                    assert_eq!(group.collect_stats().unwrap().batches, 2);
                    replicas
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    assert_eq!(replicas.len(), 2);
    assert_identical(&replicas);
    assert_ne!(replicas[0], vec![0.; FEATURES + 1]);
}

#[test]
fn uneven_devices_share_the_same_shards() {
    let replicas = train_cluster(&[2, 1], |_| {});

    assert_eq!(replicas.len(), 3);
    assert_identical(&replicas);
    assert!(loss(&replicas[0]) < loss(&[0.; FEATURES + 1]) * 0.01);
}

#[test]
fn sparse_nodes_still_converge() {
    let replicas = train_cluster(&[1, 1], |config| config.drop_rate = 0.5);

    assert_identical(&replicas);
    assert!(loss(&replicas[0]) < loss(&[0.; FEATURES + 1]) * 0.5);
}

#[test]
fn overlap_converges_like_direct_synchronization() {
    let direct = train_cluster(&[1, 1], |_| {});
    let overlap = train_cluster(&[1, 1], |config| {
        config.overlap = true;
        config.single_comm = true;
        config.local_optimizer = Some(OptimizerSpec::GradientDescent { learning_rate: 0.05 });
    });

    assert_identical(&overlap);

    let initial = loss(&[0.; FEATURES + 1]);
    assert!(loss(&overlap[0]) < initial * 0.05);
    assert!(loss(&direct[0]) < initial * 0.05);
}

#[test]
fn accumulated_steps_converge() {
    let replicas = train_cluster(&[1, 1], |config| {
        config.tau = NonZeroUsize::new(3).unwrap();
        config.moving_average = true;
    });

    assert_identical(&replicas);
    assert!(loss(&replicas[0]) < loss(&[0.; FEATURES + 1]) * 0.1);
}

#[test]
fn checkpoints_round_trip_through_the_model_path() {
    let dir = env::temp_dir().join(format!("node-e2e-{}", process::id()));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("model.json");
    let _ = fs::remove_file(&path);

    let mut first = config(&[1], 0);
    first.model = Some(path.clone());

    let links = wiring::mem_cluster(&[1]).unwrap().remove(0);
    let mut group = new_group(first.clone(), links);
    assert!(!group.load().unwrap());

    for batch in dataset().batches(BATCH_ROWS).take(8) {
        group.update(batch).unwrap();
    }

    group.save(false).unwrap();
    assert!(dir.join("model.iter8.json").exists());
    assert!(matches!(group.load(), Err(NodeErr::Config(_))));

    let replicas = group.finish().unwrap();
    group.save(true).unwrap();

    let links = wiring::mem_cluster(&[1]).unwrap().remove(0);
    let mut second = new_group(first, links);
    assert!(second.load().unwrap());

    let restarted = second.finish().unwrap();
    assert_eq!(restarted, replicas);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn too_few_parameters_fail_before_launch() {
    let tiny = |devices: &[usize]| {
        let mut config = config(devices, 0);
        config.param_gen = ParamGenSpec::Const {
            value: 0.,
            limit: 2,
        };

        let links = wiring::mem_cluster(devices).unwrap().remove(0);
        let models = (0..devices[0]).map(|_| LeastSquares::new(1)).collect();
        MultiNodeGroup::<Rows, _>::new(config, links, models)
    };

    // Two parameters for three shards, then for three sub-shards.
    assert!(matches!(tiny(&[1, 1, 1]), Err(NodeErr::Config(_))));
    assert!(matches!(tiny(&[3]), Err(NodeErr::Config(_))));
    assert!(tiny(&[2]).is_ok());
}

#[test]
fn updates_after_finish_are_rejected() {
    let links = wiring::mem_cluster(&[1]).unwrap().remove(0);
    let mut group = new_group(config(&[1], 0), links);
    group.finish().unwrap();

    let batch = dataset().batches(BATCH_ROWS).next().unwrap();
    assert!(matches!(group.update(batch), Err(NodeErr::Config(_))));
}

fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

#[test]
fn tcp_mesh_trains_like_the_in_process_cluster() {
    let addrs = [free_addr(), free_addr()];

    let finals: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let mut config = config(&[1, 2], rank);
                for (node, addr) in config.nodes.iter_mut().zip(&addrs) {
                    node.addr = addr.clone();
                }

                s.spawn(move || node::run(config).unwrap())
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    assert_eq!(finals[0], finals[1]);
    assert!(loss(&finals[0]) < loss(&[0.; FEATURES + 1]));
}

#[test]
fn mesh_rejects_a_peer_with_another_topology() {
    let addrs = [free_addr(), free_addr()];

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                // Node 1 believes it has two devices.
                let devices: &[usize] = if rank == 0 { &[1, 1] } else { &[1, 2] };
                let mut config = config(devices, rank);
                config.connect_attempts = 20;
                for (node, addr) in config.nodes.iter_mut().zip(&addrs) {
                    node.addr = addr.clone();
                }

                s.spawn(move || wiring::tcp_mesh(&config).map(|_| ()))
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    assert!(matches!(results[0], Err(NodeErr::Config(_))));
}
