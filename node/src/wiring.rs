//! Connects every client of the topology to every shard.
//!
//! Links are numbered by their receiving end. A server inbox knows client links by the
//! global client id and status links by `clients + node`, a client inbox knows the reply
//! links by shard id. The shard of the node itself is reached through in-memory links.

use std::{
    net::{TcpListener, TcpStream},
    thread,
    time::Duration,
};

use comms::{
    Feed, Inbox, LinkId, Transport, inbox,
    mem::MemTransport,
    msg::Command,
    tcp::{self, TcpReader, TcpTransport},
};
use log::{debug, info};
use parameter_server::service::panic_message;

use crate::{NodeErr, Result, config::NodeConfig, topology::NodeTopology};

const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// The links of one local client.
pub struct ClientLinks {
    /// One link per shard, by shard id.
    pub to_shards: Vec<Box<dyn Transport>>,
    /// Where the shards reply.
    pub inbox: Inbox,
}

/// Every link of one node.
pub struct NodeLinks {
    /// Where every client and status link of the topology delivers to this node's shard.
    pub server_inbox: Inbox,
    /// The reply link of every client of the topology, by global client id.
    pub server_links: Vec<Box<dyn Transport>>,
    /// The links of the local clients, by device.
    pub clients: Vec<ClientLinks>,
    /// The status link to every shard, by node.
    pub status: Vec<Box<dyn Transport>>,
    /// The reader threads of the TCP links, stopped on drop.
    pub readers: Vec<TcpReader>,
}

/// Wires a whole topology inside the current process.
///
/// # Arguments
/// * `devices` - The amount of devices of every node, by rank.
///
/// # Returns
/// The links of every node, by rank.
pub fn mem_cluster(devices: &[usize]) -> Result<Vec<NodeLinks>> {
    let topology = NodeTopology::new(devices.to_vec(), 0)?;
    let clients = topology.clients();

    let (server_feeds, server_inboxes): (Vec<_>, Vec<_>) =
        (0..topology.nodes()).map(|_| inbox::inbox()).unzip();

    let (reply_feeds, reply_inboxes): (Vec<_>, Vec<_>) =
        (0..clients).map(|_| inbox::inbox()).unzip();

    let mut reply_inboxes = reply_inboxes.into_iter();

    let cluster = server_inboxes
        .into_iter()
        .enumerate()
        .map(|(node, server_inbox)| {
            let server_links = reply_feeds
                .iter()
                .map(|feed| mem_link(node, feed))
                .collect();

            let clients = topology
                .clients_of(node)
                .zip(reply_inboxes.by_ref())
                .map(|(client, inbox)| ClientLinks {
                    to_shards: server_feeds
                        .iter()
                        .map(|feed| mem_link(client, feed))
                        .collect(),
                    inbox,
                })
                .collect();

            let status = server_feeds
                .iter()
                .map(|feed| mem_link(topology.status_link(node), feed))
                .collect();

            NodeLinks {
                server_inbox,
                server_links,
                clients,
                status,
                readers: Vec::new(),
            }
        })
        .collect();

    Ok(cluster)
}

fn mem_link(link: LinkId, feed: &Feed) -> Box<dyn Transport> {
    Box::new(MemTransport::new(link, feed.clone()))
}

/// What the acceptor learned from an incoming connection.
struct Accepted {
    link: LinkId,
    reply: Option<TcpTransport>,
    reader: TcpReader,
}

/// Wires this node into a TCP mesh.
///
/// Every node listens on its address and connects one link per (local client, remote
/// node) plus one status link per remote node. Each link opens with a `Hello` the
/// accepting end checks against the topology.
///
/// # Returns
/// The links of this node, or a `NodeErr::Config` if a peer disagrees on the topology.
pub fn tcp_mesh(config: &NodeConfig) -> Result<NodeLinks> {
    let topology = config.topology()?;
    let rank = topology.rank();

    let listener = TcpListener::bind(&config.nodes[rank].addr)?;
    info!(node = rank; "listening on {}", config.nodes[rank].addr);

    let (server_feed, server_inbox) = inbox::inbox();
    let acceptor = {
        let topology = topology.clone();
        let feed = server_feed.clone();

        thread::Builder::new()
            .name(format!("acceptor-{rank}"))
            .spawn(move || accept_all(&listener, &topology, &feed))?
    };

    let local = topology.local_clients();
    let (reply_feeds, reply_inboxes): (Vec<_>, Vec<_>) =
        local.clone().map(|_| inbox::inbox()).unzip();

    let mut server_links: Vec<Option<Box<dyn Transport>>> =
        (0..topology.clients()).map(|_| None).collect();

    for (client, feed) in local.clone().zip(&reply_feeds) {
        server_links[client] = Some(mem_link(rank, feed));
    }

    let mut to_shards: Vec<Vec<Option<Box<dyn Transport>>>> = local
        .clone()
        .map(|client| {
            (0..topology.nodes())
                .map(|shard| (shard == rank).then(|| mem_link(client, &server_feed)))
                .collect()
        })
        .collect();

    let mut status: Vec<Option<Box<dyn Transport>>> = (0..topology.nodes())
        .map(|node| (node == rank).then(|| mem_link(topology.status_link(rank), &server_feed)))
        .collect();

    let mut readers = Vec::new();
    let hello = |client| Command::Hello {
        node: rank,
        client,
        devices: topology.local_devices(),
    };

    // An acceptor waiting on a peer that never showed up is left behind on failure.
    for node in (0..topology.nodes()).filter(|&node| node != rank) {
        let addr = &config.nodes[node].addr;

        for (device, client) in local.clone().enumerate() {
            let stream = open(addr, config.connect_attempts, hello(Some(client)))?;
            readers.push(tcp::attach(&stream, node, reply_feeds[device].clone())?);
            to_shards[device][node] = Some(Box::new(TcpTransport::new(&stream)?));
        }

        let stream = open(addr, config.connect_attempts, hello(None))?;
        status[node] = Some(Box::new(TcpTransport::new(&stream)?));
        debug!(node = rank; "connected to node {node} at {addr}");
    }

    let accepted = acceptor
        .join()
        .map_err(|panic| NodeErr::Transport(std::io::Error::other(panic_message(&*panic))))??;

    for Accepted {
        link,
        reply,
        reader,
    } in accepted
    {
        if let Some(reply) = reply {
            server_links[link] = Some(Box::new(reply));
        }

        readers.push(reader);
    }

    let clients = to_shards
        .into_iter()
        .zip(reply_inboxes)
        .map(|(to_shards, inbox)| {
            Ok(ClientLinks {
                to_shards: complete(to_shards, "client link")?,
                inbox,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    info!(node = rank; "mesh established");

    Ok(NodeLinks {
        server_inbox,
        server_links: complete(server_links, "reply link")?,
        clients,
        status: complete(status, "status link")?,
        readers,
    })
}

/// Connects to `addr` and introduces the link.
fn open(addr: &str, attempts: usize, hello: Command) -> Result<TcpStream> {
    let stream = tcp::connect(addr, attempts, CONNECT_BACKOFF)?;
    tcp::send_command(&stream, hello)?;
    Ok(stream)
}

/// Accepts the links of every remote node.
fn accept_all(
    listener: &TcpListener,
    topology: &NodeTopology,
    feed: &Feed,
) -> Result<Vec<Accepted>> {
    let rank = topology.rank();
    let expected: usize = (0..topology.nodes())
        .filter(|&node| node != rank)
        .map(|node| topology.devices(node) + 1)
        .sum();

    let mut seen = vec![false; topology.clients() + topology.nodes()];
    let mut accepted = Vec::with_capacity(expected);

    while accepted.len() < expected {
        let (stream, addr) = listener.accept()?;
        stream.set_nodelay(true)?;

        let Command::Hello {
            node,
            client,
            devices,
        } = tcp::recv_command(&stream)?
        else {
            return Err(NodeErr::Config(format!("{addr} didn't open with a hello")));
        };

        if node >= topology.nodes() || node == rank {
            return Err(NodeErr::Config(format!(
                "{addr} claims to be node {node}, not a remote node of the topology"
            )));
        }

        if devices != topology.devices(node) {
            return Err(NodeErr::Config(format!(
                "node {node} announced {devices} devices, the topology says {}",
                topology.devices(node)
            )));
        }

        let link = match client {
            Some(client) if topology.node_of(client) == Some(node) => client,
            Some(client) => {
                return Err(NodeErr::Config(format!(
                    "node {node} announced client {client} which isn't one of its own"
                )));
            }
            None => topology.status_link(node),
        };

        if std::mem::replace(&mut seen[link], true) {
            return Err(NodeErr::Config(format!("link {link} was opened twice")));
        }

        let reply = client.map(|_| TcpTransport::new(&stream)).transpose()?;
        let reader = tcp::attach(&stream, link, feed.clone())?;
        debug!(node = rank, link = link; "accepted a link from node {node} at {addr}");

        accepted.push(Accepted {
            link,
            reply,
            reader,
        });
    }

    Ok(accepted)
}

fn complete<T>(links: Vec<Option<T>>, what: &str) -> Result<Vec<T>> {
    links
        .into_iter()
        .enumerate()
        .map(|(i, link)| link.ok_or_else(|| NodeErr::Config(format!("{what} {i} is missing"))))
        .collect()
}
