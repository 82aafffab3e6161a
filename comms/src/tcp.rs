//! Links over TCP, one stream per (client, shard) pair plus one per node pair for statuses.

use std::{
    borrow::Cow,
    io::{self, BufReader, BufWriter},
    net::{Shutdown, SocketAddr, TcpStream},
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, warn};

use crate::{
    OnoReceiver, OnoSender,
    inbox::Feed,
    msg::{Command, Msg},
    transport::{Envelope, LinkId, Transport},
};

/// The sending half of a TCP link.
pub struct TcpTransport {
    tx: OnoSender<BufWriter<TcpStream>>,
}

impl TcpTransport {
    /// Creates a new `TcpTransport` writing into a clone of `stream`.
    pub fn new(stream: &TcpStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self {
            tx: OnoSender::new(BufWriter::new(writer)),
        })
    }

    /// The address of the peer at the other end.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tx.get_ref().get_ref().peer_addr()
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, msg: &Msg<'_>) -> io::Result<()> {
        self.tx.send(msg)
    }
}

/// The receiving half of a TCP link, a thread feeding an inbox.
///
/// Dropping it shuts the read half of the stream down and joins the thread.
pub struct TcpReader {
    link: LinkId,
    stream: TcpStream,
    handle: Option<JoinHandle<()>>,
}

/// Starts reading every frame that arrives on `stream` into `feed`, tagged with `link`.
///
/// # Arguments
/// * `stream` - The connected stream, the handshake must already be done.
/// * `link` - The id the local end knows this peer by.
/// * `feed` - The feed of the local inbox.
///
/// # Returns
/// The reader handle or an io error if the stream couldn't be cloned.
pub fn attach(stream: &TcpStream, link: LinkId, feed: Feed) -> io::Result<TcpReader> {
    let reader = stream.try_clone()?;
    let handle = thread::Builder::new()
        .name(format!("tcp-reader-{link}"))
        .spawn(move || consume(link, reader, feed))?;

    Ok(TcpReader {
        link,
        stream: stream.try_clone()?,
        handle: Some(handle),
    })
}

/// Reads frames until the peer closes the stream, the inbox goes away or a frame is bad.
///
/// A bad frame is forwarded as an `Err` message so the owner of the inbox can fail loudly.
fn consume(link: LinkId, stream: TcpStream, feed: Feed) {
    let mut rx = OnoReceiver::new(BufReader::new(stream));
    let mut buf: Vec<u32> = Vec::new();

    loop {
        match rx.recv_into::<Msg, _>(&mut buf) {
            Ok(msg) => {
                let envelope = Envelope {
                    link,
                    msg: msg.into_owned(),
                };

                if feed.send(envelope).is_err() {
                    debug!(link = link; "inbox dropped, stopping reader");
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(link = link; "stream closed by peer");
                break;
            }
            Err(e) => {
                warn!(link = link; "failed to read frame: {e}");
                let msg = Msg::Err(Cow::Owned(e.to_string()));
                let _ = feed.send(Envelope { link, msg });
                break;
            }
        }
    }
}

impl Drop for TcpReader {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Read);

        if let Some(Err(e)) = self.handle.take().map(JoinHandle::join) {
            let link = self.link;
            warn!(link = link; "failed to join reader thread: {e:?}");
        }
    }
}

/// Writes a single control frame straight into `stream`.
pub fn send_command(stream: &TcpStream, cmd: Command) -> io::Result<()> {
    let mut tx = OnoSender::new(stream);
    tx.send(&Msg::Control(cmd))
}

/// Reads a single control frame straight from `stream`.
///
/// The read is unbuffered so nothing past the frame is consumed.
pub fn recv_command(stream: &TcpStream) -> io::Result<Command> {
    let mut rx = OnoReceiver::new(stream);
    let mut buf: Vec<u32> = Vec::new();

    match rx.recv_into(&mut buf)? {
        Msg::Control(cmd) => Ok(cmd),
        Msg::Err(detail) => Err(io::Error::other(format!("peer reported: {detail}"))),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected a control frame, got {}", other.tag_name()),
        )),
    }
}

/// Connects to `addr`, retrying while the peer isn't listening yet.
///
/// # Arguments
/// * `addr` - The address of the peer.
/// * `attempts` - How many times to try before giving up, at least once.
/// * `backoff` - The time to wait between attempts.
///
/// # Returns
/// The connected stream with `TCP_NODELAY` set, or the last connection error.
pub fn connect(addr: &str, attempts: usize, backoff: Duration) -> io::Result<TcpStream> {
    let mut attempt = 1;

    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if attempt < attempts => {
                debug!(attempt = attempt; "failed to connect to {addr}: {e}, retrying");
                attempt += 1;
                thread::sleep(backoff);
            }
            Err(e) => return Err(e),
        }
    }
}
