mod align;
mod deserialize;
pub mod inbox;
pub mod mem;
pub mod msg;
mod protocol;
mod receiver;
mod sender;
mod serialize;
pub mod specs;
pub mod tcp;
pub mod transport;

use std::io::{Read, Write};

pub use align::Align4;
pub use deserialize::Deserialize;
pub use inbox::{Feed, Inbox};
pub use receiver::OnoReceiver;
pub use sender::OnoSender;
pub use serialize::Serialize;
pub use transport::{Envelope, LinkId, Transport};

/// Creates both `OnoReceiver` and `OnoSender` network channel parts.
///
/// Given a writer and reader creates and returns both ends of the communication.
///
/// # Arguments
/// * `rx` - A readable.
/// * `tx` - A writable.
///
/// # Returns
/// A communication stream in the form of an ono receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (OnoReceiver<R>, OnoSender<W>)
where
    R: Read,
    W: Write,
{
    (OnoReceiver::new(rx), OnoSender::new(tx))
}
