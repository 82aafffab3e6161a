use std::io;

use crate::msg::Msg;

/// Identifies the peer a message arrived from, as numbered by the receiving end.
pub type LinkId = usize;

/// A message tagged with the link it arrived on.
#[derive(Debug)]
pub struct Envelope {
    pub link: LinkId,
    pub msg: Msg<'static>,
}

/// The sending half of a point to point link.
///
/// Sends are blocking, an implementation may only return once the message
/// has been handed off to the peer or failed to be.
pub trait Transport: Send {
    /// Sends `msg` to the peer at the other end of this link.
    ///
    /// # Arguments
    /// * `msg` - The message to send.
    ///
    /// # Returns
    /// An io error if the link is broken.
    fn send(&mut self, msg: &Msg<'_>) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, msg: &Msg<'_>) -> io::Result<()> {
        (**self).send(msg)
    }
}

/// Sends `msg` through every link in `links`.
///
/// Stops at the first failing link.
pub fn broadcast<T: Transport>(links: &mut [T], msg: &Msg<'_>) -> io::Result<()> {
    links.iter_mut().try_for_each(|link| link.send(msg))
}
