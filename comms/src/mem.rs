//! In process links, used to reach the shard hosted by the same node and in tests.

use std::io;

use crate::{
    inbox::Feed,
    msg::Msg,
    transport::{Envelope, LinkId, Transport},
};

/// A link that delivers messages straight into the peer's inbox.
#[derive(Debug, Clone)]
pub struct MemTransport {
    link: LinkId,
    feed: Feed,
}

impl MemTransport {
    /// Creates a new `MemTransport`.
    ///
    /// # Arguments
    /// * `link` - The id the receiving end knows this link by.
    /// * `feed` - The feed of the receiving end's inbox.
    pub fn new(link: LinkId, feed: Feed) -> Self {
        Self { link, feed }
    }
}

impl Transport for MemTransport {
    fn send(&mut self, msg: &Msg<'_>) -> io::Result<()> {
        let envelope = Envelope {
            link: self.link,
            msg: msg.clone().into_owned(),
        };

        self.feed.send(envelope).map_err(|_| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("the inbox behind link {} was dropped", self.link),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::*;
    use crate::{inbox, msg::Payload};

    #[test]
    fn delivers_tagged_with_link() {
        let (feed, inbox) = inbox::inbox();
        let mut link = MemTransport::new(4, feed);

        let params = [1.0, 2.0];
        link.send(&Msg::Data(Payload::Params(Cow::Borrowed(&params))))
            .unwrap();

        let envelope = inbox.recv().unwrap();
        assert_eq!(envelope.link, 4);
        assert_eq!(envelope.msg, Msg::Data(Payload::Params(Cow::Owned(params.to_vec()))));
    }

    #[test]
    fn dropped_inbox_breaks_the_link() {
        let (feed, inbox) = inbox::inbox();
        let mut link = MemTransport::new(0, feed);
        drop(inbox);

        let err = link.send(&Msg::Data(Payload::Pull { client: 0 })).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
