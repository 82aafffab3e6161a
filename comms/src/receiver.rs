use std::io::{self, Read};

use crate::{
    Align4, Deserialize,
    protocol::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN},
};

/// The receiving end handle of the communication.
pub struct OnoReceiver<R: Read> {
    rx: R,
}

impl<R: Read> OnoReceiver<R> {
    /// Creates a new `OnoReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Blocks until a new message is read from the inner receiver.
    ///
    /// # Arguments
    /// * `buf` - The buffer to use for deserialization, the returned
    ///           `T`'s lifetimes will be tied to this buffer.
    ///
    /// # Returns
    /// A result object that returns `T` on success or `io::Error` on failure.
    /// A stream closed on a frame boundary yields `io::ErrorKind::UnexpectedEof`, one
    /// closed partway through a frame yields `io::ErrorKind::InvalidData`.
    pub fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.read_header(&mut size_buf)?;
        let len = LenType::from_be_bytes(size_buf);

        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} bytes limit"),
            ));
        }

        let len = len as usize;
        let needed_amount = len.div_ceil(size_of::<B>());

        buf.clear();
        buf.resize(needed_amount, bytemuck::Zeroable::zeroed());

        let view: &mut [u8] = bytemuck::cast_slice_mut(buf.as_mut_slice());
        let slice = &mut view[..len];
        self.rx.read_exact(slice).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => truncated(format!("after {len} bytes were announced")),
            _ => e,
        })?;

        T::deserialize(slice)
    }

    /// Fills `size_buf`, telling a close between frames apart from one inside a header.
    fn read_header(&mut self, size_buf: &mut [u8]) -> io::Result<()> {
        let mut read = 0;

        while read < size_buf.len() {
            match self.rx.read(&mut size_buf[read..]) {
                Ok(0) if read == 0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(0) => return Err(truncated(format!("inside the header, {read} bytes in"))),
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

fn truncated(at: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("stream closed {at}"))
}
