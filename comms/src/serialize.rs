use std::io;

/// Writes a value into a frame body.
pub trait Serialize<'a> {
    /// Serializes `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer holding the start of the frame body.
    ///
    /// # Returns
    /// An optional trailing slice that is written right after `buf` without being copied,
    /// or an io error if `self` can't be represented on the wire.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
