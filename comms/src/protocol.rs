//! Frame layout constants shared by the sending and receiving ends.
//!
//! A frame is `len: u64 BE | tag: u32 BE | body`, where `len` counts the tag and the body.

pub(crate) type LenType = u64;
pub(crate) const LEN_TYPE_SIZE: usize = size_of::<LenType>();

pub(crate) type Header = u32;
pub(crate) const HEADER_SIZE: usize = size_of::<Header>();

pub(crate) const ERR: Header = 0;
pub(crate) const CONTROL: Header = 1;
pub(crate) const GRAD_PUSH: Header = 2;
pub(crate) const GRAD_PUSH_SPARSE: Header = 3;
pub(crate) const PARAM_PUSH: Header = 4;
pub(crate) const PARAM_PUSH_SPARSE: Header = 5;
pub(crate) const PARAM_PULL: Header = 6;

/// The upper bound for a single frame, anything bigger is treated as a corrupted stream.
pub(crate) const MAX_FRAME_LEN: LenType = 1 << 34;
