/// Element types for receive buffers that keep frame bodies 4 bytes aligned.
///
/// Every numeric section of a frame starts at a multiple of 4 bytes from the tag,
/// so reading into a buffer of `Align4` items lets the payload be borrowed in place.
pub trait Align4: bytemuck::Pod {}

impl Align4 for u32 {}
impl Align4 for i32 {}
impl Align4 for f32 {}
impl Align4 for u64 {}
impl Align4 for f64 {}
