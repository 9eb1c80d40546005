pub mod bits;
pub mod codec;
pub mod framing;
pub mod relay;
pub mod sequence;
