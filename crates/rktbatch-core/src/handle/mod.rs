//! Scoped handles over OS descriptors.
//!
//! Both handle types release their descriptors on drop, can only be moved,
//! and tolerate repeated `close` calls.

pub mod pipe;
pub mod stream;

pub use pipe::{End, Pipe};
pub use stream::{Mode, Stream};
