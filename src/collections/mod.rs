//! Containers used by the channels.
//!
//! [`OrdinalTree`] buffers out of order inbound messages and reassemblies.
//! [`List`] keeps outbound messages in send order and hands out handles that
//! remain safe to hold after the node they point to is gone.
pub mod list;
pub mod tree;

pub use self::list::{Handle, List};
pub use self::tree::OrdinalTree;
