//! One-shot shutdown signal shared between a [`Host`] and its worker task.
//!
//! [`Host`]: crate::host::Host
#[cfg(feature = "async_std")]
mod async_std;

#[cfg(feature = "async_tokio")]
mod tokio;

#[cfg(feature = "async_std")]
pub use self::async_std::Notify;

#[cfg(feature = "async_tokio")]
pub use self::tokio::Notify;
