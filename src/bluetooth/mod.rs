//! Bluetooth side of the pipeline: characteristic payloads, the notification
//! transport and device search.

pub mod mock;
pub mod payload;
pub mod scanner;
mod transport;

pub use transport::{BluerConnection, BluerTransport, NotificationHandler, Transport};
