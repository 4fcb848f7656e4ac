//! SCPI protocol layer.
//!
//! Nothing above this module talks to a [`Session`](crate::hardware::transport::Session)
//! directly: the instrument driver only sees verified writes and diagnostic queries.

pub mod channel;
pub mod command;
pub mod error_queue;

pub use channel::{CommandChannel, Response, WriteReport};
pub use command::{Command, CommandKind};
pub use error_queue::{
    DrainFailure, ErrorClass, ErrorQueueDrainer, ErrorRecord, ERROR_QUEUE_QUERY, MAX_DRAIN,
};
