//! Hardware layer: links to the instrument and the instrument driver itself.

pub mod address;
pub mod capabilities;
pub mod k2470;
pub mod mock;
pub mod tcp;
pub mod transport;

pub use address::ResourceAddress;
pub use k2470::Keithley2470Driver;
pub use transport::{Connector, Session, SystemConnector, Transport};
