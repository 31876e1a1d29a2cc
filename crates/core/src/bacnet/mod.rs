//! BACnet read access.
//!
//! The engines only ever see the [`BacnetClient`] trait: a blocking read of
//! one property (or an array-aligned batch of them) with a hard timeout.
//! [`UdpBacnetClient`] is the production implementation over BACnet/IP.

mod client;
mod codec;

pub use client::UdpBacnetClient;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BacnetError;

/// BACnet object types this agent reads from metering hardware.
pub mod object_type {
    pub const ANALOG_INPUT: u16 = 0;
    pub const ANALOG_VALUE: u16 = 2;
}

/// Property identifiers in use.
pub mod property_id {
    pub const PRESENT_VALUE: u32 = 85;
}

/// One property to read: `(object_type, instance, property)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyRef {
    pub object_type: u16,
    pub instance: u32,
    pub property: u32,
}

#[async_trait]
pub trait BacnetClient: Send + Sync {
    /// Read a single property, resolving to a numeric value.
    async fn read_property(
        &self,
        target: SocketAddr,
        prop: PropertyRef,
        timeout: Duration,
    ) -> Result<f64, BacnetError>;

    /// Read a batch of properties in one request.
    ///
    /// The result is aligned with `props`; individual entries may fail while
    /// others succeed. A whole-request failure (timeout, unreachable target,
    /// unparseable frame) is the outer `Err`.
    async fn read_property_multiple(
        &self,
        target: SocketAddr,
        props: &[PropertyRef],
        timeout: Duration,
    ) -> Result<Vec<Result<f64, BacnetError>>, BacnetError>;
}
