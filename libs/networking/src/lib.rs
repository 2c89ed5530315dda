//! Address management for deployment networks.
//!
//! This library provides:
//! - IPv4 CIDR and range math on the integer form of an address
//! - Subnets partitioned into static, dynamic and reserved pools
//! - A per-network allocator with reserve/allocate/release
//! - Reservations and the per-network settings handed to agents

mod cidr;
mod error;
mod network;
mod reservation;
mod settings;

pub use cidr::{format_address, parse_address, Address, AddressRange, Ipv4Cidr};
pub use error::NetworkError;
pub use network::{Network, Subnet, SubnetSpec};
pub use reservation::{Reservation, ReservationKind};
pub use settings::{NetworkSetting, NetworkSettings};
