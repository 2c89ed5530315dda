use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid address range.
    #[error("invalid address range: {0}")]
    InvalidRange(String),

    /// Two subnets of the same network share addresses.
    #[error("network '{network}': subnet {first} overlaps subnet {second}")]
    OverlappingSubnets {
        network: String,
        first: String,
        second: String,
    },

    /// A subnet property names an address outside the subnet range.
    #[error("network '{network}': {what} {address} is outside subnet {range}")]
    OutsideSubnet {
        network: String,
        what: &'static str,
        address: String,
        range: String,
    },

    /// A static IP is not inside any static range of the network.
    #[error("network '{network}': {address} is not in a static range")]
    InvalidStaticIp { network: String, address: String },

    /// A reservation could not be satisfied with the requested type.
    #[error("network '{network}': {address} could not be reserved as {kind}")]
    ReservationFailed {
        network: String,
        address: String,
        kind: &'static str,
    },

    /// Address pool exhausted.
    #[error("network '{0}' has no more dynamic addresses")]
    PoolExhausted(String),

    /// Released address does not belong to any pool of the network.
    #[error("network '{network}': {address} does not belong to the static or dynamic pool")]
    NotReleasable { network: String, address: String },
}

impl NetworkError {
    /// Returns true for errors raised because capacity ran out.
    pub fn is_capacity_error(&self) -> bool {
        matches!(self, NetworkError::PoolExhausted(_))
    }
}
