//! Address reservations held by instances and idle VMs.

use serde::{Deserialize, Serialize};

use crate::{format_address, Address};

/// Which pool an address comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationKind {
    Dynamic,
    Static,
}

impl ReservationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationKind::Dynamic => "dynamic",
            ReservationKind::Static => "static",
        }
    }
}

impl std::fmt::Display for ReservationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claim on one address of a network.
///
/// A reservation is fulfilled once the allocator has assigned it a concrete
/// address of the matching kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub ip: Option<Address>,
    pub kind: ReservationKind,
    pub reserved: bool,
}

impl Reservation {
    /// A request for any dynamic address.
    pub fn dynamic() -> Self {
        Self {
            ip: None,
            kind: ReservationKind::Dynamic,
            reserved: false,
        }
    }

    /// A request for one specific static address.
    pub fn static_ip(ip: Address) -> Self {
        Self {
            ip: Some(ip),
            kind: ReservationKind::Static,
            reserved: false,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.reserved && self.ip.is_some()
    }

    pub fn is_static(&self) -> bool {
        self.kind == ReservationKind::Static
    }

    /// Adopt the address of an already fulfilled reservation.
    ///
    /// Kinds must match; a static reservation additionally requires the same
    /// address. Returns whether anything was taken.
    pub fn take(&mut self, other: &Reservation) -> bool {
        if !other.is_fulfilled() || other.kind != self.kind {
            return false;
        }
        if self.kind == ReservationKind::Static && self.ip != other.ip {
            return false;
        }
        self.ip = other.ip;
        self.reserved = true;
        true
    }
}

impl std::fmt::Display for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            Some(ip) => write!(f, "{} {}", self.kind, format_address(ip)),
            None => write!(f, "{} (unassigned)", self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_address;

    fn fulfilled(kind: ReservationKind, ip: &str) -> Reservation {
        Reservation {
            ip: Some(parse_address(ip).unwrap()),
            kind,
            reserved: true,
        }
    }

    #[test]
    fn test_take_dynamic_copies_address() {
        let mut wanted = Reservation::dynamic();
        assert!(wanted.take(&fulfilled(ReservationKind::Dynamic, "10.0.0.5")));
        assert!(wanted.is_fulfilled());
        assert_eq!(wanted.ip, Some(parse_address("10.0.0.5").unwrap()));
    }

    #[test]
    fn test_take_requires_matching_kind() {
        let mut wanted = Reservation::dynamic();
        assert!(!wanted.take(&fulfilled(ReservationKind::Static, "10.0.0.5")));
        assert!(!wanted.is_fulfilled());
    }

    #[test]
    fn test_take_static_requires_same_address() {
        let mut wanted = Reservation::static_ip(parse_address("10.0.0.6").unwrap());
        assert!(!wanted.take(&fulfilled(ReservationKind::Static, "10.0.0.5")));
        assert!(wanted.take(&fulfilled(ReservationKind::Static, "10.0.0.6")));
    }

    #[test]
    fn test_take_ignores_unfulfilled() {
        let mut wanted = Reservation::dynamic();
        assert!(!wanted.take(&Reservation::dynamic()));
    }
}
