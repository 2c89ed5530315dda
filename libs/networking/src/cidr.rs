//! IPv4 arithmetic on the `u32` form of an address.

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::NetworkError;

/// An IPv4 address as an integer. All bookkeeping uses this form.
pub type Address = u32;

/// Parse a dotted-quad address.
pub fn parse_address(s: &str) -> Result<Address, NetworkError> {
    let addr = Ipv4Addr::from_str(s.trim())
        .map_err(|_| NetworkError::InvalidAddress(s.to_string()))?;
    Ok(u32::from(addr))
}

/// Format an address as a dotted quad.
pub fn format_address(addr: Address) -> String {
    Ipv4Addr::from(addr).to_string()
}

/// IPv4 prefix, e.g. `10.0.0.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    /// Network id (masked base address).
    base: Address,

    /// Prefix length, 0..=32.
    prefix_len: u8,
}

impl Ipv4Cidr {
    /// Create a prefix, masking the address.
    pub fn new(address: Address, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }
        Ok(Self {
            base: address & mask(prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "10.0.0.0/24").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.trim().split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = parse_address(addr_str)?;
        let prefix_len = prefix_str
            .trim()
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Network id address.
    pub fn network_id(&self) -> Address {
        self.base
    }

    /// Broadcast address.
    pub fn broadcast(&self) -> Address {
        self.base | !mask(self.prefix_len)
    }

    /// Netmask in integer form.
    pub fn netmask(&self) -> Address {
        mask(self.prefix_len)
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Address) -> bool {
        addr & mask(self.prefix_len) == self.base
    }

    /// Whether two prefixes share any address.
    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.contains(other.base) || other.contains(self.base)
    }

    /// Every address in the prefix as an inclusive range.
    pub fn range(&self) -> AddressRange {
        AddressRange {
            first: self.network_id(),
            last: self.broadcast(),
        }
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", format_address(self.base), self.prefix_len)
    }
}

fn mask(prefix_len: u8) -> Address {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

/// Inclusive range of addresses.
///
/// Parsed from `"10.0.0.10 - 10.0.0.20"`, a single address, or a CIDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub first: Address,
    pub last: Address,
}

impl AddressRange {
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        if let Some((first, last)) = s.split_once('-') {
            let first = parse_address(first)?;
            let last = parse_address(last)?;
            if first > last {
                return Err(NetworkError::InvalidRange(s.to_string()));
            }
            return Ok(Self { first, last });
        }
        if s.contains('/') {
            return Ok(Ipv4Cidr::from_cidr(s)?.range());
        }
        let addr = parse_address(s)?;
        Ok(Self {
            first: addr,
            last: addr,
        })
    }

    pub fn contains(&self, addr: Address) -> bool {
        (self.first..=self.last).contains(&addr)
    }

    /// Number of addresses in the range.
    pub fn size(&self) -> u64 {
        u64::from(self.last) - u64::from(self.first) + 1
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.first == self.last {
            write!(f, "{}", format_address(self.first))
        } else {
            write!(
                f,
                "{} - {}",
                format_address(self.first),
                format_address(self.last)
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_cidr_bounds() {
        let cidr = Ipv4Cidr::from_cidr("10.0.0.0/24").unwrap();
        assert_eq!(format_address(cidr.network_id()), "10.0.0.0");
        assert_eq!(format_address(cidr.broadcast()), "10.0.0.255");
        assert_eq!(format_address(cidr.netmask()), "255.255.255.0");
        assert!(cidr.contains(parse_address("10.0.0.17").unwrap()));
        assert!(!cidr.contains(parse_address("10.0.1.17").unwrap()));
    }

    #[test]
    fn test_cidr_masks_host_bits() {
        let cidr = Ipv4Cidr::from_cidr("10.0.0.77/28").unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.64/28");
    }

    #[test]
    fn test_cidr_overlap() {
        let a = Ipv4Cidr::from_cidr("10.0.0.0/24").unwrap();
        let b = Ipv4Cidr::from_cidr("10.0.0.128/25").unwrap();
        let c = Ipv4Cidr::from_cidr("10.0.1.0/24").unwrap();
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[rstest]
    #[case("10.0.0.10 - 10.0.0.20", "10.0.0.10", "10.0.0.20")]
    #[case("10.0.0.10-10.0.0.20", "10.0.0.10", "10.0.0.20")]
    #[case("10.0.0.5", "10.0.0.5", "10.0.0.5")]
    #[case("10.0.0.0/30", "10.0.0.0", "10.0.0.3")]
    fn test_range_parse(#[case] input: &str, #[case] first: &str, #[case] last: &str) {
        let range = AddressRange::parse(input).unwrap();
        assert_eq!(range.first, parse_address(first).unwrap());
        assert_eq!(range.last, parse_address(last).unwrap());
    }

    #[rstest]
    #[case("10.0.0.20 - 10.0.0.10")]
    #[case("10.0.0")]
    #[case("10.0.0.0/33")]
    fn test_range_parse_rejects(#[case] input: &str) {
        assert!(AddressRange::parse(input).is_err());
    }
}
