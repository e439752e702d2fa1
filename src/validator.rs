//! IP candidate validation and normalization.
//!
//! Only strict dotted-quad IPv4 is accepted. Private, loopback and
//! reserved/broadcast first octets are rejected so internal infrastructure can
//! never end up on the blacklist.

use ipnet::Ipv4Net;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

const PRIVATE_RANGES: [Ipv4Net; 3] = [
    Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 8),
    Ipv4Net::new_assert(Ipv4Addr::new(172, 16, 0, 0), 12),
    Ipv4Net::new_assert(Ipv4Addr::new(192, 168, 0, 0), 16),
];

const LOOPBACK: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(127, 0, 0, 0), 8);

/// An IP address that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ValidIp(Ipv4Addr);

impl ValidIp {
    pub fn addr(&self) -> Ipv4Addr {
        self.0
    }
}

impl fmt::Display for ValidIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("not a dotted-quad IPv4 address")]
    Malformed,
    #[error("address is in a private range")]
    Private,
    #[error("address is loopback")]
    Loopback,
    #[error("first octet is reserved")]
    Reserved,
}

/// Validate a candidate string. Surrounding whitespace is ignored.
pub fn validate(candidate: &str) -> Result<ValidIp, Rejected> {
    let addr = parse_dotted_quad(candidate.trim()).ok_or(Rejected::Malformed)?;

    let first = addr.octets()[0];
    if first == 0 || first == 255 {
        return Err(Rejected::Reserved);
    }
    if LOOPBACK.contains(&addr) {
        return Err(Rejected::Loopback);
    }
    if PRIVATE_RANGES.iter().any(|net| net.contains(&addr)) {
        return Err(Rejected::Private);
    }

    Ok(ValidIp(addr))
}

/// Four decimal octets, 1-3 digits each, no leading zeros, each in [0,255].
fn parse_dotted_quad(s: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = s.split('.');

    for octet in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty()
            || part.len() > 3
            || !part.bytes().all(|b| b.is_ascii_digit())
            || (part.len() > 1 && part.starts_with('0'))
        {
            return None;
        }
        *octet = part.parse::<u8>().ok()?;
    }

    if parts.next().is_some() {
        return None;
    }

    Some(Ipv4Addr::from(octets))
}
