//! Parser for the kernel's textual TCP socket tables (`/proc/net/tcp*`).
//!
//! Each entry line is whitespace delimited. Field 1 is the local
//! `ADDR:PORT` pair in hex, field 3 the connection state (`0A` = listening).
//! Addresses are stored as 32-bit words in the producing kernel's native
//! (little-endian) byte order, so every 8-hex-character word is byte-reversed
//! while decoding.

use std::cmp::Ordering;
use std::io::BufRead;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use itertools::Itertools;
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};

/// Connection state code of a listening socket.
pub const LISTEN_STATE: &str = "0A";

/// A port served by a local process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServedPort {
    pub address: IpAddr,
    pub port: u16,
    pub bound_to_localhost: bool,
}

impl ServedPort {
    /// Create a served port, deriving `bound_to_localhost` from the address.
    #[must_use]
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            bound_to_localhost: is_localhost(&address),
            address,
            port,
        }
    }
}

/// Read a whole socket table.
///
/// Malformed lines are skipped with a warning; only a failing reader is an error.
pub fn parse_table<R: BufRead>(reader: R, listening_only: bool) -> Result<Vec<ServedPort>> {
    let mut ports = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| Error::malformed(format!("unreadable line: {e}")))?;
        match parse_line(&line, listening_only) {
            Ok(Some(port)) => ports.push(port),
            Ok(None) => {}
            Err(e) => warn!(line = %line.trim(), error = %e, "Skipping socket table entry"),
        }
    }
    Ok(ports)
}

/// Parse one table line.
///
/// Returns `Ok(None)` for lines that are not entries of interest (the header,
/// short lines, non-listening sockets when `listening_only`).
pub fn parse_line(line: &str, listening_only: bool) -> Result<Option<ServedPort>> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let (Some(local), Some(state)) = (fields.get(1), fields.get(3)) else {
        return Ok(None);
    };
    if listening_only && *state != LISTEN_STATE {
        return Ok(None);
    }

    let (addr, port) = local
        .split_once(':')
        .ok_or_else(|| Error::malformed(format!("no port separator in '{local}'")))?;
    let port = u16::from_str_radix(port, 16)
        .map_err(|e| Error::malformed(format!("cannot parse port '{port}': {e}")))?;
    let address = decode_address(addr)?;

    Ok(Some(ServedPort::new(address, port)))
}

/// Decode a hex address of 8 (IPv4) or 32 (IPv6) characters.
pub fn decode_address(hex: &str) -> Result<IpAddr> {
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::malformed(format!("non-hex address '{hex}'")));
    }

    let mut bytes = Vec::with_capacity(16);
    for word in hex.as_bytes().chunks(8) {
        let word = std::str::from_utf8(word)
            .ok()
            .filter(|w| w.len() == 8)
            .ok_or_else(|| Error::malformed(format!("truncated address '{hex}'")))?;
        let value = u32::from_str_radix(word, 16)
            .map_err(|e| Error::malformed(format!("address word '{word}': {e}")))?;
        bytes.extend_from_slice(&value.to_le_bytes());
    }

    if let Ok(v4) = <[u8; 4]>::try_from(bytes.as_slice()) {
        return Ok(IpAddr::V4(Ipv4Addr::from(v4)));
    }
    if let Ok(v6) = <[u8; 16]>::try_from(bytes.as_slice()) {
        return Ok(IpAddr::V6(Ipv6Addr::from(v6)));
    }
    Err(Error::malformed(format!(
        "address '{hex}' is neither 8 nor 32 hex characters"
    )))
}

/// Build one listener snapshot from the entries of every table read this cycle.
///
/// Entries bound to `exclude_ip` (textual match) are dropped, `(address, port)`
/// duplicates keep their first occurrence, and the result is sorted twice:
/// by address then port, followed by a stable sort on port alone.
#[must_use]
pub fn snapshot<I>(entries: I, exclude_ip: &str) -> Vec<ServedPort>
where
    I: IntoIterator<Item = ServedPort>,
{
    let mut ports = entries
        .into_iter()
        .filter(|p| p.address.to_string() != exclude_ip)
        .unique_by(|p| (p.address, p.port))
        .collect_vec();

    ports.sort_by(|a, b| compare_address(&a.address, &b.address).then(a.port.cmp(&b.port)));
    ports.sort_by_key(|p| p.port);
    ports
}

/// Byte-wise address comparison; a 4-byte address sorts before a 16-byte
/// address sharing its prefix.
fn compare_address(a: &IpAddr, b: &IpAddr) -> Ordering {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets().cmp(&b.octets()),
        (IpAddr::V6(a), IpAddr::V6(b)) => a.octets().cmp(&b.octets()),
        (IpAddr::V4(a), IpAddr::V6(b)) => a.octets()[..].cmp(&b.octets()[..]),
        (IpAddr::V6(a), IpAddr::V4(b)) => a.octets()[..].cmp(&b.octets()[..]),
    }
}

fn is_localhost(address: &IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => *v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => *v6 == Ipv6Addr::LOCALHOST,
    }
}
