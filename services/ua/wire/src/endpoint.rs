//! Endpoint URL parsing.

use crate::error::WireError;
use std::fmt;

/// Port used when the URL names none
pub const DEFAULT_PORT: u16 = 4840;

/// Parts of an endpoint URL such as `opc.tcp://host:4840/path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUrl {
    /// Scheme, e.g. `opc.tcp`
    pub protocol: String,
    /// Host name or address
    pub hostname: String,
    /// TCP port
    pub port: u16,
    /// Path including the leading `/`, empty when absent
    pub address: String,
}

impl fmt::Display for EndpointUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.protocol, self.hostname, self.port, self.address
        )
    }
}

fn is_scheme_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-')
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')
}

/// Split an endpoint URL into protocol, host, port and path
pub fn parse_endpoint_url(url: &str) -> Result<EndpointUrl, WireError> {
    let invalid = || WireError::EndpointUrl(url.to_string());

    let (protocol, rest) = url.split_once("://").ok_or_else(invalid)?;
    if protocol.is_empty() || !protocol.chars().all(is_scheme_char) {
        return Err(invalid());
    }

    let (authority, address) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };

    // Bracketed IPv6 literal
    let (hostname, port) = if let Some(stripped) = authority.strip_prefix('[') {
        let (host, after) = stripped.split_once(']').ok_or_else(invalid)?;
        if host.is_empty() || !host.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
            return Err(invalid());
        }
        (host, after.strip_prefix(':'))
    } else {
        match authority.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    if hostname.is_empty() {
        return Err(invalid());
    }
    if !authority.starts_with('[') && !hostname.chars().all(is_host_char) {
        return Err(invalid());
    }

    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
        None => DEFAULT_PORT,
    };

    Ok(EndpointUrl {
        protocol: protocol.to_string(),
        hostname: hostname.to_string(),
        port,
        address: address.to_string(),
    })
}
