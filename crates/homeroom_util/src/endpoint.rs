#![forbid(unsafe_code)]

//! `quic://host[:port]` endpoint addresses, shared by the server's `--bind`
//! flag and the client config.

use std::net::SocketAddr;

use thiserror::Error;

/// Port used when an endpoint omits one.
pub const DEFAULT_PORT: u16 = 18590;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
	#[error("endpoint must start with quic:// (got: {0})")]
	MissingScheme(String),

	#[error("endpoint must not carry a path, query, or fragment (got: {0})")]
	TrailingComponent(String),

	#[error("endpoint host is empty (expected quic://host[:port]): {0}")]
	EmptyHost(String),

	#[error("IPv6 hosts must be bracketed, like quic://[::1]:18590 (got: {0})")]
	UnbracketedIpv6(String),

	#[error("endpoint port must be 1..=65535 (got: {0})")]
	InvalidPort(String),

	#[error("host is not an IP literal (resolve it before binding): {0}")]
	HostNotIpLiteral(String),
}

/// A parsed endpoint. Bracketed IPv6 hosts keep their brackets so
/// [`hostport`](Self::hostport) round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuicEndpoint {
	pub host: String,
	pub port: u16,
}

impl QuicEndpoint {
	/// Parse `quic://host[:port]`; a missing port means [`DEFAULT_PORT`].
	pub fn parse(input: &str) -> Result<Self, EndpointError> {
		let trimmed = input.trim();
		let rest = trimmed
			.strip_prefix("quic://")
			.ok_or_else(|| EndpointError::MissingScheme(trimmed.to_string()))?;

		if rest.contains(['/', '?', '#']) {
			return Err(EndpointError::TrailingComponent(trimmed.to_string()));
		}

		let (host, port) = split_host_port(rest, trimmed)?;
		if host.is_empty() {
			return Err(EndpointError::EmptyHost(trimmed.to_string()));
		}

		Ok(Self {
			host: host.to_string(),
			port,
		})
	}

	/// `host:port` suitable for SNI/dialing.
	pub fn hostport(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// The endpoint as a socket address, when the host is an IP literal.
	pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, EndpointError> {
		self.hostport()
			.parse()
			.map_err(|_| EndpointError::HostNotIpLiteral(self.host.clone()))
	}
}

// Bracketed IPv6 is handled first so its colons never read as a port
// separator.
fn split_host_port<'a>(rest: &'a str, whole: &str) -> Result<(&'a str, u16), EndpointError> {
	if let Some(after_bracket) = rest.strip_prefix('[') {
		let end = after_bracket
			.find(']')
			.ok_or_else(|| EndpointError::UnbracketedIpv6(whole.to_string()))?;
		let host = &rest[..end + 2];
		let tail = &after_bracket[end + 1..];

		return match tail.strip_prefix(':') {
			Some(port) => Ok((host, parse_port(port, whole)?)),
			None if tail.is_empty() => Ok((host, DEFAULT_PORT)),
			None => Err(EndpointError::InvalidPort(whole.to_string())),
		};
	}

	match rest.rsplit_once(':') {
		None => Ok((rest, DEFAULT_PORT)),
		Some((host, _)) if host.contains(':') => Err(EndpointError::UnbracketedIpv6(whole.to_string())),
		Some((host, port)) => Ok((host, parse_port(port, whole)?)),
	}
}

fn parse_port(s: &str, whole: &str) -> Result<u16, EndpointError> {
	match s.trim().parse::<u16>() {
		Ok(0) | Err(_) => Err(EndpointError::InvalidPort(whole.to_string())),
		Ok(port) => Ok(port),
	}
}
