//! Transport endpoint descriptions.
//!
//! An [`Address`] starts without a family. The first family specific mutator fixes the family,
//! and mutators of any other family fail with [`SocketError::InvalidAddress`] until the family
//! is reset through [`Address::set_family`].

use std::fmt::{self, Display, Formatter};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use socket2::{Domain, SockAddr};

use crate::error::{IntoSocketError, Result, SocketError};
use crate::services;

/// Maximum length in bytes of a Unix socket path, `sun_path` minus the terminating NUL.
pub const UNIX_PATH_MAX: usize = 107;

/// Protocol used for service lookups when none is given.
const DEFAULT_PROTOCOL: &str = "tcp";

/// The family of an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum AddressFamily {
    /// No family has been chosen yet.
    #[default]
    None,
    /// IPv4 host and port.
    Inet,
    /// IPv6 host and port.
    Inet6,
    /// Unix domain socket path.
    Unix,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
enum Endpoint {
    #[default]
    Unset,
    Inet(SocketAddrV4),
    Inet6(SocketAddrV6),
    Unix(Utf8PathBuf),
}

impl Endpoint {
    fn family(&self) -> AddressFamily {
        match self {
            Endpoint::Unset => AddressFamily::None,
            Endpoint::Inet(_) => AddressFamily::Inet,
            Endpoint::Inet6(_) => AddressFamily::Inet6,
            Endpoint::Unix(_) => AddressFamily::Unix,
        }
    }

    fn empty(family: AddressFamily) -> Self {
        match family {
            AddressFamily::None => Endpoint::Unset,
            AddressFamily::Inet => Endpoint::Inet(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            AddressFamily::Inet6 => {
                Endpoint::Inet6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0))
            }
            AddressFamily::Unix => Endpoint::Unix(Utf8PathBuf::new()),
        }
    }
}

/// A transport endpoint: IPv4 or IPv6 host and port, or a Unix socket path.
///
/// Addresses are plain values. Sockets store copies, so changing an address after handing it to
/// a socket does not affect the socket.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct Address {
    endpoint: Endpoint,

    /// The host name as given by the caller, kept so it can be read back verbatim.
    host_name: Option<String>,
}

/// Copies `value` into `buffer`, failing without side effects if it does not fit.
fn copy_into(value: &str, buffer: &mut [u8]) -> Result<usize> {
    let bytes = value.as_bytes();
    let Some(target) = buffer.get_mut(..bytes.len()) else {
        return Err(SocketError::BufferTooSmall {
            required: bytes.len(),
        });
    };
    target.copy_from_slice(bytes);
    Ok(bytes.len())
}

fn resolve<T>(host: &str, pick: impl Fn(SocketAddr) -> Option<T>) -> Result<T> {
    if host.is_empty() {
        return Err(SocketError::NoHost);
    }
    (host, 0)
        .to_socket_addrs()
        .map_err(|error| {
            tracing::debug!(%host, ?error, "host name resolution failed");
            SocketError::NoHost
        })?
        .find_map(pick)
        .ok_or(SocketError::NoHost)
}

impl Address {
    /// Creates an address without a family.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the address family, [`AddressFamily::None`] until one is set.
    pub fn family(&self) -> AddressFamily {
        self.endpoint.family()
    }

    /// Resets the address to the empty value of `family`.
    ///
    /// This is the only way to switch an address to a different family.
    pub fn set_family(&mut self, family: AddressFamily) {
        self.endpoint = Endpoint::empty(family);
        self.host_name = None;
    }

    fn inet_mut(&mut self) -> Result<&mut SocketAddrV4> {
        if self.endpoint == Endpoint::Unset {
            self.set_family(AddressFamily::Inet);
        }
        match &mut self.endpoint {
            Endpoint::Inet(address) => Ok(address),
            _ => Err(SocketError::InvalidAddress),
        }
    }

    fn inet(&self) -> Result<&SocketAddrV4> {
        match &self.endpoint {
            Endpoint::Inet(address) => Ok(address),
            _ => Err(SocketError::InvalidAddress),
        }
    }

    fn inet6_mut(&mut self) -> Result<&mut SocketAddrV6> {
        if self.endpoint == Endpoint::Unset {
            self.set_family(AddressFamily::Inet6);
        }
        match &mut self.endpoint {
            Endpoint::Inet6(address) => Ok(address),
            _ => Err(SocketError::InvalidAddress),
        }
    }

    fn inet6(&self) -> Result<&SocketAddrV6> {
        match &self.endpoint {
            Endpoint::Inet6(address) => Ok(address),
            _ => Err(SocketError::InvalidAddress),
        }
    }

    fn host_text(&self, ip: impl Display) -> String {
        self.host_name.clone().unwrap_or_else(|| ip.to_string())
    }

    /// Sets the IPv4 host from a host name or dotted-quad string.
    pub fn inet_set_host_name(&mut self, host: &str) -> Result<()> {
        self.inet_mut()?;
        let ip = match Ipv4Addr::from_str(host) {
            Ok(ip) => ip,
            Err(_) => resolve(host, |address| match address {
                SocketAddr::V4(address) => Some(*address.ip()),
                SocketAddr::V6(_) => None,
            })?,
        };
        self.inet_mut()?.set_ip(ip);
        self.host_name = Some(host.to_owned());
        Ok(())
    }

    /// Sets the IPv4 host to `0.0.0.0`.
    pub fn inet_set_any_address(&mut self) -> Result<()> {
        self.inet_set_host_address(Ipv4Addr::UNSPECIFIED.into())
    }

    /// Sets the IPv4 host to `255.255.255.255`.
    pub fn inet_set_broadcast_address(&mut self) -> Result<()> {
        self.inet_set_host_address(Ipv4Addr::BROADCAST.into())
    }

    /// Sets the IPv4 host from a host-byte-order integer, `0x7f000001` is `127.0.0.1`.
    pub fn inet_set_host_address(&mut self, host: u32) -> Result<()> {
        self.inet_mut()?.set_ip(Ipv4Addr::from(host));
        self.host_name = None;
        Ok(())
    }

    /// Sets the IPv4 port from a service name such as `"http"` or a numeric string.
    ///
    /// `protocol` defaults to `"tcp"`.
    pub fn inet_set_port_name(&mut self, service: &str, protocol: Option<&str>) -> Result<()> {
        self.inet_mut()?;
        let port = services::lookup(service, protocol.unwrap_or(DEFAULT_PROTOCOL))
            .ok_or(SocketError::InvalidPort)?;
        self.inet_mut()?.set_port(port);
        Ok(())
    }

    /// Sets the IPv4 port.
    pub fn inet_set_port(&mut self, port: u16) -> Result<()> {
        self.inet_mut()?.set_port(port);
        Ok(())
    }

    /// Returns the IPv4 host name, or the numeric form if no name was set.
    pub fn inet_host_name(&self) -> Result<String> {
        let address = self.inet()?;
        Ok(self.host_text(address.ip()))
    }

    /// Copies the IPv4 host name into `buffer`, returning the number of bytes written.
    pub fn inet_copy_host_name(&self, buffer: &mut [u8]) -> Result<usize> {
        copy_into(&self.inet_host_name()?, buffer)
    }

    /// Returns the IPv4 host as a host-byte-order integer.
    pub fn inet_host_address(&self) -> Result<u32> {
        Ok(u32::from(*self.inet()?.ip()))
    }

    /// Returns the IPv4 port.
    pub fn inet_port(&self) -> Result<u16> {
        Ok(self.inet()?.port())
    }

    /// Sets the IPv6 host from a host name or numeric IPv6 string.
    pub fn inet6_set_host_name(&mut self, host: &str) -> Result<()> {
        self.inet6_mut()?;
        let ip = match Ipv6Addr::from_str(host) {
            Ok(ip) => ip,
            Err(_) => resolve(host, |address| match address {
                SocketAddr::V6(address) => Some(*address.ip()),
                SocketAddr::V4(_) => None,
            })?,
        };
        self.inet6_mut()?.set_ip(ip);
        self.host_name = Some(host.to_owned());
        Ok(())
    }

    /// Sets the IPv6 host to `::`.
    pub fn inet6_set_any_address(&mut self) -> Result<()> {
        self.inet6_set_host_address(Ipv6Addr::UNSPECIFIED)
    }

    /// Sets the IPv6 host.
    pub fn inet6_set_host_address(&mut self, host: Ipv6Addr) -> Result<()> {
        self.inet6_mut()?.set_ip(host);
        self.host_name = None;
        Ok(())
    }

    /// Sets the IPv6 port from a service name or numeric string.
    ///
    /// `protocol` defaults to `"tcp"`.
    pub fn inet6_set_port_name(&mut self, service: &str, protocol: Option<&str>) -> Result<()> {
        self.inet6_mut()?;
        let port = services::lookup(service, protocol.unwrap_or(DEFAULT_PROTOCOL))
            .ok_or(SocketError::InvalidPort)?;
        self.inet6_mut()?.set_port(port);
        Ok(())
    }

    /// Sets the IPv6 port.
    pub fn inet6_set_port(&mut self, port: u16) -> Result<()> {
        self.inet6_mut()?.set_port(port);
        Ok(())
    }

    /// Returns the IPv6 host name, or the numeric form if no name was set.
    pub fn inet6_host_name(&self) -> Result<String> {
        let address = self.inet6()?;
        Ok(self.host_text(address.ip()))
    }

    /// Copies the IPv6 host name into `buffer`, returning the number of bytes written.
    pub fn inet6_copy_host_name(&self, buffer: &mut [u8]) -> Result<usize> {
        copy_into(&self.inet6_host_name()?, buffer)
    }

    /// Returns the IPv6 host.
    pub fn inet6_host_address(&self) -> Result<Ipv6Addr> {
        Ok(*self.inet6()?.ip())
    }

    /// Returns the IPv6 port.
    pub fn inet6_port(&self) -> Result<u16> {
        Ok(self.inet6()?.port())
    }

    /// Sets the Unix socket path.
    ///
    /// Fails with [`SocketError::InvalidAddress`] for empty paths and paths longer than
    /// [`UNIX_PATH_MAX`] bytes.
    pub fn unix_set_path(&mut self, path: impl AsRef<Utf8Path>) -> Result<()> {
        let path = path.as_ref();
        if self.endpoint == Endpoint::Unset {
            self.set_family(AddressFamily::Unix);
        }
        let Endpoint::Unix(current) = &mut self.endpoint else {
            return Err(SocketError::InvalidAddress);
        };
        if path.as_str().is_empty() || path.as_str().len() > UNIX_PATH_MAX {
            return Err(SocketError::InvalidAddress);
        }
        *current = path.to_owned();
        Ok(())
    }

    /// Returns the Unix socket path.
    pub fn unix_path(&self) -> Result<&Utf8Path> {
        match &self.endpoint {
            Endpoint::Unix(path) => Ok(path),
            _ => Err(SocketError::InvalidAddress),
        }
    }

    /// Copies the Unix socket path into `buffer`, returning the number of bytes written.
    pub fn unix_copy_path(&self, buffer: &mut [u8]) -> Result<usize> {
        copy_into(self.unix_path()?.as_str(), buffer)
    }

    /// Returns the IP socket address for `Inet` and `Inet6` addresses.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.endpoint {
            Endpoint::Inet(address) => Some((*address).into()),
            Endpoint::Inet6(address) => Some((*address).into()),
            Endpoint::Unset | Endpoint::Unix(_) => None,
        }
    }

    pub(crate) fn domain(&self) -> Result<Domain> {
        match self.endpoint {
            Endpoint::Unset => Err(SocketError::InvalidAddress),
            Endpoint::Inet(_) => Ok(Domain::IPV4),
            Endpoint::Inet6(_) => Ok(Domain::IPV6),
            Endpoint::Unix(_) => Ok(Domain::UNIX),
        }
    }

    pub(crate) fn to_sock_addr(&self) -> Result<SockAddr> {
        match &self.endpoint {
            Endpoint::Unset => Err(SocketError::InvalidAddress),
            Endpoint::Inet(address) => Ok(SockAddr::from(*address)),
            Endpoint::Inet6(address) => Ok(SockAddr::from(*address)),
            Endpoint::Unix(path) if path.as_str().is_empty() => Err(SocketError::InvalidAddress),
            Endpoint::Unix(path) => {
                SockAddr::unix(path.as_std_path()).map_err(IntoSocketError::into_socket_error)
            }
        }
    }

    pub(crate) fn from_sock_addr(address: &SockAddr) -> Self {
        if let Some(address) = address.as_socket() {
            return Self::from(address);
        }
        let endpoint = address
            .as_pathname()
            .and_then(|path| Utf8Path::from_path(path))
            .map(|path| Endpoint::Unix(path.to_owned()))
            // Unnamed and abstract Unix sockets have no path to report.
            .unwrap_or_else(|| Endpoint::empty(AddressFamily::Unix));
        Self {
            endpoint,
            host_name: None,
        }
    }

    pub(crate) fn from_unix_socket_addr(address: &std::os::unix::net::SocketAddr) -> Self {
        let endpoint = address
            .as_pathname()
            .and_then(Utf8Path::from_path)
            .map(|path| Endpoint::Unix(path.to_owned()))
            .unwrap_or_else(|| Endpoint::empty(AddressFamily::Unix));
        Self {
            endpoint,
            host_name: None,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(address: SocketAddr) -> Self {
        let endpoint = match address {
            SocketAddr::V4(address) => Endpoint::Inet(address),
            SocketAddr::V6(address) => Endpoint::Inet6(address),
        };
        Self {
            endpoint,
            host_name: None,
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (&self.endpoint, &self.host_name) {
            (Endpoint::Unset, _) => f.write_str("<unset>"),
            (Endpoint::Inet(address), Some(host)) => write!(f, "{host}:{}", address.port()),
            (Endpoint::Inet(address), None) => address.fmt(f),
            (Endpoint::Inet6(address), Some(host)) if Ipv6Addr::from_str(host).is_err() => {
                write!(f, "{host}:{}", address.port())
            }
            (Endpoint::Inet6(address), _) => write!(f, "[{}]:{}", address.ip(), address.port()),
            (Endpoint::Unix(path), _) => path.fmt(f),
        }
    }
}

/// Errors that can occur when parsing an [`Address`] from text.
#[derive(thiserror::Error, Debug, Clone)]
pub enum AddressParseError {
    /// Missing ':' separator between host and port.
    #[error("missing ':' separator (Unix paths must start with '/', './', or '../')")]
    MissingSeparator,

    /// Invalid port number format.
    #[error("invalid port number")]
    InvalidPortNumber(#[source] std::num::ParseIntError),

    /// Invalid hostname format.
    #[error("invalid hostname: {0}")]
    InvalidHostname(&'static str),

    /// The address is well formed but could not be applied.
    #[error("unusable address")]
    Address(#[from] SocketError),
}

/// Validates hostname according to [RFC 1123 §2.1] + [RFC 952] syntax rules:
///
/// - Total length <= 253 characters
/// - Each label (part between dots) <= 63 characters
/// - Labels contain only alphanumeric characters and hyphens
/// - Labels cannot start or end with hyphens
/// - Trailing dot allowed for Fully Qualified Domain Name (FQDN)
///
/// [RFC 1123 §2.1]: https://datatracker.ietf.org/doc/html/rfc1123#section-2
/// [RFC 952]: https://datatracker.ietf.org/doc/html/rfc952
fn validate_hostname(host: &str) -> Result<(), AddressParseError> {
    let invalid = |reason| Err(AddressParseError::InvalidHostname(reason));

    if host.is_empty() {
        return invalid("is empty");
    }
    if host.len() > 253 {
        return invalid("is too long");
    }
    if host.starts_with('.') {
        return invalid("starts with period");
    }

    // Strip a trailing `.` to allow for FQDN.
    for label in host.strip_suffix('.').unwrap_or(host).split('.') {
        if label.is_empty() {
            return invalid("contains empty label");
        }
        if label.len() > 63 {
            return invalid("label too long");
        }
        if label.starts_with('-') {
            return invalid("label starts with dash");
        }
        if label.ends_with('-') {
            return invalid("label ends with dash");
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return invalid("label contains disallowed character");
        }
    }

    Ok(())
}

impl FromStr for Address {
    type Err = AddressParseError;

    /// Parses `host:port`, `[ipv6]:port`, or a Unix path starting with `/`, `./` or `../`.
    ///
    /// Host names are resolved, preferring IPv4 and falling back to IPv6.
    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let mut address = Address::new();

        if string.starts_with('/') || string.starts_with("./") || string.starts_with("../") {
            address.unix_set_path(string)?;
            return Ok(address);
        }

        let (host, port) = string
            .rsplit_once(':')
            .ok_or(AddressParseError::MissingSeparator)?;
        let port = port
            .parse()
            .map_err(AddressParseError::InvalidPortNumber)?;

        if let Some(host) = host
            .strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
        {
            let ip = Ipv6Addr::from_str(host)
                .map_err(|_| AddressParseError::InvalidHostname("invalid IPv6 address"))?;
            address.inet6_set_host_address(ip)?;
            address.inet6_set_port(port)?;
            return Ok(address);
        }

        if Ipv4Addr::from_str(host).is_err() {
            validate_hostname(host)?;
        }

        match address.inet_set_host_name(host) {
            Ok(()) => address.inet_set_port(port)?,
            Err(SocketError::NoHost) => {
                address.set_family(AddressFamily::Inet6);
                address.inet6_set_host_name(host)?;
                address.inet6_set_port(port)?;
            }
            Err(error) => return Err(error.into()),
        }
        Ok(address)
    }
}
