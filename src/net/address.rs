//! LDAP URL parsing for listeners and backends.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use percent_encoding::percent_decode_str;
use url::{Host, Url};

/// Transport selected by the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// `ldap://`
    Plain,
    /// `ldaps://`
    Tls,
    /// `ldapi://`, a Unix domain socket.
    Local,
}

/// Where a socket binds or connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    /// Host name for TLS server name verification.
    pub fn host(&self) -> Option<&str> {
        match self {
            Endpoint::Tcp { host, .. } => Some(host),
            Endpoint::Unix(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Error type for URL parsing.
#[derive(Debug, thiserror::Error)]
pub enum UrlError {
    #[error("invalid URL: {0}")]
    Parse(#[from] url::ParseError),
    #[error("unsupported scheme '{0}', expected ldap, ldaps or ldapi")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("ldapi URL has no socket path")]
    MissingPath,
}

/// A parsed `ldap://`, `ldaps://` or `ldapi://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUrl {
    pub transport: Transport,
    pub endpoint: Endpoint,
}

impl FromStr for LdapUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s)?;
        let (transport, default_port) = match url.scheme() {
            "ldap" => (Transport::Plain, 389),
            "ldaps" => (Transport::Tls, 636),
            "ldapi" => (Transport::Local, 0),
            other => return Err(UrlError::UnsupportedScheme(other.to_string())),
        };

        if transport == Transport::Local {
            let encoded = url.host_str().unwrap_or_default();
            let path = percent_decode_str(encoded).decode_utf8_lossy().into_owned();
            if path.is_empty() {
                return Err(UrlError::MissingPath);
            }
            return Ok(Self {
                transport,
                endpoint: Endpoint::Unix(PathBuf::from(path)),
            });
        }

        let host = match url.host().ok_or(UrlError::MissingHost)? {
            Host::Domain(domain) => domain.to_string(),
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
        };
        if host.is_empty() {
            return Err(UrlError::MissingHost);
        }

        Ok(Self {
            transport,
            endpoint: Endpoint::Tcp {
                host,
                port: url.port().unwrap_or(default_port),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_schemes_with_default_ports() {
        let url: LdapUrl = "ldap://dir.example.com".parse().unwrap();
        assert_eq!(url.transport, Transport::Plain);
        assert_eq!(url.endpoint.to_string(), "dir.example.com:389");

        let url: LdapUrl = "ldaps://10.0.0.1".parse().unwrap();
        assert_eq!(url.transport, Transport::Tls);
        assert_eq!(url.endpoint.to_string(), "10.0.0.1:636");

        let url: LdapUrl = "ldap://127.0.0.1:1389".parse().unwrap();
        assert_eq!(url.endpoint.to_string(), "127.0.0.1:1389");
    }

    #[test]
    fn parses_ipv6_hosts() {
        let url: LdapUrl = "ldap://[::1]:1389".parse().unwrap();
        assert_eq!(url.endpoint.host(), Some("::1"));
        assert_eq!(url.endpoint.to_string(), "[::1]:1389");
    }

    #[test]
    fn parses_ldapi_paths() {
        let url: LdapUrl = "ldapi://%2Fvar%2Frun%2Fldapi".parse().unwrap();
        assert_eq!(url.transport, Transport::Local);
        assert_eq!(url.endpoint, Endpoint::Unix(PathBuf::from("/var/run/ldapi")));
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(
            "http://example.com".parse::<LdapUrl>(),
            Err(UrlError::UnsupportedScheme(_))
        ));
        assert!(matches!("ldapi://".parse::<LdapUrl>(), Err(UrlError::MissingPath)));
    }
}
