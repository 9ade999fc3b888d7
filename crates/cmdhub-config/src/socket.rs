use std::fmt;
use std::fs::DirBuilder;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Listening channel of the daemon, and by derivation every response channel.
///
/// Deserialises either from the tagged table form or from endpoint text such
/// as `tcp://127.0.0.1:12300`, so environment variables can carry it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "transport", rename_all = "snake_case", try_from = "EndpointRepr")]
pub enum SocketEndpoint {
    /// Unix domain socket addressed by a filesystem path.
    Unix { path: Utf8PathBuf },
    /// Loopback TCP socket; `port` is the base port of the response range.
    Tcp { host: String, port: u16 },
    /// Named pipe (FIFO) used as the listening channel.
    Pipe { path: Utf8PathBuf },
}

impl SocketEndpoint {
    /// Builds a Unix domain socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Builds a loopback TCP endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Builds a named pipe endpoint.
    #[must_use]
    pub fn pipe(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Pipe { path: path.into() }
    }

    /// Returns the filesystem path for the Unix and pipe transports.
    #[must_use]
    pub fn filesystem_path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Unix { path } | Self::Pipe { path } => Some(path.as_ref()),
            Self::Tcp { .. } => None,
        }
    }

    /// Names the response channel the daemon allocates for petition `id`.
    ///
    /// Unix sockets live beside the listening socket as `<path>_<id>`, TCP
    /// responses use port `base + id`, and pipes append the id to the pipe
    /// path. Returns `None` when a TCP response port would leave the valid
    /// port range.
    #[must_use]
    pub fn response_endpoint(&self, id: u32) -> Option<Self> {
        match self {
            Self::Unix { path } => Some(Self::unix(format!("{path}_{id}"))),
            Self::Tcp { host, port } => {
                let offset = u16::try_from(id).ok()?;
                let response_port = port.checked_add(offset)?;
                Some(Self::tcp(host.clone(), response_port))
            }
            Self::Pipe { path } => Some(Self::pipe(format!("{path}{id}"))),
        }
    }

    /// Ensures the parent directory of a filesystem endpoint exists with
    /// owner-only permissions.
    pub fn prepare_filesystem(&self) -> Result<(), SocketPreparationError> {
        let Some(path) = self.filesystem_path() else {
            return Ok(());
        };
        let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) else {
            return Err(SocketPreparationError::MissingParent {
                path: path.to_path_buf(),
            });
        };

        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }

        builder
            .create(parent.as_std_path())
            .map_err(|source| SocketPreparationError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(formatter, "unix://{path}"),
            Self::Tcp { host, port } => write!(formatter, "tcp://{host}:{port}"),
            Self::Pipe { path } => write!(formatter, "pipe://{path}"),
        }
    }
}

impl FromStr for SocketEndpoint {
    type Err = SocketParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(input)?;
        match url.scheme() {
            "unix" => Ok(Self::unix(path_component(&url, input)?)),
            "pipe" => Ok(Self::pipe(path_component(&url, input)?)),
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| SocketParseError::MissingHost(input.to_owned()))?;
                let port = url
                    .port()
                    .ok_or_else(|| SocketParseError::MissingPort(input.to_owned()))?;
                Ok(Self::tcp(host, port))
            }
            other => Err(SocketParseError::UnsupportedScheme(other.to_owned())),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EndpointRepr {
    Text(String),
    Tagged(TaggedEndpoint),
}

#[derive(Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
enum TaggedEndpoint {
    Unix { path: Utf8PathBuf },
    Tcp { host: String, port: u16 },
    Pipe { path: Utf8PathBuf },
}

impl TryFrom<EndpointRepr> for SocketEndpoint {
    type Error = SocketParseError;

    fn try_from(repr: EndpointRepr) -> Result<Self, Self::Error> {
        match repr {
            EndpointRepr::Text(text) => text.parse(),
            EndpointRepr::Tagged(TaggedEndpoint::Unix { path }) => Ok(Self::Unix { path }),
            EndpointRepr::Tagged(TaggedEndpoint::Tcp { host, port }) => Ok(Self::Tcp { host, port }),
            EndpointRepr::Tagged(TaggedEndpoint::Pipe { path }) => Ok(Self::Pipe { path }),
        }
    }
}

fn path_component<'a>(url: &'a Url, input: &str) -> Result<&'a str, SocketParseError> {
    let path = url.path();
    if path.is_empty() || path == "/" {
        return Err(SocketParseError::MissingPath(input.to_owned()));
    }
    Ok(path)
}

/// Errors encountered while parsing a [`SocketEndpoint`] from text.
#[derive(Debug, Error)]
pub enum SocketParseError {
    /// Scheme was not one of `unix`, `tcp` or `pipe`.
    #[error("unsupported socket scheme '{0}'")]
    UnsupportedScheme(String),
    /// TCP host name was missing.
    #[error("missing TCP host in '{0}'")]
    MissingHost(String),
    /// TCP port was missing from the address.
    #[error("missing TCP port in '{0}'")]
    MissingPort(String),
    /// Socket or pipe path was absent.
    #[error("missing filesystem path in '{0}'")]
    MissingPath(String),
    /// URL failed to parse.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

/// Errors raised when preparing socket directories.
#[derive(Debug, Error)]
pub enum SocketPreparationError {
    /// The endpoint path has no parent directory.
    #[error("socket path '{path}' has no parent directory")]
    MissingParent { path: Utf8PathBuf },
    /// Failed to create the socket directory.
    #[error("failed to create socket directory '{path}': {source}")]
    CreateDirectory {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}
