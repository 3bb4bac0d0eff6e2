use log::debug;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SERVER: &str = "whois.arin.net:43";
const TIMEOUT: Duration = Duration::from_secs(15);
/// Responses larger than this are truncated
const MAX_RESPONSE: u64 = 1 << 20;

/// Ownership lookup for a single IP
pub trait WhoIs {
    fn who_is(&self, ip: &str) -> Result<BTreeMap<String, String>, WhoIsError>;
}

#[derive(Debug, Error)]
pub enum WhoIsError {
    #[error("could not resolve whois server '{0}'")]
    Resolve(String),
    #[error("connection to {server} failed: {source}")]
    Connect {
        server: String,
        #[source]
        source: io::Error,
    },
    #[error("i/o error talking to {server}: {source}")]
    Io {
        server: String,
        #[source]
        source: io::Error,
    },
}

/// Plain port-43 whois client
#[derive(Debug, Clone)]
pub struct WhoisClient {
    server: String,
    timeout: Duration,
}

impl WhoisClient {
    pub fn new(server: impl Into<String>) -> Self {
        WhoisClient {
            server: server.into(),
            timeout: TIMEOUT,
        }
    }

    /// Uses `WHOIS_SERVER` when set, ARIN otherwise.
    pub fn from_env() -> Self {
        match std::env::var("WHOIS_SERVER") {
            Ok(server) if !server.trim().is_empty() => Self::new(server.trim()),
            _ => Self::new(DEFAULT_SERVER),
        }
    }

    fn query(&self, ip: &str) -> Result<String, WhoIsError> {
        let addr = self
            .server
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| WhoIsError::Resolve(self.server.clone()))?;

        let io_err = |source| WhoIsError::Io {
            server: self.server.clone(),
            source,
        };

        let mut stream =
            TcpStream::connect_timeout(&addr, self.timeout).map_err(|source| {
                WhoIsError::Connect {
                    server: self.server.clone(),
                    source,
                }
            })?;
        stream.set_read_timeout(Some(self.timeout)).map_err(io_err)?;
        stream.set_write_timeout(Some(self.timeout)).map_err(io_err)?;

        // ARIN: "n" restricts to networks, "+" asks for the expanded record
        stream
            .write_all(format!("n + {}\r\n", ip).as_bytes())
            .map_err(io_err)?;

        let mut raw = Vec::new();
        stream
            .take(MAX_RESPONSE)
            .read_to_end(&mut raw)
            .map_err(io_err)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

impl WhoIs for WhoisClient {
    fn who_is(&self, ip: &str) -> Result<BTreeMap<String, String>, WhoIsError> {
        debug!("whois lookup for {} via {}", ip, self.server);
        let response = self.query(ip)?;
        let info = parse_response(&response);
        debug!("whois for {} returned {} fields", ip, info.len());
        Ok(info)
    }
}

static FIELD_REGEX: OnceLock<Regex> = OnceLock::new();

fn field_regex() -> &'static Regex {
    FIELD_REGEX.get_or_init(|| {
        Regex::new(r"^(?P<key>[A-Za-z][A-Za-z0-9_-]*):\s*(?P<value>.*?)\s*$")
            .expect("hard-coded regex should always compile")
    })
}

/// Turn a raw `Key: value` whois response into a field map.
///
/// Blocks are separated by blank lines. Inside a block a repeated key has its
/// values joined with ", "; a later block overrides earlier ones, since
/// registries list the most specific record last.
pub fn parse_response(response: &str) -> BTreeMap<String, String> {
    let re = field_regex();
    let mut info = BTreeMap::new();
    let mut block: BTreeMap<String, String> = BTreeMap::new();

    for line in response.lines().chain(std::iter::once("")) {
        let line = line.trim_end();
        if line.trim().is_empty() {
            info.append(&mut block);
            continue;
        }
        if line.starts_with('#') || line.starts_with('%') {
            continue;
        }
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let value = &caps["value"];
        if value.is_empty() {
            continue;
        }
        block
            .entry(caps["key"].to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    info
}
