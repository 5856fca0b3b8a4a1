use crate::{checksum::Checksum, error::InputError};

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const MAX_TRIGGER_PAYLOAD: usize = 128;

const HTTP_SCHEME: &str = "http://";

/// Where an update image is fetched from, split out of an `http://host[:port]/path` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTarget {
    pub host: String,
    pub port: u16,
    /// Always starts with `/`.
    pub path: String,
}

impl UpdateTarget {
    pub fn parse(url: &str, max_len: usize) -> Result<Self, InputError> {
        if url.len() > max_len {
            return Err(InputError::UrlTooLong {
                len: url.len(),
                max: max_len,
            });
        }
        if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(InputError::InvalidCharacter);
        }

        let rest = url
            .strip_prefix(HTTP_SCHEME)
            .ok_or(InputError::UnsupportedScheme)?;
        let path_start = rest.find('/').ok_or(InputError::MissingPath)?;
        let (authority, path) = rest.split_at(path_start);

        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => {
                let parsed = port
                    .parse::<u16>()
                    .ok()
                    .filter(|value| *value != 0)
                    .ok_or_else(|| InputError::InvalidPort(port.to_string()))?;
                (host, parsed)
            }
            None => (authority, DEFAULT_HTTP_PORT),
        };

        if host.is_empty() {
            return Err(InputError::MissingHost);
        }

        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    pub fn host_header(&self) -> String {
        if self.port == DEFAULT_HTTP_PORT {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn request(&self) -> String {
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
            self.path,
            self.host_header()
        )
    }
}

/// An update command as it arrives from the messaging layer: `<url>|<md5>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRequest {
    pub url: String,
    pub checksum: Checksum,
}

impl TriggerRequest {
    pub fn new(url: impl Into<String>, checksum: &str) -> Result<Self, InputError> {
        Ok(Self {
            url: url.into(),
            checksum: Checksum::parse(checksum.as_bytes())?,
        })
    }

    /// The checksum part does not need to be terminated; exactly 32 bytes are read from it.
    pub fn parse(payload: &[u8]) -> Result<Self, InputError> {
        if payload.len() > MAX_TRIGGER_PAYLOAD {
            return Err(InputError::PayloadTooLong {
                len: payload.len(),
                max: MAX_TRIGGER_PAYLOAD,
            });
        }

        let separator = payload
            .iter()
            .position(|byte| *byte == b'|')
            .ok_or(InputError::MissingSeparator)?;

        let url = core::str::from_utf8(&payload[..separator])
            .map_err(|_| InputError::InvalidEncoding)?;
        let checksum = Checksum::parse(&payload[separator + 1..])?;

        Ok(Self {
            url: url.to_string(),
            checksum,
        })
    }
}
