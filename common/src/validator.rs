use log::warn;

use crate::{config::OtaConfig, error::ProtocolError};

/// Checks the status line and the headers an update response must carry.
#[derive(Debug, Clone)]
pub struct ResponseValidator {
    min_length: u64,
    max_length: u64,
    accepted_content_type: String,

    saw_status_line: bool,
    content_length: Option<u64>,
    content_type_accepted: bool,
}

impl ResponseValidator {
    pub fn new(config: &OtaConfig) -> Self {
        Self {
            min_length: config.min_content_length,
            max_length: config.max_content_length,
            accepted_content_type: config.accepted_content_type.clone(),
            saw_status_line: false,
            content_length: None,
            content_type_accepted: false,
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn content_type_accepted(&self) -> bool {
        self.content_type_accepted
    }

    /// The first line is the status line; header names after it are matched case-insensitively.
    pub fn on_header_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        if !self.saw_status_line {
            self.saw_status_line = true;
            return check_status_line(line);
        }

        let Some((name, value)) = line.split_once(':') else {
            return Ok(());
        };
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            self.on_content_length(value)
        } else if name.eq_ignore_ascii_case("content-type") {
            self.on_content_type(value)
        } else {
            Ok(())
        }
    }

    /// Called at the blank line; yields the expected body length.
    pub fn finish(&self) -> Result<u64, ProtocolError> {
        if !self.saw_status_line {
            return Err(ProtocolError::MissingStatusLine);
        }
        let length = self
            .content_length
            .ok_or(ProtocolError::MissingHeader("Content-Length"))?;
        if !self.content_type_accepted {
            return Err(ProtocolError::MissingHeader("Content-Type"));
        }
        Ok(length)
    }

    fn on_content_length(&mut self, value: &str) -> Result<(), ProtocolError> {
        let length = value
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidContentLength(value.to_string()))?;
        if !(self.min_length..=self.max_length).contains(&length) {
            return Err(ProtocolError::ContentLengthOutOfRange {
                length,
                min: self.min_length,
                max: self.max_length,
            });
        }

        match self.content_length {
            None => self.content_length = Some(length),
            Some(first) if first != length => {
                warn!("ota: ignoring conflicting Content-Length {length}, keeping {first}");
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn on_content_type(&mut self, value: &str) -> Result<(), ProtocolError> {
        if value != self.accepted_content_type {
            return Err(ProtocolError::InvalidContentType(value.to_string()));
        }
        self.content_type_accepted = true;
        Ok(())
    }
}

fn check_status_line(line: &str) -> Result<(), ProtocolError> {
    let mut parts = line.split_ascii_whitespace();
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();

    if version.starts_with("HTTP/1.") && code == "200" {
        Ok(())
    } else {
        Err(ProtocolError::BadStatus(line.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn new_validator() -> ResponseValidator {
        ResponseValidator::new(&OtaConfig::default())
    }

    fn feed(validator: &mut ResponseValidator, lines: &[&str]) -> Result<(), ProtocolError> {
        lines
            .iter()
            .try_for_each(|line| validator.on_header_line(line))
    }

    #[test]
    fn accepts_complete_response() {
        let mut validator = new_validator();

        feed(
            &mut validator,
            &[
                "HTTP/1.1 200 OK",
                "Server: nginx",
                "Content-Type: application/octet-stream",
                "Content-Length: 2000",
            ],
        )
        .unwrap();

        assert_eq!(validator.finish(), Ok(2000));
    }

    #[test]
    fn non_200_status_is_rejected() {
        let mut validator = new_validator();

        assert_eq!(
            validator.on_header_line("HTTP/1.1 404 Not Found"),
            Err(ProtocolError::BadStatus("HTTP/1.1 404 Not Found".to_string()))
        );
        assert_eq!(
            new_validator().on_header_line("ICY 200 OK"),
            Err(ProtocolError::BadStatus("ICY 200 OK".to_string()))
        );
    }

    #[test]
    fn content_length_must_be_in_bounds() {
        let mut validator = new_validator();
        validator.on_header_line("HTTP/1.1 200 OK").unwrap();

        assert_eq!(
            validator.on_header_line("Content-Length: 100"),
            Err(ProtocolError::ContentLengthOutOfRange {
                length: 100,
                min: 1024,
                max: 8 * 1024 * 1024
            })
        );
        assert_eq!(
            validator.on_header_line("Content-Length: 9000000"),
            Err(ProtocolError::ContentLengthOutOfRange {
                length: 9_000_000,
                min: 1024,
                max: 8 * 1024 * 1024
            })
        );
        assert_eq!(
            validator.on_header_line("Content-Length: lots"),
            Err(ProtocolError::InvalidContentLength("lots".to_string()))
        );
    }

    #[test]
    fn first_content_length_wins() {
        let mut validator = new_validator();

        feed(
            &mut validator,
            &[
                "HTTP/1.1 200 OK",
                "Content-Length: 2048",
                "content-length: 4096",
                "Content-Type: application/octet-stream",
            ],
        )
        .unwrap();

        assert_eq!(validator.content_length(), Some(2048));
        assert_eq!(validator.finish(), Ok(2048));
    }

    #[test]
    fn content_type_must_match_exactly() {
        let mut validator = new_validator();
        validator.on_header_line("HTTP/1.1 200 OK").unwrap();

        assert_eq!(
            validator.on_header_line("Content-Type: text/html"),
            Err(ProtocolError::InvalidContentType("text/html".to_string()))
        );
        assert!(!validator.content_type_accepted());
    }

    #[test]
    fn missing_headers_fail_at_end() {
        let mut validator = new_validator();
        feed(
            &mut validator,
            &["HTTP/1.1 200 OK", "Content-Type: application/octet-stream"],
        )
        .unwrap();
        assert_eq!(
            validator.finish(),
            Err(ProtocolError::MissingHeader("Content-Length"))
        );

        let mut validator = new_validator();
        feed(&mut validator, &["HTTP/1.1 200 OK", "Content-Length: 2000"]).unwrap();
        assert_eq!(
            validator.finish(),
            Err(ProtocolError::MissingHeader("Content-Type"))
        );

        assert_eq!(
            new_validator().finish(),
            Err(ProtocolError::MissingStatusLine)
        );
    }
}
