//! The cached `header` file: an HTTP/1.x status line and header fields, no body.
//!
//! ```text
//! HTTP/1.1 200 OK\r\n
//! Content-Type: text/csv\r\n
//! Date: Mon, 02 Jan 2006 15:04:05 GMT\r\n
//! \r\n
//! ```

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Response, StatusCode, Version};

/// Status line and headers of a response, without its body.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Captures the head of a live response.
    #[must_use]
    pub fn from_response(resp: &Response) -> Self {
        Self {
            status: resp.status(),
            version: resp.version(),
            headers: resp.headers().clone(),
        }
    }

    /// Serializes the head into the header file format.
    #[must_use]
    pub fn dump(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(version_str(self.version).as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.as_str().as_bytes());
        if let Some(reason) = self.status.canonical_reason() {
            out.push(b' ');
            out.extend_from_slice(reason.as_bytes());
        }
        out.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            out.extend_from_slice(canonical_name(name).as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Parses a header file. Bare `\n` line endings are accepted.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed line.
    pub fn parse(raw: &[u8]) -> Result<Self, String> {
        let mut lines = raw
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line));

        let status_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| "missing status line".to_string())?;
        let status_line = std::str::from_utf8(status_line)
            .map_err(|_| "status line is not valid UTF-8".to_string())?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts
            .next()
            .and_then(parse_version)
            .ok_or_else(|| format!("malformed status line: {status_line:?}"))?;
        let status = parts
            .next()
            .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
            .ok_or_else(|| format!("malformed status code: {status_line:?}"))?;

        let mut headers = HeaderMap::new();
        let mut terminated = false;
        for line in lines {
            if line.is_empty() {
                terminated = true;
                break;
            }
            let colon = line
                .iter()
                .position(|b| *b == b':')
                .ok_or_else(|| format!("header line without colon: {:?}", lossy(line)))?;
            let name = HeaderName::from_bytes(line[..colon].trim_ascii())
                .map_err(|_| format!("invalid header name: {:?}", lossy(&line[..colon])))?;
            let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
                .map_err(|_| format!("invalid value for header {name}"))?;
            headers.append(name, value);
        }
        if !terminated {
            return Err("header block is not terminated by an empty line".to_string());
        }

        Ok(Self {
            status,
            version,
            headers,
        })
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn parse_version(s: &str) -> Option<Version> {
    match s {
        "HTTP/0.9" => Some(Version::HTTP_09),
        "HTTP/1.0" => Some(Version::HTTP_10),
        "HTTP/1.1" => Some(Version::HTTP_11),
        "HTTP/2" | "HTTP/2.0" => Some(Version::HTTP_2),
        "HTTP/3" | "HTTP/3.0" => Some(Version::HTTP_3),
        _ => None,
    }
}

/// `content-type` -> `Content-Type`, `etag` -> `Etag`.
fn canonical_name(name: &HeaderName) -> String {
    let mut out = String::with_capacity(name.as_str().len());
    let mut upper = true;
    for c in name.as_str().chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}
