//! Transport collaborator
//!
//! `Transport::perform_request` runs on a background thread. It gets a
//! [`CancelContext`] it should poll; cancellation is advisory here, the
//! script side decides the promise's fate.
//!
//! [`HttpTransport`] is a minimal HTTP/1.1 client over `TcpStream`: one
//! request per connection (`connection: close`), bodies framed by
//! `Content-Length`, `Transfer-Encoding: chunked` or connection close.

use crate::config::NetConfig;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;
use url::Url;

/// Cross-thread cancellation flag handed to the transport
#[derive(Debug, Clone, Default)]
pub struct CancelContext {
    flag: Arc<AtomicBool>,
}

impl CancelContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Request as seen by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// Raw response produced by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// URL that produced this response (after redirects)
    pub url: Url,
    pub redirected: bool,
}

impl TransportResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Transport failures; `Send` so they can cross back to the script thread
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request cancelled")]
    Cancelled,

    #[error("unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("connection to {host} failed: {message}")]
    Connect { host: String, message: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("no response within {0} ms")]
    ReadTimeout(u64),

    #[error("too many redirects (limit {0})")]
    TooManyRedirects(u32),

    /// Redirect returned while the redirect mode is `error`
    #[error("redirect to {0} refused")]
    RedirectRefused(String),

    #[error("transport panicked: {0}")]
    Panicked(String),
}

/// Performs one request/response exchange
pub trait Transport: Send + Sync {
    fn perform_request(
        &self,
        request: &TransportRequest,
        cancel: &CancelContext,
    ) -> Result<TransportResponse, TransportError>;
}

/// Minimal HTTP/1.1 client
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    config: NetConfig,
}

impl HttpTransport {
    pub fn new(config: NetConfig) -> Self {
        Self { config }
    }

    fn connect(&self, url: &Url) -> Result<TcpStream, TransportError> {
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::Protocol(format!("URL has no host: {}", url)))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let connect_err = |message: String| TransportError::Connect {
            host: host.to_string(),
            message,
        };
        let addrs: Vec<_> = (host, port)
            .to_socket_addrs()
            .map_err(|e| connect_err(format!("DNS resolution failed: {}", e)))?
            .collect();
        let timeout = Duration::from_millis(self.config.connect_timeout_ms.max(1));
        let mut last_error = format!("no addresses found for {}", host);
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(connect_err(last_error))
    }

    fn encode_request(&self, request: &TransportRequest) -> Vec<u8> {
        let url = &request.url;
        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };

        let mut head = format!("{} {} HTTP/1.1\r\nhost: {}\r\n", request.method, target, host);
        let has = |name: &str| request.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name));
        if !has("user-agent") {
            head.push_str(&format!("user-agent: {}\r\n", self.config.user_agent));
        }
        if !has("accept") {
            head.push_str("accept: */*\r\n");
        }
        for (name, value) in &request.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if let Some(body) = &request.body {
            head.push_str(&format!("content-length: {}\r\n", body.len()));
        }
        head.push_str("connection: close\r\n\r\n");

        let mut bytes = head.into_bytes();
        if let Some(body) = &request.body {
            bytes.extend_from_slice(body);
        }
        bytes
    }
}

impl Transport for HttpTransport {
    fn perform_request(
        &self,
        request: &TransportRequest,
        cancel: &CancelContext,
    ) -> Result<TransportResponse, TransportError> {
        if request.url.scheme() != "http" {
            return Err(TransportError::UnsupportedScheme(request.url.scheme().to_string()));
        }
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        trace!(method = %request.method, url = %request.url, "http request");

        let mut stream = self.connect(&request.url)?;
        stream
            .set_read_timeout(Some(Duration::from_millis(self.config.read_poll_ms.max(1))))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        stream
            .write_all(&self.encode_request(request))
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let mut reader = PollingReader {
            stream,
            cancel,
            deadline: Instant::now() + Duration::from_millis(self.config.read_timeout_ms),
            timeout_ms: self.config.read_timeout_ms,
            buf: Vec::new(),
            eof: false,
        };

        let head_end = loop {
            if let Some(pos) = find_subsequence(&reader.buf, b"\r\n\r\n") {
                break pos + 4;
            }
            if reader.fill()? == 0 {
                return Err(TransportError::Protocol("connection closed before headers".to_string()));
            }
        };
        let head = parse_head(&reader.buf[..head_end])?;

        let no_body = request.method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&head.status)
            || head.status == 204
            || head.status == 304;
        let chunked = head
            .header("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
        let content_length = head
            .header("content-length")
            .map(|v| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| TransportError::Protocol(format!("bad content-length '{}'", v)))
            })
            .transpose()?;

        let body = if no_body {
            Vec::new()
        } else if chunked {
            loop {
                if let Some(body) = decode_chunked(&reader.buf[head_end..])? {
                    break body;
                }
                if reader.fill()? == 0 {
                    return Err(TransportError::Protocol("truncated chunked body".to_string()));
                }
            }
        } else if let Some(length) = content_length {
            let end = head_end
                .checked_add(length)
                .ok_or_else(|| TransportError::Protocol(format!("content-length {} too large", length)))?;
            while reader.buf.len() < end {
                if reader.fill()? == 0 {
                    return Err(TransportError::Protocol("truncated body".to_string()));
                }
            }
            reader.buf[head_end..end].to_vec()
        } else {
            while reader.fill()? > 0 {}
            reader.buf[head_end..].to_vec()
        };

        Ok(TransportResponse {
            status: head.status,
            status_text: head.status_text,
            headers: head.headers,
            body,
            url: request.url.clone(),
            redirected: false,
        })
    }
}

/// Reads from a socket in short slices so cancellation is noticed promptly
struct PollingReader<'a> {
    stream: TcpStream,
    cancel: &'a CancelContext,
    deadline: Instant,
    timeout_ms: u64,
    buf: Vec<u8>,
    eof: bool,
}

impl PollingReader<'_> {
    /// Read more bytes into the buffer; 0 means end of stream
    fn fill(&mut self) -> Result<usize, TransportError> {
        if self.eof {
            return Ok(0);
        }
        let mut chunk = [0u8; 8192];
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            if Instant::now() >= self.deadline {
                return Err(TransportError::ReadTimeout(self.timeout_ms));
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(0);
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut | IoErrorKind::Interrupted) => {
                    continue
                }
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }
}

struct ResponseHead {
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_head(bytes: &[u8]) -> Result<ResponseHead, TransportError> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| TransportError::Protocol("empty response".to_string()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(TransportError::Protocol(format!("invalid status line '{}'", status_line)));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| TransportError::Protocol(format!("invalid status line '{}'", status_line)))?;
    let status_text = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    for line in lines.take_while(|line| !line.is_empty()) {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    Ok(ResponseHead {
        status,
        status_text,
        headers,
    })
}

/// Decode a chunked body; `Ok(None)` while more bytes are needed
fn decode_chunked(mut data: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
    let mut body = Vec::new();
    loop {
        let Some(line_end) = find_subsequence(data, b"\r\n") else {
            return Ok(None);
        };
        let size_line = String::from_utf8_lossy(&data[..line_end]);
        let size_text = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| TransportError::Protocol(format!("bad chunk size '{}'", size_text)))?;
        data = &data[line_end + 2..];
        if size == 0 {
            return Ok(Some(body));
        }
        let end = size
            .checked_add(2)
            .ok_or_else(|| TransportError::Protocol(format!("chunk size {} too large", size_text)))?;
        if data.len() < end {
            return Ok(None);
        }
        body.extend_from_slice(&data[..size]);
        data = &data[end..];
    }
}
