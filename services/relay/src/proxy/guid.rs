//! Device GUID extraction from the first request line.
//!
//! This module reads the initial bytes of a client connection and scans
//! them for the device GUID that selects the backend:
//! - HTTP audit requests carry it in the path (`.../audit/<guid>?...`)
//! - WebSocket upgrades carry it in the query string (`...host=<guid>&...`)
//!
//! Only the first line is consulted. Headers and body are ignored even
//! when they contain a well-formed GUID, because request tokens and
//! correlation IDs elsewhere in the request routinely look GUID-shaped
//! and must never route the connection.
//!
//! Every byte read here is retained in the caller's buffer; the routing
//! decision consumes the request line, but the backend still receives it.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use fleet_guid::DeviceGuid;

/// Default deadline for the first request line to arrive.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_millis(500);

/// Default maximum bytes to read while waiting for a line terminator.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

/// Result of sniffing a connection for a device GUID.
#[derive(Debug, Clone)]
pub enum SniffResult {
    /// A GUID was found on the first request line.
    Found(DeviceGuid),
    /// The request line arrived but carried no GUID.
    NoGuid,
    /// Deadline passed before a line terminator; extraction ran on the
    /// partial data that did arrive.
    Timeout(Option<DeviceGuid>),
    /// I/O error while reading the request line.
    IoError(String),
}

/// Configuration for request line sniffing.
#[derive(Debug, Clone)]
pub struct SniffConfig {
    /// Maximum time to wait for the request line.
    pub timeout: Duration,
    /// Maximum bytes to read.
    pub max_bytes: usize,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// Sniffer that reads a connection's opening bytes and extracts the GUID.
pub struct GuidSniffer {
    config: SniffConfig,
}

impl GuidSniffer {
    /// Create a new sniffer with default configuration.
    pub fn new() -> Self {
        Self {
            config: SniffConfig::default(),
        }
    }

    /// Create a new sniffer with custom configuration.
    pub fn with_config(config: SniffConfig) -> Self {
        Self { config }
    }

    /// Sniff a stream for a device GUID, reading into the provided buffer.
    ///
    /// Returns the sniff result and the number of bytes read into the
    /// buffer. The caller must replay these buffered bytes to the backend;
    /// they are never dropped, even when the deadline fires mid-line.
    pub async fn sniff<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> (SniffResult, usize) {
        buffer.clear();
        buffer.resize(self.config.max_bytes, 0);

        // `filled` lives outside the read future so progress survives the
        // deadline cancelling it.
        let mut filled = 0;
        let read_result = timeout(
            self.config.timeout,
            read_request_line(stream, buffer, &mut filled),
        )
        .await;

        buffer.truncate(filled);

        match read_result {
            Ok(Ok(())) => match parse_guid(&String::from_utf8_lossy(buffer)) {
                Some(guid) => (SniffResult::Found(guid), filled),
                None => (SniffResult::NoGuid, filled),
            },
            Ok(Err(e)) => (SniffResult::IoError(e.to_string()), filled),
            Err(_) => {
                let guid = parse_guid(&String::from_utf8_lossy(buffer));
                (SniffResult::Timeout(guid), filled)
            }
        }
    }
}

impl Default for GuidSniffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Read until the buffer holds a line terminator, fills up, or the stream
/// reaches EOF.
async fn read_request_line<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut [u8],
    filled: &mut usize,
) -> io::Result<()> {
    while *filled < buffer.len() {
        let n = stream.read(&mut buffer[*filled..]).await?;
        if n == 0 {
            break;
        }
        *filled += n;

        if buffer[..*filled]
            .iter()
            .any(|&b| b == b'\r' || b == b'\n')
        {
            break;
        }
    }

    Ok(())
}

/// Extract the device GUID from request text.
///
/// Scans only the first line (up to the first CR or LF) for the first
/// substring shaped like a canonical 8-4-4-4-12 GUID and returns it
/// verbatim. Returns `None` for empty input, a line with no candidate, or
/// candidates with the wrong group count or lengths.
pub fn parse_guid(request_text: &str) -> Option<DeviceGuid> {
    let first_line = request_text.split(['\r', '\n']).next().unwrap_or("");
    DeviceGuid::extract(first_line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const AUDIT_GUID: &str = "63f32fee-238e-4f6a-a091-092270d22439";
    const RELAY_GUID: &str = "d12428be-9fa1-4226-9784-54b2038beab6";

    #[test]
    fn test_parse_guid_empty() {
        assert!(parse_guid("").is_none());
    }

    #[test]
    fn test_parse_guid_numeric_path() {
        let line = "GET /api/v1/amt/log/audit/12345?startIndex=0 HTTP/1.1";
        assert!(parse_guid(line).is_none());
    }

    #[test]
    fn test_parse_guid_audit_path() {
        let line = format!("GET /api/v1/amt/log/audit/{AUDIT_GUID}?startIndex=0 HTTP/1.1");
        assert_eq!(parse_guid(&line).unwrap().as_str(), AUDIT_GUID);
    }

    #[test]
    fn test_parse_guid_websocket_query() {
        let line = format!(
            "GET /relay/webrelay.ashx?p=2&host={RELAY_GUID}&port=16994&tls=0 HTTP/1.1"
        );
        assert_eq!(parse_guid(&line).unwrap().as_str(), RELAY_GUID);
    }

    #[test]
    fn test_parse_guid_four_groups_rejected() {
        let line = "GET /relay/webrelay.ashx?p=2&host=d12428be-9fa1-4226-9784&port=16994 HTTP/1.1";
        assert!(parse_guid(line).is_none());
    }

    #[test]
    fn test_parse_guid_first_line_only() {
        let request = format!("GET /api/v1/devices HTTP/1.1\r\nX-Request-Id: {AUDIT_GUID}\r\n\r\n");
        assert!(parse_guid(&request).is_none());
    }

    #[test]
    fn test_parse_guid_later_line_crlf_and_lf() {
        let crlf = format!("GET / HTTP/1.1\r\nHost: {AUDIT_GUID}\r\n");
        let lf = format!("GET / HTTP/1.1\nHost: {AUDIT_GUID}\n");
        assert!(parse_guid(&crlf).is_none());
        assert!(parse_guid(&lf).is_none());
    }

    #[test]
    fn test_parse_guid_case_preserved() {
        let upper = AUDIT_GUID.to_uppercase();
        let line = format!("GET /api/v1/amt/log/audit/{upper}?startIndex=0 HTTP/1.1");
        assert_eq!(parse_guid(&line).unwrap().as_str(), upper);
    }

    #[tokio::test]
    async fn test_sniff_finds_guid() {
        let request = format!("GET /api/v1/amt/log/audit/{AUDIT_GUID}?startIndex=0 HTTP/1.1\r\n");
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(request.as_bytes()).await.unwrap();

        let sniffer = GuidSniffer::new();
        let mut buffer = Vec::new();
        let (result, bytes_read) = sniffer.sniff(&mut server, &mut buffer).await;

        match result {
            SniffResult::Found(guid) => assert_eq!(guid.as_str(), AUDIT_GUID),
            other => panic!("Expected Found, got {:?}", other),
        }
        assert_eq!(bytes_read, request.len());
        assert_eq!(buffer, request.as_bytes());
    }

    #[tokio::test]
    async fn test_sniff_retains_bytes_past_first_line() {
        let request = b"GET /api/v1/devices HTTP/1.1\r\nHost: mps.local\r\n\r\n";
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(request).await.unwrap();

        let sniffer = GuidSniffer::new();
        let mut buffer = Vec::new();
        let (result, _) = sniffer.sniff(&mut server, &mut buffer).await;

        assert!(matches!(result, SniffResult::NoGuid));
        // Everything read in one pass stays buffered for replay
        assert_eq!(buffer, request);
    }

    #[tokio::test]
    async fn test_sniff_timeout_keeps_partial_data() {
        let partial = format!("GET /api/v1/amt/log/audit/{AUDIT_GUID}?start");
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(partial.as_bytes()).await.unwrap();
        // No newline and no EOF; writer stays open

        let sniffer = GuidSniffer::with_config(SniffConfig {
            timeout: Duration::from_millis(50),
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        });
        let mut buffer = Vec::new();
        let (result, bytes_read) = sniffer.sniff(&mut server, &mut buffer).await;

        match result {
            SniffResult::Timeout(Some(guid)) => assert_eq!(guid.as_str(), AUDIT_GUID),
            other => panic!("Expected Timeout with GUID, got {:?}", other),
        }
        assert_eq!(bytes_read, partial.len());
        assert_eq!(buffer, partial.as_bytes());
    }

    #[tokio::test]
    async fn test_sniff_eof_without_newline() {
        let partial = format!("GET /relay/webrelay.ashx?host={RELAY_GUID}");
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(partial.as_bytes()).await.unwrap();
        drop(client);

        let sniffer = GuidSniffer::new();
        let mut buffer = Vec::new();
        let (result, _) = sniffer.sniff(&mut server, &mut buffer).await;

        match result {
            SniffResult::Found(guid) => assert_eq!(guid.as_str(), RELAY_GUID),
            other => panic!("Expected Found, got {:?}", other),
        }
        assert_eq!(buffer, partial.as_bytes());
    }

    #[tokio::test]
    async fn test_sniff_caps_read_size() {
        let long_line = "x".repeat(256);
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(long_line.as_bytes()).await.unwrap();
        drop(client);

        let sniffer = GuidSniffer::with_config(SniffConfig {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: 64,
        });
        let mut buffer = Vec::new();
        let (result, bytes_read) = sniffer.sniff(&mut server, &mut buffer).await;

        assert!(matches!(result, SniffResult::NoGuid));
        assert_eq!(bytes_read, 64);
        assert_eq!(buffer.len(), 64);
    }

    #[tokio::test]
    async fn test_sniff_empty_connection() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let sniffer = GuidSniffer::new();
        let mut buffer = Vec::new();
        let (result, bytes_read) = sniffer.sniff(&mut server, &mut buffer).await;

        assert!(matches!(result, SniffResult::NoGuid));
        assert_eq!(bytes_read, 0);
        assert!(buffer.is_empty());
    }
}
