//! HTTP/1.x body normalization.
//!
//! Server items that parse as HTTP responses with a `gzip`, `br` or
//! `deflate` content encoding are rewritten with a decompressed body so that
//! search and flag scanning see plaintext. Decompression output is capped at
//! the flow ceiling. Anything that does not parse is left as captured.
//!
//! The pass also recognises a few upgrade protocols and tags the flow with
//! them: WebSocket handshakes, the cleartext HTTP/2 preface and gRPC content.

use crate::flow::{Direction, FlowEntry, DEFAULT_MAX_FLOW_SIZE};
use brotli::Decompressor;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use std::borrow::Cow;
use std::fmt;
use std::io::{self, Read};

pub const WEBSOCKET_TAG: &str = "WEBSOCKET";
pub const HTTP2_TAG: &str = "HTTP2";
pub const GRPC_TAG: &str = "GRPC";

pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Brotli,
    Deflate,
}

impl ContentEncoding {
    /// Recognised encodings only; `identity` and unknown values are `None`.
    pub fn from_header(value: &[u8]) -> Option<Self> {
        let value = std::str::from_utf8(value).ok()?.trim();
        if value.eq_ignore_ascii_case("gzip") || value.eq_ignore_ascii_case("x-gzip") {
            Some(ContentEncoding::Gzip)
        } else if value.eq_ignore_ascii_case("br") {
            Some(ContentEncoding::Brotli)
        } else if value.eq_ignore_ascii_case("deflate") {
            Some(ContentEncoding::Deflate)
        } else {
            None
        }
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentEncoding::Gzip => write!(f, "gzip"),
            ContentEncoding::Brotli => write!(f, "br"),
            ContentEncoding::Deflate => write!(f, "deflate"),
        }
    }
}

#[derive(Debug)]
pub enum NormalizeError {
    /// Chunked transfer framing could not be decoded.
    Chunked(String),
    Decompress {
        encoding: ContentEncoding,
        source: io::Error,
    },
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizeError::Chunked(msg) => write!(f, "bad chunked body: {}", msg),
            NormalizeError::Decompress { encoding, source } => {
                write!(f, "{} body failed to decompress: {}", encoding, source)
            }
        }
    }
}

impl std::error::Error for NormalizeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NormalizeError::Decompress { source, .. } => Some(source),
            NormalizeError::Chunked(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpNormalizer {
    limit: usize,
}

impl Default for HttpNormalizer {
    fn default() -> Self {
        HttpNormalizer::new(DEFAULT_MAX_FLOW_SIZE)
    }
}

impl HttpNormalizer {
    /// `limit` bounds both decompression output and the flow's total size
    /// after rewriting.
    pub fn new(limit: usize) -> Self {
        HttpNormalizer { limit }
    }

    /// Normalize every item of `entry` in place and add protocol tags.
    /// Returns the number of items rewritten.
    pub fn normalize(&self, entry: &mut FlowEntry) -> usize {
        let mut rewritten = 0;
        let mut upgraded = false;
        let mut tags: Vec<&'static str> = Vec::new();

        for idx in 0..entry.items.len() {
            let item = &entry.items[idx];
            if contains_ignore_case(&item.payload, b"application/grpc") {
                tags.push(GRPC_TAG);
            }
            if item.payload.starts_with(HTTP2_PREFACE) {
                tags.push(HTTP2_TAG);
                upgraded = true;
            }
            if upgraded {
                continue;
            }

            match item.from {
                Direction::Client => {
                    if is_websocket_request(&item.payload) {
                        tags.push(WEBSOCKET_TAG);
                        upgraded = true;
                    }
                }
                Direction::Server => {
                    if is_websocket_response(&item.payload) {
                        tags.push(WEBSOCKET_TAG);
                        upgraded = true;
                        continue;
                    }
                    let replacement = match self.normalize_responses(&item.payload) {
                        Ok(Some(bytes)) => bytes,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::debug!(flow_time = entry.time, item = idx, error = %e, "HTTP normalization skipped");
                            continue;
                        }
                    };
                    let new_size = entry.total_size - item.payload.len().min(entry.total_size)
                        + replacement.len();
                    if new_size <= self.limit {
                        entry.items[idx].payload = replacement;
                        entry.total_size = new_size;
                        rewritten += 1;
                    } else {
                        tracing::debug!(
                            item = idx,
                            size = new_size,
                            limit = self.limit,
                            "decoded response exceeds flow ceiling, keeping original"
                        );
                    }
                }
            }
        }

        for tag in tags {
            entry.add_tag(tag);
        }
        rewritten
    }

    /// Rewrite the responses in one server item. `Ok(None)` means there was
    /// nothing to change: the bytes are not HTTP or carry no recognised
    /// encoding. Bytes after the last parseable response are kept verbatim.
    pub fn normalize_responses(&self, data: &[u8]) -> Result<Option<Vec<u8>>, NormalizeError> {
        let mut out = Vec::with_capacity(data.len());
        let mut rest = data;
        let mut changed = false;

        while !rest.is_empty() {
            let Some(head) = ResponseHead::parse(rest) else {
                break;
            };
            let (message, consumed) = self.normalize_one(&head, rest)?;
            if let Cow::Owned(_) = message {
                changed = true;
            }
            out.extend_from_slice(&message);
            rest = &rest[consumed..];
            if consumed == 0 {
                break;
            }
        }

        if !changed {
            return Ok(None);
        }
        out.extend_from_slice(rest);
        Ok(Some(out))
    }

    fn normalize_one<'a>(
        &self,
        head: &ResponseHead,
        data: &'a [u8],
    ) -> Result<(Cow<'a, [u8]>, usize), NormalizeError> {
        let rest = &data[head.header_len..];
        let chunked = head
            .header("transfer-encoding")
            .is_some_and(|v| contains_ignore_case(v, b"chunked"));

        let (body, body_len): (Cow<'a, [u8]>, usize) = if head.has_no_body() {
            (Cow::Borrowed(&rest[..0]), 0)
        } else if chunked {
            let (body, used) = dechunk(rest)?;
            (Cow::Owned(body), used)
        } else if let Some(len) = head.content_length() {
            let len = len.min(rest.len());
            (Cow::Borrowed(&rest[..len]), len)
        } else {
            (Cow::Borrowed(rest), rest.len())
        };
        let consumed = head.header_len + body_len;

        let Some(encoding) = head.header("content-encoding").and_then(ContentEncoding::from_header)
        else {
            return Ok((Cow::Borrowed(&data[..consumed]), consumed));
        };

        let decoded = decompress(encoding, &body, self.limit)?;
        Ok((Cow::Owned(head.serialize(&decoded)), consumed))
    }
}

/// Status line and headers of one response, owned so the body can be
/// borrowed independently.
#[derive(Debug)]
struct ResponseHead {
    version: u8,
    code: u16,
    reason: String,
    headers: Vec<(String, Vec<u8>)>,
    header_len: usize,
}

impl ResponseHead {
    fn parse(data: &[u8]) -> Option<Self> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        let header_len = match resp.parse(data) {
            Ok(httparse::Status::Complete(n)) => n,
            _ => return None,
        };
        Some(ResponseHead {
            version: resp.version.unwrap_or(1),
            code: resp.code?,
            reason: resp.reason.unwrap_or_default().to_string(),
            headers: resp
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
            header_len,
        })
    }

    fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    fn content_length(&self) -> Option<usize> {
        std::str::from_utf8(self.header("content-length")?)
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    fn has_no_body(&self) -> bool {
        (100..200).contains(&self.code) || self.code == 204 || self.code == 304
    }

    /// Re-emit with the decoded `body`, without length, transfer or content
    /// coding headers.
    fn serialize(&self, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len + body.len());
        out.extend_from_slice(format!("HTTP/1.{} {} {}\r\n", self.version, self.code, self.reason).as_bytes());
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
                || name.eq_ignore_ascii_case("content-encoding")
            {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body);
        out
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Decode a chunked body. Returns the payload and the number of framed
/// bytes consumed. A body cut short by the capture yields what arrived.
fn dechunk(data: &[u8]) -> Result<(Vec<u8>, usize), NormalizeError> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let Some(line_len) = find_crlf(&data[pos..]) else {
            return Ok((out, data.len()));
        };
        let line = &data[pos..pos + line_len];
        let size_field = line.split(|b| *b == b';').next().unwrap_or_default();
        let size = std::str::from_utf8(size_field)
            .ok()
            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
            .ok_or_else(|| {
                NormalizeError::Chunked(format!("invalid chunk size {:?}", String::from_utf8_lossy(line)))
            })?;
        pos += line_len + 2;

        if size == 0 {
            // Skip trailers up to the terminating empty line.
            while let Some(n) = find_crlf(&data[pos..]) {
                pos += n + 2;
                if n == 0 {
                    return Ok((out, pos));
                }
            }
            return Ok((out, data.len()));
        }

        let end = pos.saturating_add(size).min(data.len());
        out.extend_from_slice(&data[pos..end]);
        pos = end;
        if pos == data.len() {
            return Ok((out, pos));
        }
        if !data[pos..].starts_with(b"\r\n") {
            return Err(NormalizeError::Chunked("missing CRLF after chunk".into()));
        }
        pos += 2;
    }
}

/// Zlib header check: CM = 8 and the header checksum holds.
fn is_zlib(data: &[u8]) -> bool {
    match data {
        [cmf, flg, ..] => cmf & 0x0f == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}

/// Decompress `body`, producing at most `limit` bytes.
pub fn decompress(encoding: ContentEncoding, body: &[u8], limit: usize) -> Result<Vec<u8>, NormalizeError> {
    let reader: Box<dyn Read + '_> = match encoding {
        ContentEncoding::Gzip => Box::new(MultiGzDecoder::new(body)),
        ContentEncoding::Brotli => Box::new(Decompressor::new(body, 4096)),
        // Servers send both zlib-wrapped and raw DEFLATE under this name.
        ContentEncoding::Deflate if is_zlib(body) => Box::new(ZlibDecoder::new(body)),
        ContentEncoding::Deflate => Box::new(DeflateDecoder::new(body)),
    };
    let mut out = Vec::new();
    reader
        .take(limit as u64)
        .read_to_end(&mut out)
        .map_err(|source| NormalizeError::Decompress { encoding, source })?;
    Ok(out)
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

fn upgrades_to_websocket(headers: &[httparse::Header<'_>]) -> bool {
    let value = |name: &str| {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value)
    };
    value("upgrade").is_some_and(|v| String::from_utf8_lossy(v).trim().eq_ignore_ascii_case("websocket"))
        && value("connection").is_some_and(|v| contains_ignore_case(v, b"upgrade"))
}

fn is_websocket_request(data: &[u8]) -> bool {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    matches!(req.parse(data), Ok(httparse::Status::Complete(_))) && upgrades_to_websocket(req.headers)
}

fn is_websocket_response(data: &[u8]) -> bool {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    matches!(resp.parse(data), Ok(httparse::Status::Complete(_)))
        && resp.code == Some(101)
        && upgrades_to_websocket(resp.headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Endpoint, FlowItem, FlowProtocol, FrameLog};
    use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::collections::BTreeSet;
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr};

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn br_compress(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut enc = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            enc.write_all(data).unwrap();
        }
        out
    }

    fn response(encoding: &str, body: &[u8]) -> Vec<u8> {
        let mut r = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Encoding: {}\r\nContent-Length: {}\r\n\r\n",
            encoding,
            body.len()
        )
        .into_bytes();
        r.extend_from_slice(body);
        r
    }

    fn entry(items: Vec<FlowItem>) -> FlowEntry {
        let ep = |port| Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let total_size = items.iter().map(|i| i.payload.len()).sum();
        FlowEntry {
            protocol: FlowProtocol::Tcp,
            src: ep(40000),
            dst: ep(80),
            time: 0,
            duration: 0,
            packet_count: 2,
            blocked: false,
            items,
            tags: BTreeSet::new(),
            total_size,
            source_file: String::new(),
            frames: FrameLog::default(),
        }
    }

    fn body_of(data: &[u8]) -> &[u8] {
        let at = data.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        &data[at + 4..]
    }

    #[test]
    fn gzip_body_is_decoded() {
        let raw = response("gzip", &gzip(b"hello FLAG{zip}"));
        let out = HttpNormalizer::default().normalize_responses(&raw).unwrap().unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        let lower = text.to_ascii_lowercase();
        assert!(!lower.contains("content-length"));
        assert!(!lower.contains("content-encoding"));
        assert!(lower.contains("content-type: text/plain"));
        assert_eq!(body_of(&out), b"hello FLAG{zip}");
    }

    #[test]
    fn brotli_body_is_decoded() {
        let raw = response("br", &br_compress(b"brotli body"));
        let out = HttpNormalizer::default().normalize_responses(&raw).unwrap().unwrap();
        assert_eq!(body_of(&out), b"brotli body");
    }

    #[test]
    fn deflate_accepts_zlib_and_raw() {
        let mut z = ZlibEncoder::new(Vec::new(), Compression::default());
        z.write_all(b"zlib wrapped").unwrap();
        let zlib = z.finish().unwrap();
        let mut d = DeflateEncoder::new(Vec::new(), Compression::default());
        d.write_all(b"raw deflate").unwrap();
        let raw = d.finish().unwrap();

        let n = HttpNormalizer::default();
        let out = n.normalize_responses(&response("deflate", &zlib)).unwrap().unwrap();
        assert_eq!(body_of(&out), b"zlib wrapped");
        let out = n.normalize_responses(&response("deflate", &raw)).unwrap().unwrap();
        assert_eq!(body_of(&out), b"raw deflate");
    }

    #[test]
    fn chunked_body_is_dechunked_then_decoded() {
        let compressed = gzip(b"chunked and zipped");
        let (a, b) = compressed.split_at(compressed.len() / 2);
        let mut raw = b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        raw.extend_from_slice(format!("{:x}\r\n", a.len()).as_bytes());
        raw.extend_from_slice(a);
        raw.extend_from_slice(format!("\r\n{:x};ext=1\r\n", b.len()).as_bytes());
        raw.extend_from_slice(b);
        raw.extend_from_slice(b"\r\n0\r\n\r\n");

        let out = HttpNormalizer::default().normalize_responses(&raw).unwrap().unwrap();
        let text = String::from_utf8_lossy(&out).to_ascii_lowercase();
        assert!(!text.contains("transfer-encoding"));
        assert!(!text.contains("content-encoding"));
        assert_eq!(body_of(&out), b"chunked and zipped");
    }

    #[test]
    fn pipelined_responses_and_trailing_bytes() {
        let mut raw = response("gzip", &gzip(b"first"));
        raw.extend_from_slice(b"HTTP/1.1 204 No Content\r\n\r\n");
        raw.extend_from_slice(&response("gzip", &gzip(b"second")));
        raw.extend_from_slice(b"\x00garbage");

        let out = HttpNormalizer::default().normalize_responses(&raw).unwrap().unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("\r\n\r\nfirstHTTP/1.1 204 No Content\r\n\r\nHTTP/1.1 200 OK"));
        assert!(text.ends_with("second\u{0}garbage"));
    }

    #[test]
    fn plain_and_unknown_encodings_are_untouched() {
        let n = HttpNormalizer::default();
        let plain = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec();
        assert!(n.normalize_responses(&plain).unwrap().is_none());
        assert!(n.normalize_responses(&response("zstd", b"??")).unwrap().is_none());
        assert!(n.normalize_responses(b"SSH-2.0-OpenSSH_9.6\r\n").unwrap().is_none());
    }

    #[test]
    fn corrupt_body_is_an_error() {
        let raw = response("gzip", b"definitely not gzip");
        assert!(matches!(
            HttpNormalizer::default().normalize_responses(&raw),
            Err(NormalizeError::Decompress { encoding: ContentEncoding::Gzip, .. })
        ));
    }

    #[test]
    fn decompression_is_capped() {
        let bomb = gzip(&vec![0u8; 1 << 20]);
        assert!(bomb.len() < 4096);
        let out = decompress(ContentEncoding::Gzip, &bomb, 1024).unwrap();
        assert_eq!(out.len(), 1024);
    }

    #[test]
    fn rewrite_respects_flow_ceiling() {
        let compressed = response("gzip", &gzip(&vec![b'a'; 10_000]));
        let mut e = entry(vec![
            FlowItem::new(Direction::Client, b"GET / HTTP/1.1\r\n\r\n".to_vec(), 1),
            FlowItem::new(Direction::Server, compressed.clone(), 2),
        ]);
        assert_eq!(HttpNormalizer::new(5_000).normalize(&mut e), 0);
        assert_eq!(e.items[1].payload, compressed);

        assert_eq!(HttpNormalizer::default().normalize(&mut e), 1);
        assert!(e.items[1].payload.len() > 10_000);
        let expected: usize = e.items.iter().map(|i| i.payload.len()).sum();
        assert_eq!(e.total_size, expected);
    }

    #[test]
    fn failed_item_leaves_rest_of_flow_alone() {
        let good = response("gzip", &gzip(b"good"));
        let bad = response("gzip", b"broken");
        let mut e = entry(vec![
            FlowItem::new(Direction::Server, bad.clone(), 1),
            FlowItem::new(Direction::Client, b"GET /next HTTP/1.1\r\n\r\n".to_vec(), 2),
            FlowItem::new(Direction::Server, good, 3),
        ]);
        assert_eq!(HttpNormalizer::default().normalize(&mut e), 1);
        assert_eq!(e.items[0].payload, bad);
        assert_eq!(body_of(&e.items[2].payload), b"good");
    }

    #[test]
    fn websocket_upgrade_is_tagged() {
        let mut e = entry(vec![
            FlowItem::new(
                Direction::Client,
                b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\n\r\n".to_vec(),
                1,
            ),
            FlowItem::new(
                Direction::Server,
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n".to_vec(),
                2,
            ),
        ]);
        HttpNormalizer::default().normalize(&mut e);
        assert!(e.tags.contains(WEBSOCKET_TAG));
        assert_eq!(e.tags.len(), 1);
    }

    #[test]
    fn http2_and_grpc_are_tagged() {
        let mut preface = HTTP2_PREFACE.to_vec();
        preface.extend_from_slice(b"\x00\x00\x00\x04\x00\x00\x00\x00\x00");
        let mut e = entry(vec![
            FlowItem::new(Direction::Client, preface, 1),
            FlowItem::new(Direction::Server, b"..content-type\x00Application/GRPC..".to_vec(), 2),
        ]);
        HttpNormalizer::default().normalize(&mut e);
        assert!(e.tags.contains(HTTP2_TAG));
        assert!(e.tags.contains(GRPC_TAG));
    }
}
