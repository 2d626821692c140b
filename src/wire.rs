//! HTTP/1.1 framing for the pooled provider links
//!
//! Requests are written with an exact `content-length`; replies are read back
//! incrementally, possibly several per read and in any order relative to the
//! requests that produced them.

use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use httparse::Status;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::correlation::RequestId;
use crate::endpoint::Endpoint;
use crate::error::{AgentError, AgentResult};

/// Header carrying the correlation id, shared by router and dispatcher
pub const REQUEST_ID_HEADER: &str = "x-mesh-request-id";

const MAX_HEADERS: usize = 100;
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Request on its way to a provider
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Point the destination header at `endpoint`
    pub fn set_destination(&mut self, endpoint: &Endpoint) -> AgentResult<()> {
        let value = HeaderValue::from_str(&endpoint.authority())
            .map_err(|_| AgentError::InvalidEndpoint(endpoint.to_string()))?;
        self.headers.insert(HOST, value);
        Ok(())
    }

    pub fn stamp_request_id(&mut self, id: RequestId) {
        self.headers
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), HeaderValue::from(id));
    }

    pub fn request_id(&self) -> AgentResult<RequestId> {
        parse_request_id(&self.headers)
    }

    /// Append the HTTP/1.1 encoding of this request to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        let target = self
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");

        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(target.as_bytes());
        buf.extend_from_slice(b" HTTP/1.1\r\n");
        encode_headers(&self.headers, self.body.len(), buf);
        buf.extend_from_slice(&self.body);
    }

    /// Parse one complete request from the front of `data`.
    ///
    /// Returns the request and the number of bytes it occupied, or `None`
    /// when more data is needed. Only `content-length` bodies are accepted.
    pub fn parse(data: &[u8]) -> AgentResult<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        let head_len = match request.parse(data)? {
            Status::Complete(n) => n,
            Status::Partial => return Ok(None),
        };

        let method = Method::from_str(request.method.unwrap_or("GET"))
            .map_err(|e| AgentError::Frame(e.to_string()))?;
        let uri = Uri::from_str(request.path.unwrap_or("/"))
            .map_err(|e| AgentError::Frame(e.to_string()))?;
        let headers = collect_headers(request.headers)?;

        let body_len = content_length(&headers)?.unwrap_or(0);
        if data.len() < head_len + body_len {
            return Ok(None);
        }

        let body = Bytes::copy_from_slice(&data[head_len..head_len + body_len]);
        Ok(Some((
            Self {
                method,
                uri,
                headers,
                body,
            },
            head_len + body_len,
        )))
    }
}

/// Reply read back from a provider
#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProviderReply {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_request_id(self, id: RequestId) -> Self {
        self.with_header(HeaderName::from_static(REQUEST_ID_HEADER), HeaderValue::from(id))
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn request_id(&self) -> AgentResult<RequestId> {
        parse_request_id(&self.headers)
    }

    /// Append the HTTP/1.1 encoding of this reply to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(b"HTTP/1.1 ");
        buf.extend_from_slice(self.status.as_str().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.status.canonical_reason().unwrap_or("").as_bytes());
        buf.extend_from_slice(b"\r\n");
        encode_headers(&self.headers, self.body.len(), buf);
        buf.extend_from_slice(&self.body);
    }
}

/// Read the correlation id out of a header map
pub fn parse_request_id(headers: &HeaderMap) -> AgentResult<RequestId> {
    let value = headers
        .get(REQUEST_ID_HEADER)
        .ok_or(AgentError::MissingRequestId)?;
    let text = value.to_str().map_err(|_| {
        AgentError::MalformedRequestId(String::from_utf8_lossy(value.as_bytes()).into_owned())
    })?;
    text.trim()
        .parse::<RequestId>()
        .map_err(|_| AgentError::MalformedRequestId(text.to_string()))
}

fn encode_headers(headers: &HeaderMap, body_len: usize, buf: &mut BytesMut) {
    for (name, value) in headers {
        // Bodies are always aggregated, so framing headers are regenerated
        if *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING || *name == CONNECTION {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"content-length: ");
    buf.extend_from_slice(body_len.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n\r\n");
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> AgentResult<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for header in raw {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| AgentError::Frame(e.to_string()))?;
        let value =
            HeaderValue::from_bytes(header.value).map_err(|e| AgentError::Frame(e.to_string()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn content_length(headers: &HeaderMap) -> AgentResult<Option<usize>> {
    match headers.get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .map(Some)
            .ok_or_else(|| AgentError::Frame("invalid content-length".to_string())),
    }
}

/// 1xx, 204 and 304 replies end at their head regardless of framing headers
fn is_bodyless(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

enum BodyFraming {
    None,
    Length(usize),
    Chunked,
}

/// Incremental reply decoder for one provider link
#[derive(Debug)]
pub struct ReplyDecoder {
    buf: BytesMut,
    max_body: usize,
}

impl ReplyDecoder {
    pub fn new(max_body: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_body,
        }
    }

    /// Bytes received but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Read more bytes from `reader`; `Ok(0)` means end of stream
    pub async fn fill<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> AgentResult<usize> {
        Ok(reader.read_buf(&mut self.buf).await?)
    }

    /// Decode the next complete reply, or `None` if more bytes are needed
    pub fn decode(&mut self) -> AgentResult<Option<ProviderReply>> {
        self.decode_with(|_| true)
    }

    /// Like [`decode`](Self::decode), with `has_body` telling whether a reply
    /// with the given headers carries a body on the wire. It must return
    /// false for replies to HEAD requests, whatever their `content-length`.
    pub fn decode_with<F>(&mut self, has_body: F) -> AgentResult<Option<ProviderReply>>
    where
        F: FnOnce(&HeaderMap) -> bool,
    {
        let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut raw);

        let head_len = match response.parse(&self.buf)? {
            Status::Complete(n) => n,
            Status::Partial => {
                if self.buf.len() > MAX_HEAD_BYTES {
                    return Err(AgentError::FrameTooLarge {
                        size: self.buf.len(),
                        limit: MAX_HEAD_BYTES,
                    });
                }
                return Ok(None);
            }
        };

        let status = StatusCode::from_u16(response.code.unwrap_or(0))
            .map_err(|e| AgentError::Frame(e.to_string()))?;
        let headers = collect_headers(response.headers)?;

        let framing = if is_bodyless(status) || !has_body(&headers) {
            BodyFraming::None
        } else if is_chunked(&headers) {
            BodyFraming::Chunked
        } else {
            BodyFraming::Length(content_length(&headers)?.unwrap_or(0))
        };

        let body = match framing {
            BodyFraming::None => {
                let _ = self.buf.split_to(head_len);
                Bytes::new()
            }
            BodyFraming::Length(len) => {
                if len > self.max_body {
                    return Err(AgentError::FrameTooLarge {
                        size: len,
                        limit: self.max_body,
                    });
                }
                if self.buf.len() < head_len + len {
                    return Ok(None);
                }
                let frame = self.buf.split_to(head_len + len).freeze();
                frame.slice(head_len..)
            }
            BodyFraming::Chunked => {
                match decode_chunked(&self.buf[head_len..], self.max_body)? {
                    Some((body, consumed)) => {
                        let _ = self.buf.split_to(head_len + consumed);
                        body
                    }
                    None => return Ok(None),
                }
            }
        };

        Ok(Some(ProviderReply {
            status,
            headers,
            body,
        }))
    }
}

/// Aggregate a chunked body; returns the body and the bytes consumed
fn decode_chunked(data: &[u8], limit: usize) -> AgentResult<Option<(Bytes, usize)>> {
    let mut body = BytesMut::new();
    let mut pos = 0;

    loop {
        let (size_len, size) = match httparse::parse_chunk_size(&data[pos..]) {
            Ok(Status::Complete(parsed)) => parsed,
            Ok(Status::Partial) => return Ok(None),
            Err(_) => return Err(AgentError::Frame("invalid chunk size".to_string())),
        };
        pos += size_len;

        let size = usize::try_from(size)
            .map_err(|_| AgentError::Frame("chunk size overflow".to_string()))?;

        if size == 0 {
            // Skip trailer lines up to the terminating blank line
            loop {
                match data[pos..].windows(2).position(|w| w == b"\r\n") {
                    None => return Ok(None),
                    Some(0) => return Ok(Some((body.freeze(), pos + 2))),
                    Some(line) => pos += line + 2,
                }
            }
        }

        let total = body.len().saturating_add(size);
        if total > limit {
            return Err(AgentError::FrameTooLarge { size: total, limit });
        }
        let end = pos
            .checked_add(size)
            .filter(|end| end.checked_add(2).is_some())
            .ok_or_else(|| AgentError::Frame("chunk size overflow".to_string()))?;
        if data.len() < end + 2 {
            return Ok(None);
        }

        body.extend_from_slice(&data[pos..end]);
        if &data[end..end + 2] != b"\r\n" {
            return Err(AgentError::Frame("chunk not terminated by CRLF".to_string()));
        }
        pos = end + 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> ReplyDecoder {
        ReplyDecoder::new(1024)
    }

    #[test]
    fn test_encode_request_regenerates_framing() {
        let request = OutboundRequest::new(Method::POST, Uri::from_static("/invoke?x=1"))
            .with_header(TRANSFER_ENCODING, HeaderValue::from_static("chunked"))
            .with_header(CONTENT_LENGTH, HeaderValue::from_static("999"))
            .with_body("hello");

        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        let text = String::from_utf8(buf.to_vec()).unwrap();

        assert!(text.starts_with("POST /invoke?x=1 HTTP/1.1\r\n"));
        assert!(!text.contains("transfer-encoding"));
        assert!(text.contains("content-length: 5\r\n\r\nhello"));
        assert!(!text.contains("999"));
    }

    #[test]
    fn test_stamp_and_destination() {
        let mut request = OutboundRequest::new(Method::GET, Uri::from_static("/"));
        request
            .set_destination(&Endpoint::new("provider-small", 30000))
            .unwrap();
        request.stamp_request_id(42);

        assert_eq!(request.headers[HOST], "provider-small:30000");
        assert_eq!(request.headers[REQUEST_ID_HEADER], "42");
        assert_eq!(request.request_id().unwrap(), 42);
    }

    #[test]
    fn test_parse_request() {
        let mut buf = BytesMut::new();
        OutboundRequest::new(Method::POST, Uri::from_static("/"))
            .with_body("abc")
            .encode(&mut buf);
        buf.extend_from_slice(b"GET /next");

        let (request, used) = OutboundRequest::parse(&buf).unwrap().unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.body, Bytes::from_static(b"abc"));
        assert_eq!(&buf[used..], b"GET /next");
    }

    #[test]
    fn test_request_id_errors() {
        let reply = ProviderReply::new(StatusCode::OK);
        assert!(matches!(
            reply.request_id(),
            Err(AgentError::MissingRequestId)
        ));

        let reply = ProviderReply::new(StatusCode::OK).with_header(
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderValue::from_static("abc"),
        );
        assert!(matches!(
            reply.request_id(),
            Err(AgentError::MalformedRequestId(_))
        ));
    }

    #[test]
    fn test_decode_content_length_reply() {
        let mut buf = BytesMut::new();
        ProviderReply::new(StatusCode::OK)
            .with_request_id(5)
            .with_body("12345")
            .encode(&mut buf);

        let mut decoder = decoder();
        decoder.extend_from_slice(&buf);

        let reply = decoder.decode().unwrap().unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.request_id().unwrap(), 5);
        assert_eq!(reply.body, Bytes::from_static(b"12345"));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let mut buf = BytesMut::new();
        ProviderReply::new(StatusCode::ACCEPTED)
            .with_request_id(1)
            .with_body("payload")
            .encode(&mut buf);

        let mut decoder = decoder();
        let split = buf.len() - 3;
        decoder.extend_from_slice(&buf[..split]);
        assert!(decoder.decode().unwrap().is_none());

        decoder.extend_from_slice(&buf[split..]);
        let reply = decoder.decode().unwrap().unwrap();
        assert_eq!(reply.body, Bytes::from_static(b"payload"));
    }

    #[test]
    fn test_decode_back_to_back_replies() {
        let mut buf = BytesMut::new();
        for id in [3u64, 1, 2] {
            ProviderReply::new(StatusCode::OK)
                .with_request_id(id)
                .with_body(id.to_string())
                .encode(&mut buf);
        }

        let mut decoder = decoder();
        decoder.extend_from_slice(&buf);

        let ids: Vec<u64> = std::iter::from_fn(|| decoder.decode().unwrap())
            .map(|r| r.request_id().unwrap())
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn test_decode_chunked_reply() {
        let raw = b"HTTP/1.1 200 OK\r\nx-mesh-request-id: 9\r\ntransfer-encoding: chunked\r\n\r\n\
                    4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\nHTTP/1.1";

        let mut decoder = decoder();
        decoder.extend_from_slice(raw);

        let reply = decoder.decode().unwrap().unwrap();
        assert_eq!(reply.request_id().unwrap(), 9);
        assert_eq!(reply.body, Bytes::from_static(b"Wikipedia"));
        assert_eq!(decoder.buffered(), b"HTTP/1.1".len());
    }

    #[test]
    fn test_decode_chunked_partial() {
        let raw = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n4\r\nWi";
        let mut decoder = decoder();
        decoder.extend_from_slice(raw);
        assert!(decoder.decode().unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_oversized_body() {
        let raw = b"HTTP/1.1 200 OK\r\ncontent-length: 4096\r\n\r\n";
        let mut decoder = decoder();
        decoder.extend_from_slice(raw);
        assert!(matches!(
            decoder.decode(),
            Err(AgentError::FrameTooLarge {
                size: 4096,
                limit: 1024
            })
        ));
    }

    #[test]
    fn test_decode_garbage_is_frame_error() {
        let mut decoder = decoder();
        decoder.extend_from_slice(b"NOT-HTTP garbage\r\n\r\n");
        let err = decoder.decode().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_decode_missing_length_means_empty_body() {
        let mut decoder = decoder();
        decoder.extend_from_slice(b"HTTP/1.1 204 No Content\r\nx-mesh-request-id: 4\r\n\r\n");
        let reply = decoder.decode().unwrap().unwrap();
        assert_eq!(reply.status, StatusCode::NO_CONTENT);
        assert!(reply.body.is_empty());
    }

    #[test]
    fn test_decode_huge_chunk_size_is_an_error() {
        let mut decoder = decoder();
        decoder.extend_from_slice(
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
              4\r\nWiki\r\nffffffffffffffff\r\nxx",
        );
        let err = decoder.decode().unwrap_err();
        assert!(matches!(err, AgentError::FrameTooLarge { limit: 1024, .. }));
        assert!(err.is_fatal());

        // Same size on an unbounded decoder still fails cleanly
        let mut unbounded = ReplyDecoder::new(usize::MAX);
        unbounded.extend_from_slice(
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
              4\r\nWiki\r\nffffffffffffffff\r\nxx",
        );
        assert!(unbounded.decode().is_err());
    }

    #[test]
    fn test_decode_bodyless_statuses_ignore_content_length() {
        for status in ["204 No Content", "304 Not Modified", "100 Continue"] {
            let mut decoder = decoder();
            decoder.extend_from_slice(
                format!("HTTP/1.1 {}\r\ncontent-length: 7\r\n\r\nHTTP/1.1", status).as_bytes(),
            );
            let reply = decoder.decode().unwrap().unwrap();
            assert!(reply.body.is_empty(), "{} must not take a body", status);
            assert_eq!(decoder.buffered(), b"HTTP/1.1".len());
        }
    }

    #[test]
    fn test_decode_with_head_reply_keeps_following_reply() {
        let mut raw = BytesMut::new();
        raw.extend_from_slice(b"HTTP/1.1 200 OK\r\nx-mesh-request-id: 0\r\ncontent-length: 5\r\n\r\n");
        ProviderReply::new(StatusCode::OK)
            .with_request_id(1)
            .with_body("hello")
            .encode(&mut raw);

        let mut decoder = decoder();
        decoder.extend_from_slice(&raw);

        let has_body = |headers: &HeaderMap| parse_request_id(headers).ok() != Some(0);
        let head = decoder.decode_with(has_body).unwrap().unwrap();
        assert_eq!(head.request_id().unwrap(), 0);
        assert!(head.body.is_empty());

        let next = decoder.decode_with(has_body).unwrap().unwrap();
        assert_eq!(next.request_id().unwrap(), 1);
        assert_eq!(next.body, Bytes::from_static(b"hello"));
        assert_eq!(decoder.buffered(), 0);
    }
}
