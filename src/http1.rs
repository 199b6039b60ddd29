//! HTTP/1.x message reading and writing
//!
//! Bodies are read fully into memory. Whatever framing a message arrived
//! with (chunked, `Content-Length`, or read-until-close) it leaves here
//! framed by `Content-Length`, so callers can re-serialize it as is.

use crate::errors::{new_io_error, Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Version};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound on a request or status line plus its headers
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Upper bound on a decoded message body
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

const PROXY_CONNECTION: &str = "proxy-connection";

/// Read one request from `reader`
///
/// Returns `Ok(None)` when the peer closed the connection before sending
/// anything, which is how a keep-alive client says goodbye.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request<Bytes>>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let mut consumed = 0;
  // tolerate stray CRLFs between pipelined requests
  loop {
    line.clear();
    let n = read_line(reader, &mut line, MAX_HEAD_SIZE - consumed).await?;
    if n == 0 {
      return Ok(None);
    }
    consumed += n;
    if trim_line(&line).is_empty() {
      continue;
    }
    break;
  }

  let (method, target, version) = parse_request_line(trim_line(&line))?;
  let headers = read_headers(reader, consumed).await?;
  let body = if method == Method::CONNECT {
    None
  } else if is_chunked(&headers) {
    Some(read_chunked_body(reader).await?)
  } else if let Some(length) = content_length(&headers)? {
    Some(read_exact_body(reader, length).await?)
  } else {
    None
  };

  let mut builder = Request::builder()
    .method(method)
    .uri(target)
    .version(version);
  if let Some(h) = builder.headers_mut() {
    *h = headers;
    if let Some(body) = &body {
      frame_with_length(h, body.len());
    }
  }
  Ok(Some(builder.body(body.unwrap_or_default())?))
}

/// Read the response to a `method` request from `reader`
///
/// Interim `1xx` responses are skipped. A body without any framing is read
/// until the peer closes.
pub async fn read_response<R>(reader: &mut R, method: &Method) -> Result<Response<Bytes>>
where
  R: AsyncBufRead + Unpin,
{
  loop {
    let mut line = Vec::new();
    let n = read_line(reader, &mut line, MAX_HEAD_SIZE).await?;
    if n == 0 {
      return Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed before response",
      ));
    }
    let (version, status) = parse_status_line(trim_line(&line))?;
    let headers = read_headers(reader, n).await?;
    if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
      continue;
    }

    let bodyless = *method == Method::HEAD
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED;
    let body = if bodyless {
      None
    } else if is_chunked(&headers) {
      Some(read_chunked_body(reader).await?)
    } else if let Some(length) = content_length(&headers)? {
      Some(read_exact_body(reader, length).await?)
    } else {
      let mut buf = Vec::new();
      (&mut *reader)
        .take(MAX_BODY_SIZE as u64 + 1)
        .read_to_end(&mut buf)
        .await?;
      if buf.len() > MAX_BODY_SIZE {
        return Err(Error::invalid_request("message body too large"));
      }
      Some(Bytes::from(buf))
    };

    let mut builder = Response::builder().version(version).status(status);
    if let Some(h) = builder.headers_mut() {
      *h = headers;
      if let Some(body) = &body {
        frame_with_length(h, body.len());
      }
    }
    return Ok(builder.body(body.unwrap_or_default())?);
  }
}

async fn read_headers<R>(reader: &mut R, mut consumed: usize) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  loop {
    header_line.clear();
    let length = read_line(reader, &mut header_line, MAX_HEAD_SIZE - consumed).await?;
    if length == 0 {
      return Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed inside message head",
      ));
    }
    consumed += length;
    let line = trim_line(&header_line);
    if line.is_empty() {
      break;
    }
    let (k, v) = parser_headers(line)?;
    headers.append(k, v);
  }
  Ok(headers)
}

/// Read up to and including the next `\n`, allowing at most `limit` bytes
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>, limit: usize) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let n = (&mut *reader)
    .take(limit as u64 + 1)
    .read_until(b'\n', line)
    .await?;
  if n > limit {
    return Err(Error::invalid_request("message head too large"));
  }
  Ok(n)
}

/// Split a `Name: value` header line
pub(crate) fn parser_headers(line: &[u8]) -> Result<(HeaderName, HeaderValue)> {
  let colon = line
    .iter()
    .position(|b| *b == b':')
    .ok_or_else(|| Error::invalid_request("header line without a colon"))?;
  let name = HeaderName::from_bytes(&line[..colon]).map_err(|e| Error::Http(e.into()))?;
  let value = trim_ascii(&line[colon + 1..]);
  let value = HeaderValue::from_bytes(value)?;
  Ok((name, value))
}

fn parse_request_line(line: &[u8]) -> Result<(Method, http::Uri, Version)> {
  let mut parts = line.split(|b| *b == b' ').filter(|p| !p.is_empty());
  let (Some(method), Some(target), Some(version), None) =
    (parts.next(), parts.next(), parts.next(), parts.next())
  else {
    return Err(Error::invalid_request(format!(
      "malformed request line: {:?}",
      String::from_utf8_lossy(line)
    )));
  };
  let method = Method::from_bytes(method)
    .map_err(|_| Error::invalid_request("invalid method"))?;
  let target = http::Uri::try_from(target)
    .map_err(|e| Error::invalid_request(format!("invalid request target: {}", e)))?;
  let version = parse_version(version)
    .ok_or_else(|| Error::invalid_request("unsupported http version"))?;
  Ok((method, target, version))
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode)> {
  let mut parts = line.splitn(3, |b| *b == b' ');
  let version = parts
    .next()
    .and_then(parse_version)
    .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "invalid http version"))?;
  let status = parts
    .next()
    .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "missing status code"))?;
  let status = StatusCode::from_bytes(status).map_err(|e| Error::Http(e.into()))?;
  Ok((version, status))
}

fn parse_version(raw: &[u8]) -> Option<Version> {
  match raw {
    b"HTTP/1.0" => Some(Version::HTTP_10),
    b"HTTP/1.1" => Some(Version::HTTP_11),
    _ => None,
  }
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>> {
  match headers.get(CONTENT_LENGTH) {
    None => Ok(None),
    Some(value) => value
      .to_str()
      .ok()
      .and_then(|v| v.trim().parse::<usize>().ok())
      .map(Some)
      .ok_or_else(|| Error::invalid_request("invalid content-length")),
  }
}

async fn read_exact_body<R>(reader: &mut R, length: usize) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  if length > MAX_BODY_SIZE {
    return Err(Error::invalid_request(format!(
      "content-length {} exceeds the body limit",
      length
    )));
  }
  let mut body = Vec::new();
  (&mut *reader)
    .take(length as u64)
    .read_to_end(&mut body)
    .await?;
  if body.len() < length {
    return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated message body"));
  }
  Ok(Bytes::from(body))
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    if read_line(reader, &mut line, MAX_HEAD_SIZE).await? == 0 {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated chunked body"));
    }
    let size = trim_line(&line);
    // drop chunk extensions
    let size = size.split(|b| *b == b';').next().unwrap_or_default();
    let size = std::str::from_utf8(trim_ascii(size))
      .ok()
      .and_then(|s| usize::from_str_radix(s, 16).ok())
      .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "invalid chunk size"))?;
    if size == 0 {
      // trailers are read and discarded
      let mut trailers = 0;
      loop {
        line.clear();
        let n = read_line(reader, &mut line, MAX_HEAD_SIZE - trailers).await?;
        trailers += n;
        if n == 0 || trim_line(&line).is_empty() {
          return Ok(Bytes::from(body));
        }
      }
    }
    let start = body.len();
    let end = start
      .checked_add(size)
      .filter(|end| *end <= MAX_BODY_SIZE)
      .ok_or_else(|| Error::invalid_request("chunked body exceeds the body limit"))?;
    body.resize(end, 0);
    reader.read_exact(&mut body[start..]).await?;
    line.clear();
    read_line(reader, &mut line, MAX_HEAD_SIZE).await?;
  }
}

fn frame_with_length(headers: &mut HeaderMap, length: usize) {
  headers.remove(TRANSFER_ENCODING);
  headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
}

fn trim_line(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
  while let [first, rest @ ..] = bytes {
    if first.is_ascii_whitespace() {
      bytes = rest;
    } else {
      break;
    }
  }
  while let [rest @ .., last] = bytes {
    if last.is_ascii_whitespace() {
      bytes = rest;
    } else {
      break;
    }
  }
  bytes
}

/// Serialize `request` in origin form, as sent to the origin server
pub fn request_to_raw(request: &Request<Bytes>) -> Bytes {
  let mut http_request = Vec::new();
  http_request.extend(request.method().as_str().as_bytes());
  http_request.extend(SPACE);
  let path = request
    .uri()
    .path_and_query()
    .map(|pq| pq.as_str())
    .filter(|pq| !pq.is_empty())
    .unwrap_or("/");
  http_request.extend(path.as_bytes());
  http_request.extend(SPACE);
  http_request.extend(format!("{:?}", request.version()).as_bytes());
  http_request.extend(CR_LF);
  if request.headers().get(HOST).is_none() {
    if let Some(authority) = request.uri().authority() {
      http_request.extend(HOST.as_str().as_bytes());
      http_request.extend(COLON_SPACE);
      http_request.extend(authority.as_str().as_bytes());
      http_request.extend(CR_LF);
    }
  }
  let mut headers = request.headers().clone();
  if !request.body().is_empty() {
    headers
      .entry(CONTENT_LENGTH)
      .or_insert(HeaderValue::from(request.body().len()));
  }
  extend_headers(&mut http_request, &headers);
  http_request.extend(CR_LF);
  http_request.extend(request.body());
  Bytes::from(http_request)
}

/// Serialize `response` for the client
pub fn response_to_raw(response: &Response<Bytes>) -> Bytes {
  let mut http_response = Vec::new();
  http_response.extend(format!("{:?}", response.version()).as_bytes());
  http_response.extend(SPACE);
  http_response.extend(response.status().as_str().as_bytes());
  if let Some(reason) = response.status().canonical_reason() {
    http_response.extend(SPACE);
    http_response.extend(reason.as_bytes());
  }
  http_response.extend(CR_LF);
  extend_headers(&mut http_response, response.headers());
  http_response.extend(CR_LF);
  http_response.extend(response.body());
  Bytes::from(http_response)
}

fn extend_headers(buf: &mut Vec<u8>, headers: &HeaderMap) {
  for (k, v) in headers.iter() {
    buf.extend(k.as_str().as_bytes());
    buf.extend(COLON_SPACE);
    buf.extend(v.as_bytes());
    buf.extend(CR_LF);
  }
}

/// Remove the headers addressed to the proxy itself
pub fn strip_proxy_headers(headers: &mut HeaderMap) {
  headers.remove(http::header::PROXY_AUTHORIZATION);
  headers.remove(PROXY_CONNECTION);
}

/// Whether the sender of a message with these headers closes afterwards
pub fn wants_close(version: Version, headers: &HeaderMap) -> bool {
  let has_token = |token: &str| {
    headers
      .get_all(CONNECTION)
      .iter()
      .chain(headers.get_all(PROXY_CONNECTION).iter())
      .filter_map(|v| v.to_str().ok())
      .flat_map(|v| v.split(','))
      .any(|t| t.trim().eq_ignore_ascii_case(token))
  };
  if has_token("close") {
    return true;
  }
  version == Version::HTTP_10 && !has_token("keep-alive")
}
