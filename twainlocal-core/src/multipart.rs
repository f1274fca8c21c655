//! Multipart reply encoding and decoding
//!
//! Layout of a reply carrying image data:
//!
//! ```text
//! --WaFfLeSaReTaStY
//! Content-Type: application/json; charset=UTF-8
//! Content-Length: <n>
//!
//! {json}
//!
//! --WaFfLeSaReTaStY
//! Content-Type: application/pdf
//! Content-Length: <n>
//! Content-Transfer-Encoding: binary
//! Content-Disposition: inline; filename="thumbnail.pdf"
//!
//! <bytes>
//!
//! --WaFfLeSaReTaStY
//! ...image part...
//! --WaFfLeSaReTaStY--
//! ```
//!
//! Line endings are CRLF on the way out; the reader accepts bare LF too.

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::constants::{CONTENT_TYPE_JSON, CONTENT_TYPE_PDF, MULTIPART_BOUNDARY};
use crate::error::{Error, Result};

/// Terminates every part
pub const PART_TRAILER: &[u8] = b"\r\n\r\n";

/// Kind of a multipart part
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PartKind {
    Json,
    Thumbnail,
    Image,
}

impl PartKind {
    /// `Content-Disposition` filename for binary parts
    pub fn filename(self) -> &'static str {
        match self {
            Self::Json => "reply.json",
            Self::Thumbnail => "thumbnail.pdf",
            Self::Image => "image.pdf",
        }
    }
}

/// `Content-Type` header value for a multipart reply
pub fn content_type() -> String {
    format!("multipart/mixed; boundary=\"{}\"", MULTIPART_BOUNDARY)
}

/// Extract the boundary from a `Content-Type` header, if it is multipart
pub fn boundary_of(content_type: &str) -> Option<String> {
    if !content_type.trim_start().to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }

    content_type.split(';').find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

/// JSON part, complete with its trailer
pub fn json_part(json: &str) -> Bytes {
    let mut part = BytesMut::with_capacity(json.len() + 128);
    part.extend_from_slice(
        format!(
            "--{}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            MULTIPART_BOUNDARY,
            CONTENT_TYPE_JSON,
            json.len()
        )
        .as_bytes(),
    );
    part.extend_from_slice(json.as_bytes());
    part.extend_from_slice(PART_TRAILER);
    part.freeze()
}

/// Header block of a binary part; the payload and [`PART_TRAILER`] follow
pub fn binary_part_header(kind: PartKind, length: u64) -> Bytes {
    Bytes::from(format!(
        "--{}\r\nContent-Type: {}\r\nContent-Length: {}\r\nContent-Transfer-Encoding: binary\r\nContent-Disposition: inline; filename=\"{}\"\r\n\r\n",
        MULTIPART_BOUNDARY,
        CONTENT_TYPE_PDF,
        length,
        kind.filename()
    ))
}

/// Closing delimiter
pub fn closing_boundary() -> Bytes {
    Bytes::from(format!("--{}--\r\n", MULTIPART_BOUNDARY))
}

/// Encode a whole reply in memory
pub fn encode(json: &str, parts: &[(PartKind, &[u8])]) -> Bytes {
    let mut body = BytesMut::new();
    body.extend_from_slice(&json_part(json));
    for (kind, data) in parts {
        body.extend_from_slice(&binary_part_header(*kind, data.len() as u64));
        body.extend_from_slice(data);
        body.extend_from_slice(PART_TRAILER);
    }
    body.extend_from_slice(&closing_boundary());
    body.freeze()
}

/// Something the reader found in the body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartEvent {
    /// The JSON part, trimmed to its outermost braces
    Json(String),
    /// A binary part begins
    PartStart(PartKind),
    /// Next chunk of a binary part
    Data(PartKind, Bytes),
    /// A binary part is complete
    PartEnd(PartKind),
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    /// Looking for the next boundary line
    Boundary,
    Headers,
    Json,
    Binary { kind: PartKind, remaining: u64 },
    Done,
}

/// Incremental multipart reader
///
/// Feed it body chunks as they arrive; binary payload is handed back as
/// [`MultipartEvent::Data`] without ever being converted to text.
#[derive(Debug)]
pub struct MultipartReader {
    marker: Vec<u8>,
    buf: BytesMut,
    state: ReadState,
    saw_json: bool,
}

impl MultipartReader {
    pub fn new(boundary: &str) -> Self {
        Self {
            marker: format!("--{}", boundary).into_bytes(),
            buf: BytesMut::new(),
            state: ReadState::Boundary,
            saw_json: false,
        }
    }

    /// Consume the next chunk of the body
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<MultipartEvent>> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            match self.state {
                ReadState::Boundary => match self.take_boundary() {
                    Some(true) => self.state = ReadState::Done,
                    Some(false) => self.state = ReadState::Headers,
                    None => break,
                },
                ReadState::Headers => {
                    let Some((end, separator)) = find_header_end(&self.buf) else {
                        break;
                    };
                    let head = self.buf.split_to(end);
                    self.buf.advance(separator);

                    let (kind, length) = parse_headers(&head)?;
                    trace!("Multipart part {:?} ({:?} bytes)", kind, length);
                    self.state = match kind {
                        PartKind::Json => ReadState::Json,
                        kind => {
                            let remaining = length.ok_or_else(|| {
                                Error::Multipart("binary part without Content-Length".into())
                            })?;
                            events.push(MultipartEvent::PartStart(kind));
                            ReadState::Binary { kind, remaining }
                        }
                    };
                }
                ReadState::Json => {
                    let Some(position) = find(&self.buf, &self.marker) else {
                        break;
                    };
                    let segment = self.buf.split_to(position);
                    events.push(MultipartEvent::Json(trim_json(&segment)?));
                    self.saw_json = true;
                    self.state = ReadState::Boundary;
                }
                ReadState::Binary { kind, remaining } => {
                    if remaining == 0 {
                        events.push(MultipartEvent::PartEnd(kind));
                        self.state = ReadState::Boundary;
                        continue;
                    }
                    if self.buf.is_empty() {
                        break;
                    }

                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let data = self.buf.split_to(take).freeze();
                    events.push(MultipartEvent::Data(kind, data));
                    self.state = ReadState::Binary {
                        kind,
                        remaining: remaining - take as u64,
                    };
                }
                ReadState::Done => {
                    self.buf.clear();
                    break;
                }
            }
        }

        Ok(events)
    }

    /// Signal the end of the body
    pub fn finish(&mut self) -> Result<Vec<MultipartEvent>> {
        let mut events = Vec::new();

        match self.state {
            ReadState::Json => {
                let segment = self.buf.split();
                events.push(MultipartEvent::Json(trim_json(&segment)?));
                self.saw_json = true;
            }
            ReadState::Binary { remaining, .. } if remaining > 0 => {
                return Err(Error::Multipart(format!(
                    "body ended with {} bytes of a part missing",
                    remaining
                )));
            }
            _ => {}
        }
        self.state = ReadState::Done;

        if !self.saw_json {
            return Err(Error::Multipart("no JSON part found".into()));
        }
        Ok(events)
    }

    /// Consume up to and including the next boundary line
    ///
    /// `Some(true)` for the closing delimiter, `None` if more input is needed.
    fn take_boundary(&mut self) -> Option<bool> {
        let Some(position) = find(&self.buf, &self.marker) else {
            // keep a possible partial marker at the tail
            let keep = self.marker.len().saturating_sub(1).min(self.buf.len());
            let discard = self.buf.len() - keep;
            self.buf.advance(discard);
            return None;
        };

        let after = position + self.marker.len();
        if self.buf.len() < after + 2 {
            return None;
        }
        if &self.buf[after..after + 2] == b"--" {
            self.buf.clear();
            return Some(true);
        }

        let line_end = self.buf[after..].iter().position(|&b| b == b'\n')?;
        self.buf.advance(after + line_end + 1);
        Some(false)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = find(buf, b"\r\n\r\n").map(|position| (position, 4));
    let lf = find(buf, b"\n\n").map(|position| (position, 2));

    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_headers(head: &[u8]) -> Result<(PartKind, Option<u64>)> {
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::Multipart("part headers are not UTF-8".into()))?;

    let mut content_type = String::new();
    let mut disposition = String::new();
    let mut length = None;

    for line in text.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "content-type" => content_type = value.to_ascii_lowercase(),
            "content-disposition" => disposition = value.to_string(),
            "content-length" => {
                length = Some(value.parse::<u64>().map_err(|_| {
                    Error::Multipart(format!("bad Content-Length: {}", value))
                })?)
            }
            _ => {}
        }
    }

    let kind = if content_type.starts_with("application/json") {
        PartKind::Json
    } else if disposition.contains(PartKind::Thumbnail.filename()) {
        PartKind::Thumbnail
    } else {
        PartKind::Image
    };
    Ok((kind, length))
}

fn trim_json(segment: &[u8]) -> Result<String> {
    let start = segment.iter().position(|&b| b == b'{');
    let end = segment.iter().rposition(|&b| b == b'}');

    match (start, end) {
        (Some(start), Some(end)) if start < end => String::from_utf8(segment[start..=end].to_vec())
            .map_err(|_| Error::Multipart("JSON part is not UTF-8".into())),
        _ => Err(Error::Multipart("JSON part has no object".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default, PartialEq)]
    struct Decoded {
        json: Option<String>,
        thumbnail: Vec<u8>,
        image: Vec<u8>,
        ended: Vec<PartKind>,
    }

    fn decode(body: &[u8], chunk_size: usize) -> Decoded {
        let mut reader = MultipartReader::new(MULTIPART_BOUNDARY);
        let mut events = Vec::new();
        for chunk in body.chunks(chunk_size) {
            events.extend(reader.feed(chunk).unwrap());
        }
        events.extend(reader.finish().unwrap());

        let mut decoded = Decoded::default();
        for event in events {
            match event {
                MultipartEvent::Json(json) => decoded.json = Some(json),
                MultipartEvent::Data(PartKind::Thumbnail, data) => decoded.thumbnail.extend_from_slice(&data),
                MultipartEvent::Data(_, data) => decoded.image.extend_from_slice(&data),
                MultipartEvent::PartEnd(kind) => decoded.ended.push(kind),
                MultipartEvent::PartStart(_) => {}
            }
        }
        decoded
    }

    fn binary(len: usize) -> Vec<u8> {
        // includes CR, LF and bytes that are not valid UTF-8
        (0..len).map(|i| (i * 37 % 256) as u8).collect()
    }

    const JSON: &str = r#"{"kind":"twainlocalscanner","results":{"success":true}}"#;

    #[test]
    fn test_round_trip_json_only() {
        let body = encode(JSON, &[]);
        let decoded = decode(&body, 7);
        assert_eq!(decoded.json.as_deref(), Some(JSON));
        assert!(decoded.ended.is_empty());
    }

    #[test]
    fn test_round_trip_thumbnail() {
        let thumbnail = binary(1000);
        let body = encode(JSON, &[(PartKind::Thumbnail, &thumbnail)]);
        let decoded = decode(&body, 13);
        assert_eq!(decoded.json.as_deref(), Some(JSON));
        assert_eq!(decoded.thumbnail, thumbnail);
        assert_eq!(decoded.ended, vec![PartKind::Thumbnail]);
    }

    #[test]
    fn test_round_trip_image_and_thumbnail() {
        let thumbnail = binary(300);
        let image = binary(70_000);
        let body = encode(JSON, &[(PartKind::Thumbnail, &thumbnail), (PartKind::Image, &image)]);

        for chunk_size in [1, 16, 4096, body.len()] {
            let decoded = decode(&body, chunk_size);
            assert_eq!(decoded.json.as_deref(), Some(JSON));
            assert_eq!(decoded.thumbnail, thumbnail);
            assert_eq!(decoded.image, image);
            assert_eq!(decoded.ended, vec![PartKind::Thumbnail, PartKind::Image]);
        }
    }

    #[test]
    fn test_bare_lf_without_closing_boundary() {
        let image = b"\x00\x01PDF\n\n--".to_vec();
        let mut body = format!(
            "--{b}\nContent-Type: application/json; charset=UTF-8\nContent-Length: {n}\n\n{json}\n\n--{b}\nContent-Type: application/pdf\nContent-Length: {len}\nContent-Transfer-Encoding: binary\nContent-Disposition: inline; filename=\"image.pdf\"\n\n",
            b = MULTIPART_BOUNDARY,
            n = JSON.len(),
            json = JSON,
            len = image.len()
        )
        .into_bytes();
        body.extend_from_slice(&image);
        body.extend_from_slice(b"\n\n");

        let decoded = decode(&body, 5);
        assert_eq!(decoded.json.as_deref(), Some(JSON));
        assert_eq!(decoded.image, image);
    }

    #[test]
    fn test_truncated_part_is_error() {
        let image = binary(100);
        let body = encode(JSON, &[(PartKind::Image, &image)]);
        let cut = body.len() - 60;

        let mut reader = MultipartReader::new(MULTIPART_BOUNDARY);
        reader.feed(&body[..cut]).unwrap();
        assert!(reader.finish().is_err());
    }

    #[test]
    fn test_boundary_of() {
        assert_eq!(
            boundary_of(&content_type()).as_deref(),
            Some(MULTIPART_BOUNDARY)
        );
        assert_eq!(boundary_of("application/json; charset=UTF-8"), None);
    }
}
