//! `multipart/form-data` encoding and decoding.
//!
//! The decoder works on raw bytes: only the header block of each part is
//! read as text, bodies are copied out as opaque byte ranges. The first
//! occurrence of `--boundary` always frames, so encoders must choose a
//! boundary that never appears inside any part, which [`encode`] does.

use uuid::Uuid;

use crate::error::{LarkError, Result};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        filename: String,
        content_type: String,
        bytes: Vec<u8>,
    },
}

impl Part {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Text {
            name: name.into(),
            value: value.into(),
        }
    }

    /// File part. The content type is reduced to a single trimmed line,
    /// falling back to [`DEFAULT_CONTENT_TYPE`] when nothing is left.
    pub fn file(
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl AsRef<str>,
        bytes: Vec<u8>,
    ) -> Self {
        Self::File {
            name: name.into(),
            filename: filename.into(),
            content_type: header_value(content_type.as_ref()),
            bytes,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Text { name, .. } | Self::File { name, .. } => name,
        }
    }

    fn content(&self) -> &[u8] {
        match self {
            Self::Text { value, .. } => value.as_bytes(),
            Self::File { bytes, .. } => bytes,
        }
    }
}

/// Borrowed view of a file part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment<'a> {
    pub name: &'a str,
    pub filename: &'a str,
    pub content_type: &'a str,
    pub bytes: &'a [u8],
}

/// Ordered parts of a form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartMessage {
    parts: Vec<Part>,
}

impl MultipartMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    pub fn push(&mut self, part: Part) {
        self.parts.push(part);
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Last text value sent under `name`.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.parts.iter().rev().find_map(|p| match p {
            Part::Text { name: n, value } if n == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// The attachment; when several file parts are present the last one wins.
    pub fn attachment(&self) -> Option<Attachment<'_>> {
        self.parts.iter().rev().find_map(|p| match p {
            Part::File {
                name,
                filename,
                content_type,
                bytes,
            } => Some(Attachment {
                name,
                filename,
                content_type,
                bytes,
            }),
            Part::Text { .. } => None,
        })
    }

    pub fn require_attachment(&self) -> Result<Attachment<'_>> {
        self.attachment().ok_or(LarkError::MissingUpload)
    }
}

/// An encoded body and the boundary that frames it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub body: Vec<u8>,
    pub boundary: String,
}

impl Encoded {
    /// Value for the request's `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }
}

fn random_boundary() -> String {
    format!("----LarkgateBoundary{}", Uuid::new_v4().simple())
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle, 0).is_some()
}

/// Checked against the header text as written, not the raw values.
fn collides(message: &MultipartMessage, boundary: &str) -> bool {
    let b = boundary.as_bytes();
    b.is_empty()
        || message.parts.iter().any(|part| {
            contains(escape_quoted(part.name()).as_bytes(), b)
                || contains(part.content(), b)
                || match part {
                    Part::File {
                        filename,
                        content_type,
                        ..
                    } => {
                        contains(escape_quoted(filename).as_bytes(), b)
                            || contains(header_value(content_type).as_bytes(), b)
                    }
                    Part::Text { .. } => false,
                }
        })
}

/// Quoted header parameter value: `\` and `"` become quoted pairs, `%` and
/// line breaks are percent-encoded so the header stays on one line.
fn escape_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '%' => out.push_str("%25"),
            '\r' => out.push_str("%0D"),
            '\n' => out.push_str("%0A"),
            _ => out.push(c),
        }
    }
    out
}

/// Content types are single-line header values.
fn header_value(content_type: &str) -> String {
    let cleaned: String = content_type
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        DEFAULT_CONTENT_TYPE.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Encode with a fresh random boundary that collides with no part.
pub fn encode(message: &MultipartMessage) -> Encoded {
    encode_with(message, random_boundary)
}

pub(crate) fn encode_with<F>(message: &MultipartMessage, mut next_boundary: F) -> Encoded
where
    F: FnMut() -> String,
{
    let boundary = loop {
        let candidate = next_boundary();
        if !collides(message, &candidate) {
            break candidate;
        }
        tracing::debug!("multipart boundary collided with part content, redrawing");
    };

    let mut body = Vec::with_capacity(
        message
            .parts
            .iter()
            .map(|p| p.content().len() + 128)
            .sum::<usize>()
            + boundary.len()
            + 8,
    );
    for part in &message.parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match part {
            Part::Text { name, value } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                        escape_quoted(name)
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File {
                name,
                filename,
                content_type,
                bytes,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        escape_quoted(name),
                        escape_quoted(filename),
                        header_value(content_type)
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
            }
        }
        body.extend_from_slice(CRLF);
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    Encoded { body, boundary }
}

/// Split `a=b; c="d;e"` style parameters, honouring quotes. Keys are lowercased.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for ch in input.chars() {
        match ch {
            _ if escaped => {
                current.push(ch);
                escaped = false;
            }
            '\\' if in_quotes => {
                current.push(ch);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ';' if !in_quotes => segments.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    segments.push(current);

    segments
        .into_iter()
        .filter_map(|seg| {
            let (key, value) = seg.split_once('=')?;
            Some((key.trim().to_ascii_lowercase(), unquote(value.trim())))
        })
        .collect()
}

/// `%22`, `%25`, `%0D` and `%0A` as browsers and [`escape_quoted`] write them.
fn percent_escape(hex: &str) -> Option<char> {
    match hex.to_ascii_uppercase().as_str() {
        "22" => Some('"'),
        "25" => Some('%'),
        "0D" => Some('\r'),
        "0A" => Some('\n'),
        _ => None,
    }
}

/// Reverses [`escape_quoted`]; also accepts quoted pairs from other encoders.
fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut rest = inner;
    while let Some(c) = rest.chars().next() {
        rest = &rest[c.len_utf8()..];
        match c {
            '\\' => {
                if let Some(next) = rest.chars().next() {
                    out.push(next);
                    rest = &rest[next.len_utf8()..];
                }
            }
            '%' => match rest.get(..2).and_then(percent_escape) {
                Some(decoded) => {
                    out.push(decoded);
                    rest = &rest[2..];
                }
                None => out.push('%'),
            },
            _ => out.push(c),
        }
    }
    out
}

/// The `boundary` parameter of a `Content-Type` header.
pub fn boundary_from_content_type(content_type: &str) -> Result<String> {
    let (_, params) = content_type.split_once(';').ok_or_else(|| {
        LarkError::MalformedMultipart(format!("no boundary parameter in {content_type:?}"))
    })?;
    split_params(params)
        .into_iter()
        .find(|(k, _)| k == "boundary")
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            LarkError::MalformedMultipart(format!("no boundary parameter in {content_type:?}"))
        })
}

/// Decode a body using the boundary declared in its `Content-Type` header.
pub fn decode_with_content_type(bytes: &[u8], content_type: &str) -> Result<MultipartMessage> {
    let boundary = boundary_from_content_type(content_type)?;
    decode(bytes, &boundary)
}

#[derive(Debug, Default)]
struct PartHeaders {
    name: Option<String>,
    filename: Option<String>,
    content_type: Option<String>,
}

fn parse_headers(block: &[u8]) -> PartHeaders {
    let text = String::from_utf8_lossy(block);
    let mut headers = PartHeaders::default();
    for line in text.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("content-disposition") {
            for (param, v) in split_params(value) {
                match param.as_str() {
                    "name" => headers.name = Some(v),
                    "filename" => headers.filename = Some(v),
                    _ => {}
                }
            }
        } else if key.eq_ignore_ascii_case("content-type") {
            let v = value.trim();
            if !v.is_empty() {
                headers.content_type = Some(v.to_string());
            }
        }
    }
    headers
}

enum State {
    ScanningBoundary,
    ReadingHeaders,
    ReadingBody(PartHeaders),
}

/// Decode a body framed by `boundary` (without the leading `--`).
pub fn decode(bytes: &[u8], boundary: &str) -> Result<MultipartMessage> {
    if boundary.is_empty() {
        return Err(LarkError::MalformedMultipart("empty boundary".into()));
    }
    let delimiter = format!("--{boundary}").into_bytes();
    let mut message = MultipartMessage::new();
    let mut pos = 0usize;
    let mut state = State::ScanningBoundary;

    loop {
        state = match state {
            State::ScanningBoundary => {
                let at = find(bytes, &delimiter, pos).ok_or_else(|| {
                    if message.parts.is_empty() {
                        LarkError::MalformedMultipart("boundary delimiter not found".into())
                    } else {
                        LarkError::MalformedMultipart("missing closing boundary".into())
                    }
                })?;
                pos = at + delimiter.len();
                if bytes[pos..].starts_with(b"--") {
                    break;
                }
                if bytes[pos..].starts_with(CRLF) {
                    pos += CRLF.len();
                }
                State::ReadingHeaders
            }
            State::ReadingHeaders => {
                let next = find(bytes, &delimiter, pos).ok_or_else(|| {
                    LarkError::MalformedMultipart("unterminated part".into())
                })?;
                let (header_block, body_start) = if bytes[pos..next].starts_with(CRLF) {
                    (&bytes[pos..pos], pos + CRLF.len())
                } else {
                    let sep = find(&bytes[..next], HEADER_END, pos).ok_or_else(|| {
                        LarkError::MalformedMultipart("part lacks header/body separator".into())
                    })?;
                    (&bytes[pos..sep], sep + HEADER_END.len())
                };
                pos = body_start;
                State::ReadingBody(parse_headers(header_block))
            }
            State::ReadingBody(headers) => {
                let next = find(bytes, &delimiter, pos).ok_or_else(|| {
                    LarkError::MalformedMultipart("unterminated part".into())
                })?;
                let mut end = next;
                if end >= pos + CRLF.len() && &bytes[end - CRLF.len()..end] == CRLF {
                    end -= CRLF.len();
                }
                let body = &bytes[pos..end];
                pos = next;

                match (headers.name, headers.filename) {
                    (name, Some(filename)) => message.push(Part::File {
                        name: name.unwrap_or_default(),
                        filename,
                        content_type: headers
                            .content_type
                            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
                        bytes: body.to_vec(),
                    }),
                    (Some(name), None) => {
                        let value = String::from_utf8(body.to_vec()).map_err(|_| {
                            LarkError::MalformedMultipart(format!(
                                "text field {name:?} is not valid UTF-8"
                            ))
                        })?;
                        message.push(Part::Text { name, value });
                    }
                    (None, None) => {
                        tracing::warn!("multipart part without a name, skipping");
                    }
                }
                State::ScanningBoundary
            }
        };
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MultipartMessage {
        MultipartMessage::new()
            .with(Part::text("app_token", "bascnAPP"))
            .with(Part::text("record_id", "recX"))
            .with(Part::file(
                "file",
                "report.pdf",
                "application/pdf",
                vec![0x25, 0x50, 0x44, 0x46, 0x00, 0xff, 0x0d, 0x0a, 0x0d, 0x0a, 0x80],
            ))
    }

    #[test]
    fn encode_emits_expected_framing() {
        let message = MultipartMessage::new()
            .with(Part::text("size", "3"))
            .with(Part::file("file", "a.bin", DEFAULT_CONTENT_TYPE, b"abc".to_vec()));
        let encoded = encode_with(&message, || "XYZ".to_string());
        let expected = "--XYZ\r\n\
            Content-Disposition: form-data; name=\"size\"\r\n\r\n\
            3\r\n\
            --XYZ\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"a.bin\"\r\n\
            Content-Type: application/octet-stream\r\n\r\n\
            abc\r\n\
            --XYZ--\r\n";
        assert_eq!(String::from_utf8(encoded.body).unwrap(), expected);
        assert_eq!(encoded.boundary, "XYZ");
    }

    #[test]
    fn round_trip_preserves_parts_and_binary() {
        let message = sample();
        let encoded = encode(&message);
        let decoded = decode_with_content_type(&encoded.body, &encoded.content_type()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn round_trip_preserves_awkward_names() {
        let message = MultipartMessage::new()
            .with(Part::text("say \"hi\"", "v"))
            .with(Part::text("100%25 off", "w"))
            .with(Part::file("file", r"C:\docs\a.txt", "text/plain", b"a".to_vec()))
            .with(Part::file("file", "say \"hi\".txt", "text/plain", b"b".to_vec()))
            .with(Part::file("file", "季度报告 ü.pdf", "application/pdf", b"c".to_vec()))
            .with(Part::file("file", "two\r\nlines; x=\"y\"", "text/plain", b"d".to_vec()));
        let encoded = encode(&message);
        let decoded = decode(&encoded.body, &encoded.boundary).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn quoted_values_are_escaped_on_the_wire() {
        let message = MultipartMessage::new().with(Part::file(
            "file",
            "a\\b \"c\" 5%",
            "text/plain",
            Vec::new(),
        ));
        let encoded = encode_with(&message, || "XYZ".to_string());
        let wire = String::from_utf8(encoded.body).unwrap();
        assert!(wire.contains(r#"filename="a\\b \"c\" 5%25""#));
    }

    #[test]
    fn browser_percent_escapes_are_decoded() {
        let body = b"--B\r\nContent-Disposition: form-data; name=\"file\"; filename=\"say %22hi%22 100%.txt\"\r\n\r\nx\r\n--B--\r\n";
        let message = decode(body, "B").unwrap();
        assert_eq!(message.attachment().unwrap().filename, "say \"hi\" 100%.txt");
    }

    #[test]
    fn content_type_cannot_inject_headers() {
        let message = MultipartMessage::new().with(Part::File {
            name: "file".into(),
            filename: "a.txt".into(),
            content_type: "text/plain\r\nX-Injected: 1".into(),
            bytes: b"a".to_vec(),
        });
        let encoded = encode_with(&message, || "XYZ".to_string());
        let wire = String::from_utf8(encoded.body).unwrap();
        assert!(!wire.contains("\r\nX-Injected"));
        assert!(wire.contains("Content-Type: text/plainX-Injected: 1\r\n\r\n"));

        let part = Part::file("file", "a.txt", " text/plain\r\n", Vec::new());
        assert!(matches!(part, Part::File { ref content_type, .. } if content_type == "text/plain"));
        let blank = Part::file("file", "a.txt", "\r\n", Vec::new());
        assert!(matches!(blank, Part::File { ref content_type, .. } if content_type == DEFAULT_CONTENT_TYPE));
    }

    #[test]
    fn encoder_redraws_boundary_found_in_attachment() {
        let mut payload = b"prefix ".to_vec();
        payload.extend_from_slice(b"--collide\r\n");
        payload.extend_from_slice(b"collide");
        let message = MultipartMessage::new()
            .with(Part::text("file_name", "x.bin"))
            .with(Part::file("file", "x.bin", DEFAULT_CONTENT_TYPE, payload));

        let mut candidates = vec!["collide".to_string(), "fresh".to_string()].into_iter();
        let encoded = encode_with(&message, || candidates.next().unwrap());
        assert_eq!(encoded.boundary, "fresh");

        let decoded = decode(&encoded.body, &encoded.boundary).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn random_boundary_round_trips_attachment_containing_boundary_like_bytes() {
        let message = MultipartMessage::new().with(Part::file(
            "file",
            "f",
            DEFAULT_CONTENT_TYPE,
            b"----LarkgateBoundary\r\n--\r\n\r\n".to_vec(),
        ));
        let encoded = encode(&message);
        assert_eq!(decode(&encoded.body, &encoded.boundary).unwrap(), message);
    }

    #[test]
    fn content_type_without_boundary_is_malformed() {
        let err = decode_with_content_type(b"--x\r\n", "multipart/form-data").unwrap_err();
        assert!(matches!(err, LarkError::MalformedMultipart(_)));
        let err = decode_with_content_type(b"--x\r\n", "multipart/form-data; charset=utf-8")
            .unwrap_err();
        assert!(matches!(err, LarkError::MalformedMultipart(_)));
    }

    #[test]
    fn boundary_parameter_quoted_or_bare() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=abc123").unwrap(),
            "abc123"
        );
        assert_eq!(
            boundary_from_content_type("multipart/form-data; charset=utf-8; BOUNDARY=\"a;b c\"")
                .unwrap(),
            "a;b c"
        );
    }

    #[test]
    fn part_without_separator_is_malformed() {
        let body = b"--B\r\nContent-Disposition: form-data; name=\"a\"\r\nvalue\r\n--B--\r\n";
        let err = decode(body, "B").unwrap_err();
        assert!(matches!(err, LarkError::MalformedMultipart(ref m) if m.contains("separator")));
    }

    #[test]
    fn body_without_delimiter_is_malformed() {
        let err = decode(b"just some bytes", "B").unwrap_err();
        assert!(matches!(err, LarkError::MalformedMultipart(_)));
    }

    #[test]
    fn zero_length_attachment_is_present() {
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"empty.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            \r\n\
            --B--\r\n";
        let message = decode(body, "B").unwrap();
        let attachment = message.require_attachment().unwrap();
        assert_eq!(attachment.filename, "empty.txt");
        assert!(attachment.bytes.is_empty());
    }

    #[test]
    fn no_file_part_is_missing_upload() {
        let body = b"--B\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n--B--\r\n";
        let message = decode(body, "B").unwrap();
        assert_eq!(message.text("a"), Some("1"));
        assert!(matches!(
            message.require_attachment(),
            Err(LarkError::MissingUpload)
        ));
    }

    #[test]
    fn last_file_part_wins() {
        let message = MultipartMessage::new()
            .with(Part::file("file", "first.txt", "text/plain", b"1".to_vec()))
            .with(Part::file("file", "second.txt", "text/plain", b"2".to_vec()));
        let encoded = encode(&message);
        let decoded = decode(&encoded.body, &encoded.boundary).unwrap();
        assert_eq!(decoded.attachment().unwrap().filename, "second.txt");
        assert_eq!(decoded.attachment().unwrap().bytes, b"2");
    }

    #[test]
    fn missing_content_type_defaults_to_octet_stream() {
        let body = b"--B\r\nContent-Disposition: form-data; name=\"file\"; filename=\"x\"\r\n\r\nhi\r\n--B--\r\n";
        let message = decode(body, "B").unwrap();
        assert_eq!(message.attachment().unwrap().content_type, DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn preamble_and_epilogue_are_ignored() {
        let body = b"preamble\r\n--B\r\nContent-Disposition: form-data; name=\"k\"\r\n\r\nv\r\n--B--\r\nepilogue";
        let message = decode(body, "B").unwrap();
        assert_eq!(message.parts(), &[Part::text("k", "v")]);
    }

    #[test]
    fn unterminated_body_is_malformed() {
        let body = b"--B\r\nContent-Disposition: form-data; name=\"k\"\r\n\r\nv";
        assert!(matches!(
            decode(body, "B"),
            Err(LarkError::MalformedMultipart(_))
        ));
    }

    #[test]
    fn filename_attribute_does_not_shadow_name() {
        let body = b"--B\r\nContent-Disposition: form-data; filename=\"a.txt\"; name=\"upload\"\r\n\r\nx\r\n--B--\r\n";
        let message = decode(body, "B").unwrap();
        let attachment = message.attachment().unwrap();
        assert_eq!(attachment.name, "upload");
        assert_eq!(attachment.filename, "a.txt");
    }
}
