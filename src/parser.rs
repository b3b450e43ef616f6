// Slice-based STOMP frame parser (produces owned Vecs from input slices)

/// A frame as it appears on the wire: raw command and header bytes (header
/// names and values still escaped) plus the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub command: Vec<u8>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Vec<u8>,
    /// Number of input bytes the frame occupied, including the NUL
    /// terminator. EOLs after the NUL are left for the codec, which reads
    /// them as heartbeats.
    pub consumed: usize,
}

type ParseResult = Result<Option<RawFrame>, String>;

/// Extract the optional content-length header value from a header list.
///
/// Returns:
/// - Ok(Some(n)) when a valid Content-Length header is present and parsed.
/// - Ok(None) when no Content-Length header is present.
/// - Err(String) when Content-Length is present but not a valid unsigned integer.
fn get_content_length(headers: &[(Vec<u8>, Vec<u8>)]) -> Result<Option<usize>, String> {
    // first occurrence wins, like every other header
    let Some((_, v)) = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(&b"content-length"[..]))
    else {
        return Ok(None);
    };
    let s = std::str::from_utf8(v).map_err(|e| format!("content-length not utf8: {}", e))?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err("empty content-length".to_string());
    }
    trimmed
        .parse::<usize>()
        .map(Some)
        .map_err(|e| format!("invalid content-length '{}': {}", trimmed, e))
}

/// Strip a trailing CR so CRLF line endings are accepted.
fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// Parse a single STOMP frame from a raw byte slice.
///
/// The slice must start at a frame boundary (heartbeat EOLs are handled by
/// the codec before calling this). Returns `Ok(Some(frame))` when a full
/// frame was parsed, `Ok(None)` when more bytes are required and `Err` on
/// protocol errors.
pub fn parse_frame_slice(input: &[u8]) -> ParseResult {
    let len = input.len();

    // command line
    let Some(cmd_end) = input.iter().position(|&b| b == b'\n') else {
        // A NUL before any EOL means a frame with no command at all.
        if input.contains(&0) {
            return Err("frame without command line".to_string());
        }
        return Ok(None);
    };
    let command = trim_cr(&input[..cmd_end]).to_vec();
    if command.is_empty() {
        return Err("empty command".to_string());
    }
    if command.contains(&0) {
        return Err("NUL byte in command line".to_string());
    }
    let mut pos = cmd_end + 1;

    // headers until a blank line
    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    loop {
        if pos >= len {
            return Ok(None);
        }
        let line_end_rel = match input[pos..].iter().position(|&b| b == b'\n') {
            Some(i) => i,
            None => return Ok(None),
        };
        let line = trim_cr(&input[pos..pos + line_end_rel]);
        pos += line_end_rel + 1;
        if line.is_empty() {
            break;
        }
        match line.iter().position(|&b| b == b':') {
            Some(colon) => headers.push((line[..colon].to_vec(), line[colon + 1..].to_vec())),
            None => {
                return Err(format!(
                    "malformed header line: {:?}",
                    String::from_utf8_lossy(line)
                ));
            }
        }
    }

    // body
    match get_content_length(&headers)? {
        Some(content_len) => {
            // need content_len bytes plus the terminating NUL
            if pos + content_len + 1 > len {
                return Ok(None);
            }
            let body = input[pos..pos + content_len].to_vec();
            pos += content_len;
            if input[pos] != 0 {
                return Err("missing NUL terminator after content-length body".to_string());
            }
            Ok(Some(RawFrame {
                command,
                headers,
                body,
                consumed: pos + 1,
            }))
        }
        None => match input[pos..].iter().position(|&b| b == 0) {
            Some(nul_rel) => {
                let body = input[pos..pos + nul_rel].to_vec();
                Ok(Some(RawFrame {
                    command,
                    headers,
                    body,
                    consumed: pos + nul_rel + 1,
                }))
            }
            None => Ok(None),
        },
    }
}

/// Undo STOMP 1.2 header escaping (`\r`, `\n`, `\c`, `\\`).
///
/// Any other escape sequence, or a trailing lone backslash, is a protocol
/// error.
pub fn unescape_header_value(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'r') => out.push(b'\r'),
            Some(b'n') => out.push(b'\n'),
            Some(b'c') => out.push(b':'),
            Some(b'\\') => out.push(b'\\'),
            Some(&other) => {
                return Err(format!("invalid escape sequence '\\{}'", other as char));
            }
            None => return Err("incomplete escape sequence at end of header".to_string()),
        }
    }
    Ok(out)
}

/// Escape a header name or value for wire transmission.
///
/// backslash, carriage return, line feed and colon are escaped.
pub fn escape_header_value(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}
