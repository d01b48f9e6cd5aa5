//! RTSP codec: a custom line-oriented grammar, not standard RTSP.
//!
//! Moonlight's RTSP dialect uses bare `Key=Value` body lines (not SDP's
//! `a=key:value`), `streamid=` pseudo-targets, and tolerates trailing
//! garbage after the last payload line. This parser mirrors that grammar
//! exactly rather than reusing a conformant RTSP/SDP crate.

pub mod server;

use std::collections::BTreeMap;

/// One parsed RTSP frame, either a request or a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtspPacket {
    Request {
        command: String,
        target: RtspTarget,
        cseq: u32,
        options: BTreeMap<String, String>,
        payloads: Vec<(String, String)>,
    },
    Response {
        status_code: u32,
        message: String,
        cseq: u32,
        options: BTreeMap<String, String>,
        payloads: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtspTarget {
    /// `rtsp://<ip?>:<port>` — ip may be empty (AndroidTV clients).
    Uri { ip: String, port: u16 },
    /// `streamid=<type><params>` e.g. `streamid=audio/0/0`.
    Stream { stream_type: String, params: String },
    /// Literal `/`.
    None,
}

impl RtspTarget {
    fn parse(raw: &str) -> Option<RtspTarget> {
        if raw == "/" {
            return Some(RtspTarget::None);
        }
        if let Some(rest) = raw.strip_prefix("streamid=") {
            let (stream_type, params) = split_at_first(rest, &['/', '=']);
            return Some(RtspTarget::Stream {
                stream_type: stream_type.to_string(),
                params: params.to_string(),
            });
        }
        if let Some(rest) = raw.strip_prefix("rtsp://") {
            let (ip, port) = rest.rsplit_once(':')?;
            let port: u16 = port.parse().ok()?;
            return Some(RtspTarget::Uri {
                ip: ip.to_string(),
                port,
            });
        }
        None
    }

    fn render(&self) -> String {
        match self {
            RtspTarget::None => "/".to_string(),
            RtspTarget::Stream {
                stream_type,
                params,
            } => format!("streamid={stream_type}{params}"),
            RtspTarget::Uri { ip, port } => format!("rtsp://{ip}:{port}"),
        }
    }
}

fn split_at_first<'a>(s: &'a str, delims: &[char]) -> (&'a str, &'a str) {
    match s.find(|c| delims.contains(&c)) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, ""),
    }
}

/// Value characters a header value may contain, per spec grammar.
fn is_valid_header_value_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_./;=, :".contains(c)
}

/// Split a buffer into lines on CRLF or LF, preserving no terminator.
fn split_lines(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut rest = text;
    while let Some(idx) = rest.find('\n') {
        let mut line = &rest[..idx];
        if line.ends_with('\r') {
            line = &line[..line.len() - 1];
        }
        lines.push(line);
        rest = &rest[idx + 1..];
    }
    if !rest.is_empty() {
        lines.push(rest);
    }
    lines
}

/// Parse one RTSP frame. Returns `None` on grammar failure. Accepts
/// arbitrary trailing bytes after the last payload line.
pub fn parse(input: &str) -> Option<RtspPacket> {
    let lines = split_lines(input);
    let mut iter = lines.iter();
    let first = iter.next()?;

    let mut options = BTreeMap::new();
    let mut payloads = Vec::new();
    let mut cseq: Option<u32> = None;
    let mut in_body = false;

    for line in iter {
        if !in_body {
            if line.is_empty() {
                in_body = true;
                continue;
            }
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            let value = value.trim();
            if !value.chars().all(is_valid_header_value_char) {
                return None;
            }
            if key.eq_ignore_ascii_case("CSeq") {
                cseq = Some(value.parse().ok()?);
            } else {
                options.insert(key.to_string(), value.to_string());
            }
        } else {
            if line.is_empty() {
                continue;
            }
            match line.split_once('=') {
                Some((k, v)) => payloads.push((k.to_string(), v.to_string())),
                None => payloads.push((String::new(), line.to_string())),
            }
        }
    }

    let cseq = cseq?;

    if let Some(rest) = first.strip_prefix("RTSP/1.0 ") {
        let (code, message) = rest.split_once(' ')?;
        return Some(RtspPacket::Response {
            status_code: code.parse().ok()?,
            message: message.to_string(),
            cseq,
            options,
            payloads,
        });
    }

    let mut parts = first.splitn(3, ' ');
    let command = parts.next()?.to_string();
    let target_raw = parts.next()?;
    let version = parts.next()?;
    if version != "RTSP/1.0" {
        return None;
    }
    let target = RtspTarget::parse(target_raw)?;

    Some(RtspPacket::Request {
        command,
        target,
        cseq,
        options,
        payloads,
    })
}

/// Serialise a packet back into wire form. Inverse of `parse` for
/// well-formed packets.
pub fn serialise(packet: &RtspPacket) -> String {
    let mut out = String::new();
    match packet {
        RtspPacket::Request {
            command,
            target,
            cseq,
            options,
            payloads,
        } => {
            out.push_str(&format!("{command} {} RTSP/1.0\r\n", target.render()));
            out.push_str(&format!("CSeq: {cseq}\r\n"));
            write_options_and_payloads(&mut out, options, payloads);
        }
        RtspPacket::Response {
            status_code,
            message,
            cseq,
            options,
            payloads,
        } => {
            out.push_str(&format!("RTSP/1.0 {status_code} {message}\r\n"));
            out.push_str(&format!("CSeq: {cseq}\r\n"));
            write_options_and_payloads(&mut out, options, payloads);
        }
    }
    out
}

fn write_options_and_payloads(
    out: &mut String,
    options: &BTreeMap<String, String>,
    payloads: &[(String, String)],
) {
    for (k, v) in options {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str("\r\n");
    for (k, v) in payloads {
        if k.is_empty() {
            out.push_str(v);
        } else {
            out.push_str(&format!("{k}={v}"));
        }
        out.push_str("\r\n");
    }
}

/// Locate `Content-length` textually and report whether `buf` contains at
/// least header-length + declared content length bytes yet. Implements
/// the protocol-critical receive-buffering rule: ANNOUNCE frames routinely
/// exceed a single TCP read, so callers must keep reading until this
/// returns `true` (or there is no Content-length header, in which case a
/// blank-line-terminated read is sufficient).
pub fn has_complete_frame(buf: &[u8]) -> bool {
    let text = String::from_utf8_lossy(buf);
    let header_end = match text.find("\r\n\r\n").or_else(|| text.find("\n\n")) {
        Some(idx) => idx,
        None => return false,
    };
    let separator_len = if text[header_end..].starts_with("\r\n\r\n") {
        4
    } else {
        2
    };
    let header_section = &text[..header_end];
    let content_length = header_section
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("Content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    buf.len() >= header_end + separator_len + content_length
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_options() {
        let input = "OPTIONS rtsp://10.1.2.49:48010 RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let parsed = parse(input).expect("parseable");
        let serialised = serialise(&parsed);
        let reparsed = parse(&serialised).expect("reparseable");
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn round_trip_announce_with_payload() {
        let input =
            "ANNOUNCE streamid=video/0/0 RTSP/1.0\r\nCSeq: 5\r\n\r\na=bitStreamFormat:0\r\na=fec.minRequiredFecPackets:0\r\n";
        let parsed = parse(input).expect("parseable");
        let serialised = serialise(&parsed);
        let reparsed = parse(&serialised).expect("reparseable");
        assert_eq!(parsed, reparsed);
        if let RtspPacket::Request { payloads, .. } = parsed {
            assert_eq!(payloads.len(), 2);
            assert_eq!(payloads[0], ("a".into(), "bitStreamFormat:0".into()));
        } else {
            panic!("expected request");
        }
    }

    #[test]
    fn rejects_missing_cseq() {
        assert!(parse("OPTIONS / RTSP/1.0\r\n\r\n").is_none());
    }

    #[test]
    fn accepts_trailing_garbage() {
        let input = "OPTIONS / RTSP/1.0\r\nCSeq: 9\r\n\r\ngarbagegarbage";
        let parsed = parse(input).expect("should tolerate trailing bytes");
        if let RtspPacket::Request { payloads, .. } = parsed {
            assert_eq!(payloads, vec![(String::new(), "garbagegarbage".into())]);
        } else {
            panic!("expected request");
        }
    }

    #[test]
    fn setup_options_response() {
        let input = "SETUP streamid=video/0/0 RTSP/1.0\r\nCSeq: 4\r\nSession: DEADBEEFCAFE\r\n\r\n";
        let parsed = parse(input).unwrap();
        if let RtspPacket::Request {
            command, target, ..
        } = &parsed
        {
            assert_eq!(command, "SETUP");
            assert_eq!(
                target,
                &RtspTarget::Stream {
                    stream_type: "video".into(),
                    params: "/0/0".into()
                }
            );
        } else {
            panic!("expected request");
        }
    }

    #[test]
    fn content_length_buffering() {
        let partial = b"ANNOUNCE streamid=video/0/0 RTSP/1.0\r\nCSeq: 6\r\nContent-length: 20\r\n\r\nshort";
        assert!(!has_complete_frame(partial));
        let full = b"ANNOUNCE streamid=video/0/0 RTSP/1.0\r\nCSeq: 6\r\nContent-length: 5\r\n\r\nshort";
        assert!(has_complete_frame(full));
    }
}
