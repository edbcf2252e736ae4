//! STOMP 1.2 frame codec.
//!
//! Frames travel as WebSocket text messages, so bodies are kept as UTF-8
//! strings. A transport message may carry several frames, part of a frame,
//! or bare heart-beat EOLs; [`FrameDecoder`] handles all three.

use std::fmt;
use thiserror::Error;

/// STOMP frame command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Client frames
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    // Server frames
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Command> {
        Some(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED headers are never escaped (1.0 compatibility).
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("malformed header line '{0}'")]
    MalformedHeader(String),
    #[error("invalid escape sequence in '{0}'")]
    InvalidEscape(String),
    #[error("invalid content-length '{0}'")]
    InvalidContentLength(String),
    #[error("body of declared length not followed by NUL")]
    MissingNul,
    #[error("frame exceeds {0} bytes")]
    TooLarge(usize),
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order; repeated names are kept, the first one wins on lookup
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize to the wire format, NUL terminated.
    ///
    /// A `content-length` header is added for non-empty bodies unless one is
    /// already present.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());

        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            push_header_part(&mut out, name, escape);
            out.push(':');
            push_header_part(&mut out, value, escape);
            out.push('\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.command)?;
        for (k, v) in &self.headers {
            writeln!(f, "{}: {}", k, v)?;
        }
        write!(f, "Body ({} bytes)", self.body.len())
    }
}

fn push_header_part(out: &mut String, s: &str, escape: bool) {
    if !escape {
        out.push_str(s);
        return;
    }
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
}

fn unescape(s: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(s.to_string())),
        }
    }
    Ok(out)
}

/// Incremental decoder for inbound text.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: String,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: String::new(),
            max_frame_size,
        }
    }

    /// Append received text
    pub fn push(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
    }

    /// Bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, skipping heart-beat EOLs.
    ///
    /// Returns `Ok(None)` when more input is needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        self.skip_heartbeats();
        if self.buf.is_empty() {
            return Ok(None);
        }

        match self.parse()? {
            Some((_, consumed)) if consumed > self.max_frame_size => {
                Err(FrameError::TooLarge(self.max_frame_size))
            }
            Some((frame, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(frame))
            }
            None => {
                if self.buf.len() > self.max_frame_size {
                    return Err(FrameError::TooLarge(self.max_frame_size));
                }
                Ok(None)
            }
        }
    }

    fn skip_heartbeats(&mut self) {
        let mut skip = 0;
        let bytes = self.buf.as_bytes();
        loop {
            match bytes.get(skip) {
                Some(b'\n') => skip += 1,
                Some(b'\r') if bytes.get(skip + 1) == Some(&b'\n') => skip += 2,
                _ => break,
            }
        }
        if skip > 0 {
            self.buf.drain(..skip);
        }
    }

    fn parse(&self) -> Result<Option<(Frame, usize)>, FrameError> {
        let buf = self.buf.as_str();
        let mut pos = 0;
        let mut lines: Vec<&str> = Vec::new();

        // Command line and headers, up to the blank line
        loop {
            let Some(nl) = buf[pos..].find('\n') else {
                return Ok(None);
            };
            let raw = &buf[pos..pos + nl];
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            pos += nl + 1;
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }

        let command_line = lines.first().copied().unwrap_or_default();
        let command = Command::parse(command_line)
            .ok_or_else(|| FrameError::UnknownCommand(command_line.to_string()))?;

        let mut frame = Frame::new(command);
        for line in lines.iter().skip(1) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            let (name, value) = if command.escapes_headers() {
                (unescape(name)?, unescape(value)?)
            } else {
                (name.to_string(), value.to_string())
            };
            frame.headers.push((name, value));
        }

        let body_start = pos;
        let end = match frame.header("content-length") {
            Some(raw) => {
                let len: usize = raw
                    .trim()
                    .parse()
                    .map_err(|_| FrameError::InvalidContentLength(raw.to_string()))?;
                if len > self.max_frame_size {
                    return Err(FrameError::TooLarge(self.max_frame_size));
                }
                let body_end = body_start + len;
                if buf.len() <= body_end {
                    return Ok(None);
                }
                if buf.as_bytes()[body_end] != 0 || !buf.is_char_boundary(body_end) {
                    return Err(FrameError::MissingNul);
                }
                body_end
            }
            None => match buf[body_start..].find('\0') {
                Some(i) => body_start + i,
                None => return Ok(None),
            },
        };

        frame.body = buf[body_start..end].to_string();
        Ok(Some((frame, end + 1)))
    }
}
