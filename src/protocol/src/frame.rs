use std::fmt;
use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Wire format:
/// 1. `+<text>\r\n` - simple string
/// 2. `-ERR <text>\r\n` - error
/// 3. `:<decimal>\r\n` - integer
/// 4. `$<len>\r\n<len bytes>\r\n` - bulk string (`$-1\r\n` is the null bulk)
/// 5. `*<count>\r\n` - array of `count` bulk strings
///
/// Clients only ever send the array form; the other kinds appear in replies.

/// Error type for frame decoding.
#[derive(Debug)]
pub enum ProtocolError {
    /// The peer closed the connection, either at a frame boundary or mid-frame.
    Eof,
    /// The bytes on the wire do not form a valid frame.
    Invalid(String),
    Io(io::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Eof => write!(f, "connection closed"),
            ProtocolError::Invalid(msg) => write!(f, "invalid frame: {}", msg),
            ProtocolError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => ProtocolError::Eof,
            io::ErrorKind::InvalidData => {
                ProtocolError::Invalid("stream is not valid UTF-8".to_string())
            }
            _ => ProtocolError::Io(err),
        }
    }
}

pub fn encode_simple(s: &str) -> String {
    format!("+{}\r\n", s)
}

pub fn encode_error(msg: &str) -> String {
    format!("-ERR {}\r\n", msg)
}

pub fn encode_integer(i: i64) -> String {
    format!(":{}\r\n", i)
}

pub fn encode_bulk(s: &str) -> String {
    format!("${}\r\n{}\r\n", s.len(), s)
}

pub fn encode_null() -> String {
    "$-1\r\n".to_string()
}

/// Encode an argv as an array of bulk strings.
pub fn encode_array<S: AsRef<str>>(elements: &[S]) -> String {
    let mut out = format!("*{}\r\n", elements.len());
    for elem in elements {
        out.push_str(&encode_bulk(elem.as_ref()));
    }
    out
}

/// Read one CRLF-terminated line, without the terminator.
///
/// A clean close before any byte arrives is reported as [`ProtocolError::Eof`].
pub async fn read_line<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(ProtocolError::Eof);
    }
    Ok(line.trim_end().to_string())
}

/// Read one top-level array frame and return its elements.
///
/// A blank line decodes to an empty argv, which callers reject at the
/// command layer. Anything else that is not an array of bulk strings is a
/// protocol error and the caller must close the connection.
pub async fn parse<R>(reader: &mut R) -> Result<Vec<String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    if line.is_empty() {
        return Ok(Vec::new());
    }

    let count: usize = line
        .strip_prefix('*')
        .ok_or_else(|| ProtocolError::Invalid(format!("expected array frame, got {:?}", line)))?
        .parse()
        .map_err(|_| ProtocolError::Invalid(format!("invalid element count in {:?}", line)))?;

    let mut argv = Vec::with_capacity(count);
    for _ in 0..count {
        let header = read_line(reader).await?;
        let len: usize = header
            .strip_prefix('$')
            .ok_or_else(|| {
                ProtocolError::Invalid(format!("expected bulk string, got {:?}", header))
            })?
            .parse()
            .map_err(|_| ProtocolError::Invalid(format!("invalid bulk length in {:?}", header)))?;

        let mut buf = vec![0u8; len + 2];
        reader.read_exact(&mut buf).await?;
        if &buf[len..] != b"\r\n" {
            return Err(ProtocolError::Invalid(
                "bulk string not terminated by CRLF".to_string(),
            ));
        }
        buf.truncate(len);
        let elem = String::from_utf8(buf)
            .map_err(|_| ProtocolError::Invalid("bulk string is not valid UTF-8".to_string()))?;
        argv.push(elem);
    }

    Ok(argv)
}

/// Read a bulk payload of the form `$<len>\r\n<len bytes>` with no trailing
/// CRLF. The full-resync snapshot transfer is the only frame shaped this way.
pub async fn read_bulk_bytes<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let header = read_line(reader).await?;
    let len: usize = header
        .strip_prefix('$')
        .ok_or_else(|| {
            ProtocolError::Invalid(format!("expected bulk payload header, got {:?}", header))
        })?
        .parse()
        .map_err(|_| ProtocolError::Invalid(format!("invalid payload length in {:?}", header)))?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}
