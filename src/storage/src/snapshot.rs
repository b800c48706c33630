use std::fmt;
use std::io::{self, Read};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteordered::byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use log::debug;

/// Snapshot binary format, the subset this server reads:
/// - 9-byte header: "REDIS" + 4-char version
/// - 0xFE: database selector, followed by a size-encoded database index
/// - 0xFB: resizedb hint, two size-encoded table sizes (consumed, ignored)
/// - 0xFD: expiry for the next entry, seconds as 4 LE bytes
/// - 0xFC: expiry for the next entry, milliseconds as 8 LE bytes
/// - 0x00: string entry, length-prefixed key then length-prefixed value
/// - 0xFF: end of file; the trailing checksum is not read

const HEADER_MAGIC: &[u8] = b"REDIS";
const HEADER_LEN: usize = 9;

const MARKER_DATABASE: u8 = 0xFE;
const MARKER_RESIZEDB: u8 = 0xFB;
const MARKER_EXPIRY_SECS: u8 = 0xFD;
const MARKER_EXPIRY_MILLIS: u8 = 0xFC;
const MARKER_STRING: u8 = 0x00;
const MARKER_END: u8 = 0xFF;

/// Smallest well-formed snapshot: header, end marker, zeroed checksum.
/// Serves as the full-resync payload of an empty database.
pub const EMPTY_SNAPSHOT: &[u8] = b"REDIS0011\xFF\x00\x00\x00\x00\x00\x00\x00\x00";

/// Error type for snapshot decoding.
#[derive(Debug)]
pub enum SnapshotError {
    BadHeader,
    UnsupportedValueType(u8),
    UnsupportedSizeEncoding(u8),
    Io(io::Error),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::BadHeader => write!(f, "invalid snapshot header"),
            SnapshotError::UnsupportedValueType(b) => {
                write!(f, "unsupported value type: 0x{:02x}", b)
            }
            SnapshotError::UnsupportedSizeEncoding(b) => {
                write!(f, "unsupported size encoding: 0x{:02x}", b)
            }
            SnapshotError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<io::Error> for SnapshotError {
    fn from(err: io::Error) -> Self {
        SnapshotError::Io(err)
    }
}

/// A key decoded from a snapshot, with its remaining TTL at load time.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: String,
    pub ttl: Option<Duration>,
}

/// Decode the string entries of a snapshot stream.
///
/// Entries whose absolute expiry already passed are dropped here rather than
/// inserted and lazily collected later.
pub fn load<R: Read>(reader: &mut R) -> Result<Vec<SnapshotEntry>, SnapshotError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    if !header.starts_with(HEADER_MAGIC) {
        return Err(SnapshotError::BadHeader);
    }

    let mut entries = Vec::new();
    let mut pending_expiry: Option<SystemTime> = None;

    loop {
        let marker = reader.read_u8()?;
        match marker {
            MARKER_DATABASE => {
                read_size(reader)?; // database index
            }
            MARKER_RESIZEDB => {
                read_size(reader)?; // hash table size
                read_size(reader)?; // expire table size
            }
            MARKER_EXPIRY_SECS => {
                let secs = reader.read_u32::<LittleEndian>()?;
                pending_expiry = Some(UNIX_EPOCH + Duration::from_secs(secs as u64));
            }
            MARKER_EXPIRY_MILLIS => {
                let millis = reader.read_u64::<LittleEndian>()?;
                pending_expiry = Some(UNIX_EPOCH + Duration::from_millis(millis));
            }
            MARKER_STRING => {
                let key = read_string(reader)?;
                let value = read_string(reader)?;
                // The captured expiry applies to this entry only.
                match pending_expiry.take() {
                    Some(expires_at) => match expires_at.duration_since(SystemTime::now()) {
                        Ok(ttl) => entries.push(SnapshotEntry {
                            key,
                            value,
                            ttl: Some(ttl),
                        }),
                        Err(_) => debug!("snapshot key {:?} already expired, skipping", key),
                    },
                    None => entries.push(SnapshotEntry {
                        key,
                        value,
                        ttl: None,
                    }),
                }
            }
            MARKER_END => break,
            other => return Err(SnapshotError::UnsupportedValueType(other)),
        }
    }

    Ok(entries)
}

/// Size encoding: the top two bits of the first byte select the width.
fn read_size<R: Read>(reader: &mut R) -> Result<u64, SnapshotError> {
    let b = reader.read_u8()?;
    match b >> 6 {
        0b00 => Ok((b & 0x3F) as u64),
        0b01 => {
            let next = reader.read_u8()?;
            Ok((((b & 0x3F) as u64) << 8) | next as u64)
        }
        0b10 => Ok(reader.read_u32::<BigEndian>()? as u64),
        _ => Err(SnapshotError::UnsupportedSizeEncoding(b)),
    }
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, SnapshotError> {
    let len = read_size(reader)?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}
