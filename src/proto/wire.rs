//! Exact-byte field transfers
//!
//! ```text
//! Queen                           Drone
//!   |<------- cores (i32) ---------|
//!   |-------- task record -------->|
//!   |<--- len (usize) + result ----|
//!   |-------- sentinel (0) ------->|
//! ```
//!
//! A transfer that moves fewer bytes than its field declares is a
//! [`ProtocolError`], never a retry.

use std::fmt;
use std::io::{self, Read, Write};
use std::mem;

use thiserror::Error;

/// Size of the core count field.
pub const CORE_COUNT_LEN: usize = mem::size_of::<i32>();

/// Size of the result length prefix and of the end-of-work sentinel.
pub const LEN_FIELD_LEN: usize = mem::size_of::<usize>();

/// Wire field being transferred, used for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    CoreCount,
    Task,
    ResultLen,
    Result,
    Sentinel,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::CoreCount => "core count",
            Field::Task => "task record",
            Field::ResultLen => "result length",
            Field::Result => "result record",
            Field::Sentinel => "end-of-work sentinel",
        };
        f.write_str(name)
    }
}

/// Wire protocol violation
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("short read of {field}: got {actual} of {expected} bytes")]
    ShortRead {
        field: Field,
        expected: usize,
        actual: usize,
    },
    #[error("short write of {field}: wrote {actual} of {expected} bytes")]
    ShortWrite {
        field: Field,
        expected: usize,
        actual: usize,
    },
    #[error("I/O error on {field}: {source}")]
    Io {
        field: Field,
        #[source]
        source: io::Error,
    },
    #[error("declared result length {declared} exceeds limit of {limit} bytes")]
    ResultTooLarge { declared: usize, limit: usize },
    #[error("unexpected sentinel value {0}")]
    BadSentinel(usize),
    #[error("record size mismatch: expected {expected} bytes, got {actual}")]
    RecordSize { expected: usize, actual: usize },
}

impl ProtocolError {
    /// Whether the failure came from a socket timeout rather than the peer
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io { source, .. }
                if matches!(source.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

/// How the queen ended a drone's session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Sentinel received before the close.
    Graceful,
    /// Connection closed without a sentinel.
    Abrupt,
}

/// Read until `buf` is full or the peer closes. Returns the byte count.
fn fill<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Write until `buf` is drained or the peer stops accepting bytes.
fn drain<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

pub fn read_exact<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    field: Field,
) -> Result<(), ProtocolError> {
    let actual = fill(reader, buf).map_err(|source| ProtocolError::Io { field, source })?;
    if actual != buf.len() {
        return Err(ProtocolError::ShortRead {
            field,
            expected: buf.len(),
            actual,
        });
    }
    Ok(())
}

pub fn write_exact<W: Write + ?Sized>(
    writer: &mut W,
    buf: &[u8],
    field: Field,
) -> Result<(), ProtocolError> {
    let actual = drain(writer, buf).map_err(|source| ProtocolError::Io { field, source })?;
    if actual != buf.len() {
        return Err(ProtocolError::ShortWrite {
            field,
            expected: buf.len(),
            actual,
        });
    }
    Ok(())
}

pub fn write_core_count<W: Write + ?Sized>(writer: &mut W, cores: i32) -> Result<(), ProtocolError> {
    write_exact(writer, &cores.to_ne_bytes(), Field::CoreCount)
}

pub fn read_core_count<R: Read + ?Sized>(reader: &mut R) -> Result<i32, ProtocolError> {
    let mut buf = [0u8; CORE_COUNT_LEN];
    read_exact(reader, &mut buf, Field::CoreCount)?;
    Ok(i32::from_ne_bytes(buf))
}

/// Send a length-prefixed result record.
pub fn write_result<W: Write + ?Sized>(writer: &mut W, result: &[u8]) -> Result<(), ProtocolError> {
    write_exact(writer, &result.len().to_ne_bytes(), Field::ResultLen)?;
    write_exact(writer, result, Field::Result)
}

/// Receive a length-prefixed result record, appending it to `out`.
///
/// Returns the record length. `out` is left untouched on failure.
pub fn read_result<R: Read + ?Sized>(
    reader: &mut R,
    out: &mut Vec<u8>,
    limit: usize,
) -> Result<usize, ProtocolError> {
    let mut len_buf = [0u8; LEN_FIELD_LEN];
    read_exact(reader, &mut len_buf, Field::ResultLen)?;
    let declared = usize::from_ne_bytes(len_buf);
    if declared > limit {
        return Err(ProtocolError::ResultTooLarge { declared, limit });
    }

    let start = out.len();
    out.resize(start + declared, 0);
    if let Err(e) = read_exact(reader, &mut out[start..], Field::Result) {
        out.truncate(start);
        return Err(e);
    }
    Ok(declared)
}

pub fn write_sentinel<W: Write + ?Sized>(writer: &mut W) -> Result<(), ProtocolError> {
    write_exact(writer, &0usize.to_ne_bytes(), Field::Sentinel)
}

/// Wait for the end-of-work sentinel.
///
/// A clean close before any sentinel byte is an abrupt release; a partial or
/// non-zero sentinel is a protocol error.
pub fn read_sentinel<R: Read + ?Sized>(reader: &mut R) -> Result<Release, ProtocolError> {
    let mut buf = [0u8; LEN_FIELD_LEN];
    let field = Field::Sentinel;
    let actual = match fill(reader, &mut buf) {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(Release::Abrupt),
        Err(source) => return Err(ProtocolError::Io { field, source }),
    };
    match actual {
        0 => Ok(Release::Abrupt),
        LEN_FIELD_LEN => match usize::from_ne_bytes(buf) {
            0 => Ok(Release::Graceful),
            other => Err(ProtocolError::BadSentinel(other)),
        },
        _ => Err(ProtocolError::ShortRead {
            field,
            expected: LEN_FIELD_LEN,
            actual,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Writer that accepts at most `cap` bytes in total
    struct Capped {
        buf: Vec<u8>,
        cap: usize,
    }

    impl Write for Capped {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            let n = data.len().min(self.cap - self.buf.len());
            self.buf.extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_core_count_short_read() {
        let mut reader = Cursor::new(vec![2u8, 0]);
        match read_core_count(&mut reader) {
            Err(ProtocolError::ShortRead { field, expected, actual }) => {
                assert_eq!(field, Field::CoreCount);
                assert_eq!(expected, CORE_COUNT_LEN);
                assert_eq!(actual, 2);
            }
            other => panic!("expected short read, got {:?}", other),
        }
    }

    #[test]
    fn test_result_declared_longer_than_payload() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&16usize.to_ne_bytes());
        wire.extend_from_slice(&1.5f64.to_ne_bytes());

        let mut out = vec![0xAA];
        let err = read_result(&mut Cursor::new(wire), &mut out, 1024).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortRead { field: Field::Result, expected: 16, actual: 8 }
        ));
        // nothing from the failed record leaks into the output
        assert_eq!(out, vec![0xAA]);
    }

    #[test]
    fn test_result_length_limit() {
        let mut wire = Cursor::new(usize::MAX.to_ne_bytes().to_vec());
        let err = read_result(&mut wire, &mut Vec::new(), 64).unwrap_err();
        assert!(matches!(err, ProtocolError::ResultTooLarge { limit: 64, .. }));
    }

    #[test]
    fn test_result_appends_in_order() {
        let mut wire = Vec::new();
        write_result(&mut wire, b"abc").unwrap();
        write_result(&mut wire, b"").unwrap();
        write_result(&mut wire, b"de").unwrap();

        let mut reader = Cursor::new(wire);
        let mut out = Vec::new();
        assert_eq!(read_result(&mut reader, &mut out, 16).unwrap(), 3);
        assert_eq!(read_result(&mut reader, &mut out, 16).unwrap(), 0);
        assert_eq!(read_result(&mut reader, &mut out, 16).unwrap(), 2);
        assert_eq!(out, b"abcde");
    }

    #[test]
    fn test_short_write_reported() {
        let mut writer = Capped { buf: Vec::new(), cap: 10 };
        let err = write_result(&mut writer, &[7u8; 8]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortWrite { field: Field::Result, expected: 8, actual: 2 }
        ));
    }

    #[test]
    fn test_sentinel_variants() {
        let mut graceful = Vec::new();
        write_sentinel(&mut graceful).unwrap();
        assert_eq!(read_sentinel(&mut Cursor::new(graceful)).unwrap(), Release::Graceful);

        assert_eq!(read_sentinel(&mut Cursor::new(Vec::new())).unwrap(), Release::Abrupt);

        let bad = Cursor::new(3usize.to_ne_bytes().to_vec());
        assert!(matches!(read_sentinel(&mut bad.clone()), Err(ProtocolError::BadSentinel(3))));

        let torn = Cursor::new(vec![0u8; 3]);
        assert!(matches!(
            read_sentinel(&mut torn.clone()),
            Err(ProtocolError::ShortRead { field: Field::Sentinel, .. })
        ));
    }
}
