//! Fixed-size records carried as opaque bytes

use super::wire::ProtocolError;

/// A value with a fixed-size, native byte order encoding
///
/// The queen never looks inside a record; this trait only exists so callers
/// can turn their own task and result types into the byte blobs the wire
/// carries.
pub trait Record: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Append exactly `SIZE` bytes to `buf`.
    fn write_to(&self, buf: &mut Vec<u8>);

    /// Decode from exactly `SIZE` bytes.
    fn read_from(bytes: &[u8]) -> Result<Self, ProtocolError>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut buf);
        buf
    }
}

/// Encode records back to back, the layout `Queen::run` expects for tasks.
pub fn encode_all<R: Record>(records: &[R]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(R::SIZE * records.len());
    for record in records {
        record.write_to(&mut buf);
    }
    buf
}

pub(crate) fn check_size(expected: usize, bytes: &[u8]) -> Result<(), ProtocolError> {
    if bytes.len() != expected {
        return Err(ProtocolError::RecordSize {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

impl Record for f64 {
    const SIZE: usize = std::mem::size_of::<f64>();

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_ne_bytes());
    }

    fn read_from(bytes: &[u8]) -> Result<Self, ProtocolError> {
        check_size(Self::SIZE, bytes)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_ne_bytes(raw))
    }
}
