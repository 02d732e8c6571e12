//! Binary data helpers shared by the header, allocation tables and directory.
//!
//! Everything in a compound file is little-endian. Allocation table sectors
//! are reinterpreted in place as `[U32<LE>]` slices instead of being decoded
//! word by word.

use zerocopy::{FromBytes, LE, U16, U32};

/// Binary parsing error type
#[derive(Debug, Clone)]
pub enum BinaryError {
    /// Not enough data to read the requested type
    InsufficientData { expected: usize, available: usize },
    /// Failed to parse the data
    ParseError(String),
}

impl std::fmt::Display for BinaryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryError::InsufficientData {
                expected,
                available,
            } => {
                write!(
                    f,
                    "Insufficient data: expected {}, got {}",
                    expected, available
                )
            },
            BinaryError::ParseError(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for BinaryError {}

/// Result type for binary operations
pub type BinaryResult<T> = Result<T, BinaryError>;

/// Read a little-endian u16 from a byte slice at the given offset.
///
/// # Examples
///
/// ```
/// use olestore::common::binary::read_u16_le;
/// let data = [0x34, 0x12, 0x78, 0x56];
/// assert_eq!(read_u16_le(&data, 0).unwrap(), 0x1234);
/// assert_eq!(read_u16_le(&data, 2).unwrap(), 0x5678);
/// ```
#[inline]
pub fn read_u16_le(data: &[u8], offset: usize) -> BinaryResult<u16> {
    if offset + 2 > data.len() {
        return Err(BinaryError::InsufficientData {
            expected: offset + 2,
            available: data.len(),
        });
    }
    U16::<LE>::read_from_bytes(&data[offset..offset + 2])
        .map(|v| v.get())
        .map_err(|_| BinaryError::ParseError("Failed to read u16".to_string()))
}

/// Decode a whole sector (or any 4-byte aligned slice) as a table of u32 values.
///
/// # Examples
///
/// ```
/// use olestore::common::binary::read_u32_table;
/// let data = [1, 0, 0, 0, 0xFE, 0xFF, 0xFF, 0xFF];
/// assert_eq!(read_u32_table(&data).unwrap(), vec![1, 0xFFFFFFFE]);
/// ```
pub fn read_u32_table(data: &[u8]) -> BinaryResult<Vec<u32>> {
    let words = <[U32<LE>]>::ref_from_bytes(data).map_err(|_| {
        BinaryError::ParseError(format!(
            "Table length {} is not a multiple of 4",
            data.len()
        ))
    })?;
    Ok(words.iter().map(|w| w.get()).collect())
}

/// Encode u32 values into `out`, filling any remaining space with `fill`.
pub fn write_u32_table(values: &[u32], out: &mut [u8], fill: u32) {
    let fill = fill.to_le_bytes();
    for (i, chunk) in out.chunks_exact_mut(4).enumerate() {
        match values.get(i) {
            Some(value) => chunk.copy_from_slice(&value.to_le_bytes()),
            None => chunk.copy_from_slice(&fill),
        }
    }
}

/// Decode UTF-16LE bytes to a String, dropping a trailing terminator.
#[cfg(test)]
pub fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .collect();

    // Decode UTF-16 to String, replacing invalid sequences
    String::from_utf16_lossy(&units)
        .trim_end_matches('\0')
        .to_string()
}

/// Encode UTF-16 code units into the fixed 64-byte name field.
///
/// At most 31 units are stored so the terminator always fits.
pub fn encode_name_field(units: &[u16]) -> [u8; 64] {
    let mut field = [0u8; 64];
    for (i, unit) in units.iter().take(31).enumerate() {
        field[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
    }
    field
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bounds() {
        let data = [1u8, 2, 3];
        assert!(read_u16_le(&data, 2).is_err());
        assert_eq!(read_u16_le(&data, 1).unwrap(), 0x0302);
    }

    #[test]
    fn test_u32_table_fill() {
        let mut out = [0u8; 16];
        write_u32_table(&[7, 8], &mut out, 0xFFFF_FFFF);
        assert_eq!(
            read_u32_table(&out).unwrap(),
            vec![7, 8, 0xFFFF_FFFF, 0xFFFF_FFFF]
        );
        assert!(read_u32_table(&out[..6]).is_err());
    }

    #[test]
    fn test_name_field() {
        let units: Vec<u16> = "Root Entry".encode_utf16().collect();
        let field = encode_name_field(&units);
        assert_eq!(decode_utf16le(&field[..units.len() * 2 + 2]), "Root Entry");

        let long: Vec<u16> = std::iter::repeat_n(0x41, 40).collect();
        let field = encode_name_field(&long);
        assert_eq!(&field[62..64], &[0, 0]);
    }
}
