//! Entry name rules
//!
//! Siblings are ordered by name length in UTF-16 code units first, then
//! unit by unit after simple uppercasing. Two names that compare equal under
//! this order cannot live in the same storage.

use crate::common::{Error, Result};
use crate::ole::consts::MAX_NAME_LEN;
use std::cmp::Ordering;

/// Characters that may not appear in an entry name
const RESERVED_CHARS: [char; 4] = ['/', '\\', ':', '!'];

/// Validate a caller-supplied name and return its UTF-16 code units
pub(crate) fn validate_name(name: &str) -> Result<Vec<u16>> {
    if name.is_empty() {
        return Err(Error::InvalidName("name is empty".to_string()));
    }
    if let Some(c) = name.chars().find(|c| RESERVED_CHARS.contains(c)) {
        return Err(Error::InvalidName(format!(
            "{:?} contains reserved character {:?}",
            name, c
        )));
    }
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > MAX_NAME_LEN {
        return Err(Error::InvalidName(format!(
            "{:?} is {} UTF-16 units long, the limit is {}",
            name,
            units.len(),
            MAX_NAME_LEN
        )));
    }
    Ok(units)
}

/// Simple uppercase mapping of one UTF-16 code unit.
///
/// Surrogates and characters whose uppercase form is not a single BMP
/// character are left unchanged.
fn upcase(unit: u16) -> u16 {
    let Some(c) = char::from_u32(u32::from(unit)) else {
        return unit;
    };
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) => u16::try_from(u32::from(u)).unwrap_or(unit),
        _ => unit,
    }
}

/// Sibling order of two names given as UTF-16 code units
pub(crate) fn compare_names(a: &[u16], b: &[u16]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| {
        a.iter()
            .zip(b)
            .map(|(&x, &y)| upcase(x).cmp(&upcase(y)))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    })
}
