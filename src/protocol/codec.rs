//! Decoders for the numeric and string encodings used in response payloads.

/// Longest identity string a PSU is expected to report.
pub const MAX_BLOCK_STRING: usize = 32;

/// Decode a PMBus linear value: 5-bit two's-complement exponent in the top
/// bits, 11-bit two's-complement mantissa below, value = mantissa * 2^exponent.
pub fn decode_linear(raw: u16) -> f64 {
    let mut exponent = (raw >> 11) as i32;
    let mut mantissa = (raw & 0x07ff) as i32;

    if exponent > 0x0f {
        exponent -= 0x20;
    }
    if mantissa > 0x03ff {
        mantissa -= 0x0800;
    }

    mantissa as f64 * 2f64.powi(exponent)
}

/// Decode a linear value delivered as (low, high) bytes, rounded to the
/// nearest integer.
pub fn decode_linear_bytes(low: u8, high: u8) -> i32 {
    let raw = u16::from_le_bytes([low, high]);
    (decode_linear(raw) + 0.5).floor() as i32
}

pub fn u16_le(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Drawer presence arrives with one drawer on every other bit (0, 2, 4, 6).
/// Collapse it to one bit per drawer: 0b0101_0101 -> 0b1111.
pub fn squeeze_alternate_bits(raw: u8) -> u8 {
    (0..4).fold(0u8, |acc, i| acc | (((raw >> (i * 2)) & 1) << i))
}

/// Read a PMBus block string. A leading byte equal to the remaining length
/// is the block count and is dropped. Returns None for empty, oversized or
/// non-printable content.
pub fn block_string(data: &[u8]) -> Option<String> {
    let body = match data.split_first() {
        Some((&count, rest)) if count as usize == rest.len() => rest,
        _ => data,
    };

    let text: String = body
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end_matches(|c: char| c == '\0' || c == ' ')
        .to_string();

    if text.is_empty() || text.len() > MAX_BLOCK_STRING {
        return None;
    }
    if !text.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return None;
    }
    Some(text)
}

/// Space separated `0x..` rendering used in logs and ipmitool arguments.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("0x{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
