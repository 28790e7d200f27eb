//! Confluent wire format: `[0x00][schema id: u32 BE][avro datum]`.

use bridge_api::BridgeError;

pub const MAGIC_BYTE: u8 = 0x00;
pub const HEADER_LEN: usize = 5;

/// Добавить заголовок к Avro datum.
pub fn frame(schema_id: u32, datum: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + datum.len());
    out.push(MAGIC_BYTE);
    out.extend_from_slice(&schema_id.to_be_bytes());
    out.extend_from_slice(datum);
    out
}

/// Разобрать заголовок: (schema id, datum).
pub fn split(bytes: &[u8]) -> Result<(u32, &[u8]), BridgeError> {
    if bytes.len() < HEADER_LEN {
        return Err(BridgeError::malformed(format!(
            "avro frame truncated: {} bytes, header needs {HEADER_LEN}",
            bytes.len()
        )));
    }
    if bytes[0] != MAGIC_BYTE {
        return Err(BridgeError::malformed(format!("unknown magic byte 0x{:02x}", bytes[0])));
    }
    let id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Ok((id, &bytes[HEADER_LEN..]))
}
