// Packet codec — Packet <-> wire bytes
//
// Decode is all-or-nothing: the frame's declared lengths must account for
// every byte of the buffer, otherwise the packet is rejected outright.

use super::compress;
use super::packet::{flags, Packet, PeerId};
use super::{
    WireError, HEADER_SIZE, MAX_PAYLOAD, PROTOCOL_VERSION, RECIPIENT_ID_SIZE, SENDER_ID_SIZE,
    SIGNATURE_SIZE,
};

/// Size of the original-length prefix in a compressed payload
const ORIGINAL_SIZE_PREFIX: usize = 2;

/// Serialize a packet to wire bytes, compressing the payload when the
/// heuristic says it is worth it and compression actually shrinks it.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, WireError> {
    if packet.payload.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(packet.payload.len()));
    }

    let compressed = if compress::should_compress(&packet.payload) {
        compress::compress(&packet.payload)
            .filter(|c| c.len() + ORIGINAL_SIZE_PREFIX <= MAX_PAYLOAD)
    } else {
        None
    };

    let mut header_flags = packet.flags();
    let wire_payload_len = match &compressed {
        Some(c) => {
            header_flags |= flags::IS_COMPRESSED;
            c.len() + ORIGINAL_SIZE_PREFIX
        }
        None => packet.payload.len(),
    };

    let mut buf = Vec::with_capacity(
        HEADER_SIZE + SENDER_ID_SIZE + RECIPIENT_ID_SIZE + wire_payload_len + SIGNATURE_SIZE,
    );

    // Header (14 bytes)
    buf.push(packet.version);
    buf.push(packet.packet_type);
    buf.push(packet.ttl);
    buf.extend_from_slice(&packet.timestamp.to_be_bytes());
    buf.push(header_flags);
    buf.extend_from_slice(&(wire_payload_len as u16).to_be_bytes());

    // Addressing
    buf.extend_from_slice(packet.sender_id.as_bytes());
    if let Some(recipient) = &packet.recipient_id {
        buf.extend_from_slice(recipient.as_bytes());
    }

    // Payload
    match &compressed {
        Some(c) => {
            buf.extend_from_slice(&(packet.payload.len() as u16).to_be_bytes());
            buf.extend_from_slice(c);
        }
        None => buf.extend_from_slice(&packet.payload),
    }

    if let Some(signature) = &packet.signature {
        buf.extend_from_slice(signature);
    }

    Ok(buf)
}

/// Deserialize wire bytes into a packet.
///
/// Returns error if:
/// - Buffer shorter than header + sender ID
/// - Version is not 1
/// - Declared lengths do not match the buffer exactly
/// - Compressed payload lacks its size prefix, fails to inflate, or
///   inflates to anything but the declared original size
pub fn decode(data: &[u8]) -> Result<Packet, WireError> {
    let fixed = HEADER_SIZE + SENDER_ID_SIZE;
    if data.len() < fixed {
        return Err(WireError::BufferTooShort {
            need: fixed,
            got: data.len(),
        });
    }

    let mut offset = 0;

    let version = data[offset];
    offset += 1;
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }

    let packet_type = data[offset];
    offset += 1;

    let ttl = data[offset];
    offset += 1;

    let mut ts = [0u8; 8];
    ts.copy_from_slice(&data[offset..offset + 8]);
    let timestamp = u64::from_be_bytes(ts);
    offset += 8;

    let header_flags = data[offset];
    offset += 1;
    let has_recipient = header_flags & flags::HAS_RECIPIENT != 0;
    let has_signature = header_flags & flags::HAS_SIGNATURE != 0;
    let is_compressed = header_flags & flags::IS_COMPRESSED != 0;

    let payload_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
    offset += 2;

    let mut declared = fixed + payload_len;
    if has_recipient {
        declared += RECIPIENT_ID_SIZE;
    }
    if has_signature {
        declared += SIGNATURE_SIZE;
    }
    if data.len() != declared {
        return Err(WireError::LengthMismatch {
            declared,
            actual: data.len(),
        });
    }

    let sender_id = PeerId::from_slice_lossy(&data[offset..offset + SENDER_ID_SIZE]);
    offset += SENDER_ID_SIZE;

    let recipient_id = if has_recipient {
        let id = PeerId::from_slice_lossy(&data[offset..offset + RECIPIENT_ID_SIZE]);
        offset += RECIPIENT_ID_SIZE;
        Some(id)
    } else {
        None
    };

    let wire_payload = &data[offset..offset + payload_len];
    offset += payload_len;

    let payload = if is_compressed {
        if wire_payload.len() < ORIGINAL_SIZE_PREFIX {
            return Err(WireError::MissingSizePrefix);
        }
        let original_size = u16::from_be_bytes([wire_payload[0], wire_payload[1]]) as usize;
        compress::decompress(&wire_payload[ORIGINAL_SIZE_PREFIX..], original_size)?
    } else {
        wire_payload.to_vec()
    };

    let signature = if has_signature {
        let mut sig = [0u8; SIGNATURE_SIZE];
        sig.copy_from_slice(&data[offset..offset + SIGNATURE_SIZE]);
        Some(sig)
    } else {
        None
    };

    Ok(Packet {
        version,
        packet_type,
        ttl,
        timestamp,
        sender_id,
        recipient_id,
        payload,
        signature,
    })
}
