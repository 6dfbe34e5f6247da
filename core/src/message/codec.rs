// Message codec — compact length-prefixed binary form of a Message
//
// flags(1) timestamp(8) id(1+n) sender(1+n) content(2+n)
// [original_sender(1+n)] [recipient_nickname(1+n)] [sender_peer_id(1+n)]
// [mentions: count(1) then each (1+n)] [room(1+n)]
//
// Oversized strings are truncated silently (at a char boundary) rather than
// rejected. Changing that means a new format version.

use thiserror::Error;

use super::types::Message;

/// Bits of the leading flags byte
pub mod flags {
    pub const IS_RELAY: u8 = 0x01;
    pub const IS_PRIVATE: u8 = 0x02;
    pub const HAS_ORIGINAL_SENDER: u8 = 0x04;
    pub const HAS_RECIPIENT_NICKNAME: u8 = 0x08;
    pub const HAS_SENDER_PEER_ID: u8 = 0x10;
    pub const HAS_MENTIONS: u8 = 0x20;
    pub const HAS_ROOM: u8 = 0x40;
    pub const IS_ENCRYPTED: u8 = 0x80;
}

/// Longest string a 1-byte length prefix can describe
pub const MAX_SHORT_FIELD: usize = u8::MAX as usize;
/// Longest content a 2-byte length prefix can describe
pub const MAX_CONTENT: usize = u16::MAX as usize;
/// Most mentions a message carries
pub const MAX_MENTIONS: usize = u8::MAX as usize;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Message payload truncated while reading {field}")]
    Truncated { field: &'static str },

    #[error("Message field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
}

/// Serialize a message. Never fails: oversized fields are truncated.
pub fn encode_payload(msg: &Message) -> Vec<u8> {
    let mentions = msg.mentions.as_deref().filter(|m| !m.is_empty());

    let mut bits = 0u8;
    if msg.is_relay {
        bits |= flags::IS_RELAY;
    }
    if msg.is_private {
        bits |= flags::IS_PRIVATE;
    }
    if msg.original_sender.is_some() {
        bits |= flags::HAS_ORIGINAL_SENDER;
    }
    if msg.recipient_nickname.is_some() {
        bits |= flags::HAS_RECIPIENT_NICKNAME;
    }
    if msg.sender_peer_id.is_some() {
        bits |= flags::HAS_SENDER_PEER_ID;
    }
    if mentions.is_some() {
        bits |= flags::HAS_MENTIONS;
    }
    if msg.room.is_some() {
        bits |= flags::HAS_ROOM;
    }
    if msg.is_encrypted {
        bits |= flags::IS_ENCRYPTED;
    }

    let mut buf = Vec::with_capacity(64 + msg.content.len());
    buf.push(bits);
    buf.extend_from_slice(&msg.timestamp.to_be_bytes());
    put_short(&mut buf, &msg.id);
    put_short(&mut buf, &msg.sender);

    let content: &[u8] = if msg.is_encrypted {
        let ct = msg.encrypted_content.as_deref().unwrap_or(&[]);
        &ct[..ct.len().min(MAX_CONTENT)]
    } else {
        truncate_utf8(&msg.content, MAX_CONTENT).as_bytes()
    };
    buf.extend_from_slice(&(content.len() as u16).to_be_bytes());
    buf.extend_from_slice(content);

    if let Some(s) = &msg.original_sender {
        put_short(&mut buf, s);
    }
    if let Some(s) = &msg.recipient_nickname {
        put_short(&mut buf, s);
    }
    if let Some(s) = &msg.sender_peer_id {
        put_short(&mut buf, s);
    }
    if let Some(mentions) = mentions {
        let kept = &mentions[..mentions.len().min(MAX_MENTIONS)];
        buf.push(kept.len() as u8);
        for m in kept {
            put_short(&mut buf, m);
        }
    }
    if let Some(s) = &msg.room {
        put_short(&mut buf, s);
    }

    buf
}

/// Deserialize a message. Any underrun or invalid UTF-8 fails the whole
/// decode. `delivery_status` always comes back `None`.
pub fn decode_payload(data: &[u8]) -> Result<Message, PayloadError> {
    let mut r = Reader::new(data);

    let bits = r.u8("flags")?;
    let timestamp = r.u64("timestamp")?;
    let id = r.short_string("id")?;
    let sender = r.short_string("sender")?;

    let content_len = r.u16("content length")? as usize;
    let content_bytes = r.bytes(content_len, "content")?;
    let is_encrypted = bits & flags::IS_ENCRYPTED != 0;
    let (content, encrypted_content) = if is_encrypted {
        (String::new(), Some(content_bytes.to_vec()))
    } else {
        (utf8(content_bytes, "content")?, None)
    };

    let original_sender = r.short_string_if(bits & flags::HAS_ORIGINAL_SENDER, "original_sender")?;
    let recipient_nickname =
        r.short_string_if(bits & flags::HAS_RECIPIENT_NICKNAME, "recipient_nickname")?;
    let sender_peer_id = r.short_string_if(bits & flags::HAS_SENDER_PEER_ID, "sender_peer_id")?;

    let mentions = if bits & flags::HAS_MENTIONS != 0 {
        let count = r.u8("mention count")? as usize;
        let mut list = Vec::with_capacity(count);
        for _ in 0..count {
            list.push(r.short_string("mention")?);
        }
        Some(list)
    } else {
        None
    };

    let room = r.short_string_if(bits & flags::HAS_ROOM, "room")?;

    Ok(Message {
        id,
        sender,
        content,
        timestamp,
        is_relay: bits & flags::IS_RELAY != 0,
        original_sender,
        is_private: bits & flags::IS_PRIVATE != 0,
        recipient_nickname,
        sender_peer_id,
        mentions,
        room,
        is_encrypted,
        encrypted_content,
        delivery_status: None,
    })
}

fn put_short(buf: &mut Vec<u8>, s: &str) {
    let bytes = truncate_utf8(s, MAX_SHORT_FIELD).as_bytes();
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn utf8(bytes: &[u8], field: &'static str) -> Result<String, PayloadError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| PayloadError::InvalidUtf8 { field })
}

/// Bounds-checked cursor over the payload
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], PayloadError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(PayloadError::Truncated { field })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, PayloadError> {
        Ok(self.bytes(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, PayloadError> {
        let b = self.bytes(2, field)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, PayloadError> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.bytes(8, field)?);
        Ok(u64::from_be_bytes(out))
    }

    fn short_string(&mut self, field: &'static str) -> Result<String, PayloadError> {
        let len = self.u8(field)? as usize;
        utf8(self.bytes(len, field)?, field)
    }

    fn short_string_if(&mut self, flag: u8, field: &'static str) -> Result<Option<String>, PayloadError> {
        if flag == 0 {
            return Ok(None);
        }
        self.short_string(field).map(Some)
    }
}
