//! Binary codec for MatchSync messages
//!
//! Every payload = Kind (1 byte) + Version (1 byte) + Body.
//! All integers are little-endian. Keys and user ids are u16-length prefixed
//! UTF-8, free text and JSON payloads are u32-length prefixed, lists carry a
//! u32 count.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use matchsync_core::{
    SyncError, SyncResult, UserId, ValidationStatus, VarClass, VarId, VarKind, VarValue,
};

use crate::{
    Ack, Envelope, HandshakeRequest, HandshakeResponse, MessageKind, PresenceValue, RpcCall,
    SchemaEntry, SharedValue, SlotAssignment, Snapshot, SyncMessage, UserValue,
};

/// Current wire format version
pub const WIRE_VERSION: u8 = 1;

/// Kind byte + version byte
pub const MESSAGE_HEADER_SIZE: usize = 2;

/// Encodes into a growable buffer
pub trait WireEncode {
    fn encode(&self, w: &mut WireWriter) -> SyncResult<()>;
}

/// Decodes from a checked reader
pub trait WireDecode: Sized {
    fn decode(r: &mut WireReader<'_>) -> SyncResult<Self>;
}

/// Little-endian writer over `BytesMut`
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        WireWriter::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        WireWriter {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    #[inline]
    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    #[inline]
    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    #[inline]
    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    #[inline]
    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    #[inline]
    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    /// Short string (u16 length)
    pub fn put_key(&mut self, s: &str) -> SyncResult<()> {
        let len = u16::try_from(s.len()).map_err(|_| {
            SyncError::InvalidWireFormat(format!("Key too long: {} bytes", s.len()))
        })?;
        self.put_u16(len);
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    /// Long string (u32 length)
    pub fn put_text(&mut self, s: &str) -> SyncResult<()> {
        self.put_count(s.len())?;
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    pub fn put_count(&mut self, n: usize) -> SyncResult<()> {
        let n = u32::try_from(n)
            .map_err(|_| SyncError::InvalidWireFormat(format!("Length overflow: {}", n)))?;
        self.put_u32(n);
        Ok(())
    }

    pub fn put_user(&mut self, user: &UserId) -> SyncResult<()> {
        self.put_key(user.as_str())
    }

    pub fn put_opt_user(&mut self, user: Option<&UserId>) -> SyncResult<()> {
        match user {
            Some(user) => {
                self.put_u8(1);
                self.put_user(user)
            }
            None => {
                self.put_u8(0);
                Ok(())
            }
        }
    }

    pub fn put_var_id(&mut self, id: &VarId) -> SyncResult<()> {
        self.put_u8(id.class.to_byte());
        self.put_u8(id.kind.to_byte());
        self.put_key(&id.key)
    }

    #[inline]
    pub fn put_status(&mut self, status: ValidationStatus) {
        self.put_u8(status.to_byte());
    }

    pub fn put_value(&mut self, value: &VarValue) -> SyncResult<()> {
        self.put_u8(value.kind().to_byte());
        match value {
            VarValue::Bool(v) => self.put_u8(u8::from(*v)),
            VarValue::Int(v) => self.put_i64(*v),
            VarValue::Float(v) => self.put_f64(*v),
            VarValue::String(v) => self.put_text(v)?,
            VarValue::Object(v) => self.put_text(&v.to_string())?,
        }
        Ok(())
    }

    pub fn put_list<T: WireEncode>(&mut self, items: &[T]) -> SyncResult<()> {
        self.put_count(items.len())?;
        for item in items {
            item.encode(self)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Checked little-endian reader over a byte slice
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn ensure(&self, needed: usize) -> SyncResult<()> {
        if self.buf.remaining() < needed {
            return Err(SyncError::BufferTooShort {
                expected: needed,
                actual: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> SyncResult<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> SyncResult<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn get_u32(&mut self) -> SyncResult<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn get_u64(&mut self) -> SyncResult<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn get_i64(&mut self) -> SyncResult<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn get_f64(&mut self) -> SyncResult<f64> {
        self.ensure(8)?;
        Ok(self.buf.get_f64_le())
    }

    fn get_utf8(&mut self, len: usize) -> SyncResult<String> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        let s = std::str::from_utf8(head)
            .map_err(|e| SyncError::InvalidWireFormat(format!("Invalid UTF-8: {}", e)))?
            .to_string();
        self.buf = tail;
        Ok(s)
    }

    pub fn get_key(&mut self) -> SyncResult<String> {
        let len = self.get_u16()? as usize;
        self.get_utf8(len)
    }

    pub fn get_text(&mut self) -> SyncResult<String> {
        let len = self.get_u32()? as usize;
        self.get_utf8(len)
    }

    /// List count, bounded by the bytes left (every item is at least one byte)
    pub fn get_count(&mut self) -> SyncResult<usize> {
        let n = self.get_u32()? as usize;
        if n > self.remaining() {
            return Err(SyncError::InvalidWireFormat(format!(
                "List count {} exceeds remaining {} bytes",
                n,
                self.remaining()
            )));
        }
        Ok(n)
    }

    pub fn get_user(&mut self) -> SyncResult<UserId> {
        self.get_key().map(UserId)
    }

    pub fn get_opt_user(&mut self) -> SyncResult<Option<UserId>> {
        match self.get_u8()? {
            0 => Ok(None),
            1 => self.get_user().map(Some),
            b => Err(SyncError::InvalidWireFormat(format!("Invalid option tag: {}", b))),
        }
    }

    pub fn get_class(&mut self) -> SyncResult<VarClass> {
        let b = self.get_u8()?;
        VarClass::from_byte(b)
            .ok_or_else(|| SyncError::InvalidWireFormat(format!("Unknown variable class: {}", b)))
    }

    pub fn get_kind(&mut self) -> SyncResult<VarKind> {
        let b = self.get_u8()?;
        VarKind::from_byte(b)
            .ok_or_else(|| SyncError::InvalidWireFormat(format!("Unknown value kind: {}", b)))
    }

    pub fn get_var_id(&mut self) -> SyncResult<VarId> {
        let class = self.get_class()?;
        let kind = self.get_kind()?;
        let key = self.get_key()?;
        Ok(VarId::new(class, kind, key))
    }

    pub fn get_status(&mut self) -> SyncResult<ValidationStatus> {
        let b = self.get_u8()?;
        ValidationStatus::from_byte(b)
            .ok_or_else(|| SyncError::InvalidWireFormat(format!("Unknown validation status: {}", b)))
    }

    pub fn get_value(&mut self) -> SyncResult<VarValue> {
        let value = match self.get_kind()? {
            VarKind::Bool => match self.get_u8()? {
                0 => VarValue::Bool(false),
                1 => VarValue::Bool(true),
                b => {
                    return Err(SyncError::InvalidWireFormat(format!("Invalid bool: {}", b)));
                }
            },
            VarKind::Int => VarValue::Int(self.get_i64()?),
            VarKind::Float => VarValue::Float(self.get_f64()?),
            VarKind::String => VarValue::String(self.get_text()?),
            VarKind::Object => {
                let text = self.get_text()?;
                VarValue::Object(serde_json::from_str(&text)?)
            }
        };
        Ok(value)
    }

    pub fn get_list<T: WireDecode>(&mut self) -> SyncResult<Vec<T>> {
        let n = self.get_count()?;
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            items.push(T::decode(self)?);
        }
        Ok(items)
    }
}

impl WireEncode for SharedValue {
    fn encode(&self, w: &mut WireWriter) -> SyncResult<()> {
        w.put_key(&self.key)?;
        w.put_value(&self.value)?;
        w.put_u64(self.lock_version);
        w.put_status(self.status);
        Ok(())
    }
}

impl WireDecode for SharedValue {
    fn decode(r: &mut WireReader<'_>) -> SyncResult<Self> {
        Ok(SharedValue {
            key: r.get_key()?,
            value: r.get_value()?,
            lock_version: r.get_u64()?,
            status: r.get_status()?,
        })
    }
}

impl WireEncode for UserValue {
    fn encode(&self, w: &mut WireWriter) -> SyncResult<()> {
        w.put_key(&self.key)?;
        w.put_user(&self.user_id)?;
        w.put_value(&self.value)?;
        w.put_u64(self.lock_version);
        w.put_status(self.status);
        Ok(())
    }
}

impl WireDecode for UserValue {
    fn decode(r: &mut WireReader<'_>) -> SyncResult<Self> {
        Ok(UserValue {
            key: r.get_key()?,
            user_id: r.get_user()?,
            value: r.get_value()?,
            lock_version: r.get_u64()?,
            status: r.get_status()?,
        })
    }
}

impl WireEncode for PresenceValue {
    fn encode(&self, w: &mut WireWriter) -> SyncResult<()> {
        w.put_key(&self.collection)?;
        w.put_user(&self.user_id)?;
        w.put_value(&self.value)?;
        w.put_u64(self.lock_version);
        w.put_status(self.status);
        Ok(())
    }
}

impl WireDecode for PresenceValue {
    fn decode(r: &mut WireReader<'_>) -> SyncResult<Self> {
        Ok(PresenceValue {
            collection: r.get_key()?,
            user_id: r.get_user()?,
            value: r.get_value()?,
            lock_version: r.get_u64()?,
            status: r.get_status()?,
        })
    }
}

impl WireEncode for Ack {
    fn encode(&self, w: &mut WireWriter) -> SyncResult<()> {
        w.put_var_id(&self.id)?;
        w.put_opt_user(self.user_id.as_ref())?;
        w.put_u64(self.lock_version);
        Ok(())
    }
}

impl WireDecode for Ack {
    fn decode(r: &mut WireReader<'_>) -> SyncResult<Self> {
        Ok(Ack {
            id: r.get_var_id()?,
            user_id: r.get_opt_user()?,
            lock_version: r.get_u64()?,
        })
    }
}

impl WireEncode for Envelope {
    fn encode(&self, w: &mut WireWriter) -> SyncResult<()> {
        w.put_list(&self.shared)?;
        w.put_list(&self.user)?;
        w.put_list(&self.presence)?;
        w.put_list(&self.acks)
    }
}

impl WireDecode for Envelope {
    fn decode(r: &mut WireReader<'_>) -> SyncResult<Self> {
        Ok(Envelope {
            shared: r.get_list()?,
            user: r.get_list()?,
            presence: r.get_list()?,
            acks: r.get_list()?,
        })
    }
}

impl WireEncode for SchemaEntry {
    fn encode(&self, w: &mut WireWriter) -> SyncResult<()> {
        w.put_var_id(&self.id)?;
        w.put_u16(self.slots);
        Ok(())
    }
}

impl WireDecode for SchemaEntry {
    fn decode(r: &mut WireReader<'_>) -> SyncResult<Self> {
        Ok(SchemaEntry {
            id: r.get_var_id()?,
            slots: r.get_u16()?,
        })
    }
}

impl WireEncode for VarId {
    fn encode(&self, w: &mut WireWriter) -> SyncResult<()> {
        w.put_var_id(self)
    }
}

impl WireDecode for VarId {
    fn decode(r: &mut WireReader<'_>) -> SyncResult<Self> {
        r.get_var_id()
    }
}

impl WireEncode for SlotAssignment {
    fn encode(&self, w: &mut WireWriter) -> SyncResult<()> {
        w.put_var_id(&self.id)?;
        w.put_u16(self.slot);
        w.put_user(&self.user_id)
    }
}

impl WireDecode for SlotAssignment {
    fn decode(r: &mut WireReader<'_>) -> SyncResult<Self> {
        Ok(SlotAssignment {
            id: r.get_var_id()?,
            slot: r.get_u16()?,
            user_id: r.get_user()?,
        })
    }
}

impl WireEncode for HandshakeRequest {
    fn encode(&self, w: &mut WireWriter) -> SyncResult<()> {
        w.put_list(&self.schema)
    }
}

impl WireDecode for HandshakeRequest {
    fn decode(r: &mut WireReader<'_>) -> SyncResult<Self> {
        Ok(HandshakeRequest {
            schema: r.get_list()?,
        })
    }
}

const RESPONSE_ACCEPTED: u8 = 0x01;
const RESPONSE_REJECTED: u8 = 0x02;

impl WireEncode for HandshakeResponse {
    fn encode(&self, w: &mut WireWriter) -> SyncResult<()> {
        match self {
            HandshakeResponse::Accepted(snapshot) => {
                w.put_u8(RESPONSE_ACCEPTED);
                snapshot.values.encode(w)?;
                w.put_list(&snapshot.assignments)
            }
            HandshakeResponse::Rejected {
                missing,
                unexpected,
            } => {
                w.put_u8(RESPONSE_REJECTED);
                w.put_list(missing)?;
                w.put_list(unexpected)
            }
        }
    }
}

impl WireDecode for HandshakeResponse {
    fn decode(r: &mut WireReader<'_>) -> SyncResult<Self> {
        match r.get_u8()? {
            RESPONSE_ACCEPTED => Ok(HandshakeResponse::Accepted(Snapshot {
                values: Envelope::decode(r)?,
                assignments: r.get_list()?,
            })),
            RESPONSE_REJECTED => Ok(HandshakeResponse::Rejected {
                missing: r.get_list()?,
                unexpected: r.get_list()?,
            }),
            b => Err(SyncError::InvalidWireFormat(format!(
                "Unknown handshake verdict: {}",
                b
            ))),
        }
    }
}

impl WireEncode for RpcCall {
    fn encode(&self, w: &mut WireWriter) -> SyncResult<()> {
        w.put_key(&self.name)?;
        w.put_key(&self.target_object_id)?;
        let args = serde_json::to_string(&self.args)?;
        w.put_text(&args)
    }
}

impl WireDecode for RpcCall {
    fn decode(r: &mut WireReader<'_>) -> SyncResult<Self> {
        let name = r.get_key()?;
        let target_object_id = r.get_key()?;
        let args = serde_json::from_str(&r.get_text()?)?;
        Ok(RpcCall {
            name,
            target_object_id,
            args,
        })
    }
}

impl SyncMessage {
    /// Serialize with kind and version header
    pub fn to_bytes(&self) -> SyncResult<Bytes> {
        let mut w = WireWriter::with_capacity(64);
        w.put_u8(self.kind().to_byte());
        w.put_u8(WIRE_VERSION);
        match self {
            SyncMessage::Envelope(m) => m.encode(&mut w)?,
            SyncMessage::HandshakeRequest(m) => m.encode(&mut w)?,
            SyncMessage::HandshakeResponse(m) => m.encode(&mut w)?,
            SyncMessage::Rpc(m) => m.encode(&mut w)?,
        }
        Ok(w.finish())
    }

    /// Parse a complete payload; trailing bytes are an error
    pub fn from_bytes(buf: &[u8]) -> SyncResult<Self> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(SyncError::BufferTooShort {
                expected: MESSAGE_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let mut r = WireReader::new(buf);
        let kind_byte = r.get_u8()?;
        let kind = MessageKind::from_byte(kind_byte).ok_or(SyncError::UnknownMessageKind(kind_byte))?;
        let version = r.get_u8()?;
        if version != WIRE_VERSION {
            return Err(SyncError::InvalidWireFormat(format!(
                "Unsupported wire version: {}",
                version
            )));
        }

        let message = match kind {
            MessageKind::Envelope => SyncMessage::Envelope(Envelope::decode(&mut r)?),
            MessageKind::HandshakeRequest => {
                SyncMessage::HandshakeRequest(HandshakeRequest::decode(&mut r)?)
            }
            MessageKind::HandshakeResponse => {
                SyncMessage::HandshakeResponse(HandshakeResponse::decode(&mut r)?)
            }
            MessageKind::Rpc => SyncMessage::Rpc(RpcCall::decode(&mut r)?),
        };

        if !r.is_empty() {
            return Err(SyncError::InvalidWireFormat(format!(
                "{} trailing bytes",
                r.remaining()
            )));
        }

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_envelope() -> Envelope {
        Envelope {
            shared: vec![SharedValue {
                key: "ready".into(),
                value: VarValue::Bool(true),
                lock_version: 1,
                status: ValidationStatus::Validated,
            }],
            user: vec![UserValue {
                key: "score".into(),
                user_id: UserId::new("alice"),
                value: VarValue::Int(-42),
                lock_version: 7,
                status: ValidationStatus::Pending,
            }],
            presence: vec![PresenceValue {
                collection: "cursor".into(),
                user_id: UserId::new("bob"),
                value: VarValue::Object(serde_json::json!({ "x": 1.5, "y": 2 })),
                lock_version: 3,
                status: ValidationStatus::Validated,
            }],
            acks: vec![Ack::new(
                VarId::user(VarKind::Int, "score"),
                Some(UserId::new("alice")),
                7,
            )],
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let msg = SyncMessage::Envelope(sample_envelope());
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes[0], MessageKind::Envelope.to_byte());
        assert_eq!(bytes[1], WIRE_VERSION);
        assert_eq!(SyncMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_handshake_response_roundtrip() {
        let accepted = SyncMessage::HandshakeResponse(HandshakeResponse::Accepted(Snapshot {
            values: sample_envelope(),
            assignments: vec![SlotAssignment {
                id: VarId::presence(VarKind::Object, "cursor"),
                slot: 0,
                user_id: UserId::new("bob"),
            }],
        }));
        let bytes = accepted.to_bytes().unwrap();
        assert_eq!(SyncMessage::from_bytes(&bytes).unwrap(), accepted);

        let rejected = SyncMessage::HandshakeResponse(HandshakeResponse::Rejected {
            missing: vec![VarId::shared(VarKind::Bool, "B")],
            unexpected: vec![VarId::shared(VarKind::Bool, "C")],
        });
        let bytes = rejected.to_bytes().unwrap();
        assert_eq!(SyncMessage::from_bytes(&bytes).unwrap(), rejected);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let bytes = SyncMessage::Envelope(sample_envelope()).to_bytes().unwrap();
        let err = SyncMessage::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, SyncError::BufferTooShort { .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = SyncMessage::Envelope(Envelope::new()).to_bytes().unwrap().to_vec();
        bytes.push(0);
        assert!(matches!(
            SyncMessage::from_bytes(&bytes),
            Err(SyncError::InvalidWireFormat(_))
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert_eq!(
            SyncMessage::from_bytes(&[0x7F, WIRE_VERSION]),
            Err(SyncError::UnknownMessageKind(0x7F))
        );
    }

    #[test]
    fn test_oversized_key_rejected() {
        let env = Envelope {
            shared: vec![SharedValue {
                key: "k".repeat(70_000),
                value: VarValue::Bool(false),
                lock_version: 1,
                status: ValidationStatus::None,
            }],
            ..Envelope::default()
        };
        assert!(SyncMessage::Envelope(env).to_bytes().is_err());
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = SyncMessage::from_bytes(&data);
        }

        #[test]
        fn prop_huge_list_count_rejected(count in 1_000u32..u32::MAX) {
            let mut buf = vec![MessageKind::HandshakeRequest.to_byte(), WIRE_VERSION];
            buf.extend_from_slice(&count.to_le_bytes());
            prop_assert!(SyncMessage::from_bytes(&buf).is_err());
        }
    }
}
