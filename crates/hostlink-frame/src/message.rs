use bytes::Bytes;

/// Wire type code: 32-bit signed integer.
pub const TYPE_INT32: u8 = 1;
/// Wire type code: 64-bit signed integer.
pub const TYPE_INT64: u8 = 2;
/// Wire type code: IEEE-754 double.
pub const TYPE_DOUBLE: u8 = 3;
/// Wire type code: UTF-8 string.
pub const TYPE_STRING: u8 = 4;
/// Wire type code: opaque bytes.
pub const TYPE_BYTES: u8 = 5;
/// Wire type code: nested message.
pub const TYPE_MESSAGE: u8 = 6;

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Bytes(Bytes),
    Message(Message),
}

impl Value {
    /// The wire type code for this value.
    pub fn type_code(&self) -> u8 {
        match self {
            Self::Int32(_) => TYPE_INT32,
            Self::Int64(_) => TYPE_INT64,
            Self::Double(_) => TYPE_DOUBLE,
            Self::String(_) => TYPE_STRING,
            Self::Bytes(_) => TYPE_BYTES,
            Self::Message(_) => TYPE_MESSAGE,
        }
    }

    /// Human-readable type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Message(_) => "message",
        }
    }

    /// Size of the encoded value, excluding the field header.
    pub(crate) fn encoded_len(&self) -> usize {
        match self {
            Self::Int32(_) => 4,
            Self::Int64(_) | Self::Double(_) => 8,
            Self::String(s) => s.len(),
            Self::Bytes(b) => b.len(),
            Self::Message(m) => m.encoded_len(),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(v))
    }
}

impl From<Message> for Value {
    fn from(v: Message) -> Self {
        Self::Message(v)
    }
}

/// One tagged field of a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub tag: u32,
    pub value: Value,
}

/// Per-field header on the wire: tag (4) + type (1) + value length (4).
pub(crate) const FIELD_HEADER_SIZE: usize = 9;
/// Per-message header on the wire: body length (4).
pub(crate) const MESSAGE_HEADER_SIZE: usize = 4;

/// An ordered sequence of tagged, typed fields.
///
/// Tags are unique: [`set`](Self::set) replaces an existing field in place
/// and keeps its position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    fields: Vec<Field>,
}

impl Message {
    /// An empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, tag: u32, value: impl Into<Value>) -> Self {
        self.set(tag, value);
        self
    }

    /// Set `tag` to `value`, returning the previous value if there was one.
    pub fn set(&mut self, tag: u32, value: impl Into<Value>) -> Option<Value> {
        let value = value.into();
        match self.fields.iter_mut().find(|f| f.tag == tag) {
            Some(field) => Some(std::mem::replace(&mut field.value, value)),
            None => {
                self.fields.push(Field { tag, value });
                None
            }
        }
    }

    /// Remove a field.
    pub fn remove(&mut self, tag: u32) -> Option<Value> {
        let idx = self.fields.iter().position(|f| f.tag == tag)?;
        Some(self.fields.remove(idx).value)
    }

    pub fn get(&self, tag: u32) -> Option<&Value> {
        self.fields.iter().find(|f| f.tag == tag).map(|f| &f.value)
    }

    pub fn contains(&self, tag: u32) -> bool {
        self.get(tag).is_some()
    }

    pub fn get_i32(&self, tag: u32) -> Option<i32> {
        match self.get(tag)? {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// Read an integer field, widening int32 values.
    pub fn get_i64(&self, tag: u32) -> Option<i64> {
        match self.get(tag)? {
            Value::Int64(v) => Some(*v),
            Value::Int32(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn get_f64(&self, tag: u32) -> Option<f64> {
        match self.get(tag)? {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, tag: u32) -> Option<&str> {
        match self.get(tag)? {
            Value::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_bytes(&self, tag: u32) -> Option<&Bytes> {
        match self.get(tag)? {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_message(&self, tag: u32) -> Option<&Message> {
        match self.get(tag)? {
            Value::Message(v) => Some(v),
            _ => None,
        }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Nesting depth: 1 for a flat message, +1 per level of nested message.
    pub fn depth(&self) -> usize {
        1 + self
            .fields
            .iter()
            .filter_map(|f| match &f.value {
                Value::Message(m) => Some(m.depth()),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Exact encoded size in bytes, including the message length prefix.
    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_SIZE
            + self
                .fields
                .iter()
                .map(|f| FIELD_HEADER_SIZE + f.value.encoded_len())
                .sum::<usize>()
    }

    pub(crate) fn from_fields(fields: Vec<Field>) -> Self {
        Self { fields }
    }
}

impl<'a> IntoIterator for &'a Message {
    type Item = &'a Field;
    type IntoIter = std::slice::Iter<'a, Field>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_in_place() {
        let mut msg = Message::new().with(1, "a").with(2, 7i32).with(3, 1.5f64);
        let prev = msg.set(2, "seven");

        assert_eq!(prev, Some(Value::Int32(7)));
        assert_eq!(msg.len(), 3);
        let tags: Vec<u32> = msg.iter().map(|f| f.tag).collect();
        assert_eq!(tags, vec![1, 2, 3]);
        assert_eq!(msg.get_str(2), Some("seven"));
    }

    #[test]
    fn typed_getters() {
        let inner = Message::new().with(1, "nested");
        let msg = Message::new()
            .with(1, 42i32)
            .with(2, 1i64 << 40)
            .with(3, 2.25f64)
            .with(4, "text")
            .with(5, vec![0u8, 1, 0])
            .with(6, inner.clone());

        assert_eq!(msg.get_i32(1), Some(42));
        assert_eq!(msg.get_i64(1), Some(42));
        assert_eq!(msg.get_i64(2), Some(1 << 40));
        assert_eq!(msg.get_f64(3), Some(2.25));
        assert_eq!(msg.get_str(4), Some("text"));
        assert_eq!(msg.get_bytes(5).map(|b| b.as_ref()), Some(&[0u8, 1, 0][..]));
        assert_eq!(msg.get_message(6), Some(&inner));
        assert_eq!(msg.get_str(1), None);
        assert_eq!(msg.get(99), None);
    }

    #[test]
    fn remove_field() {
        let mut msg = Message::new().with(1, "a").with(2, "b");
        assert_eq!(msg.remove(1), Some(Value::from("a")));
        assert_eq!(msg.remove(1), None);
        assert!(!msg.contains(1));
        assert_eq!(msg.len(), 1);
    }

    #[test]
    fn depth_counts_nesting() {
        assert_eq!(Message::new().depth(), 1);
        let two = Message::new().with(1, Message::new());
        assert_eq!(two.depth(), 2);
        let three = Message::new().with(1, "x").with(2, two.clone()).with(3, Message::new());
        assert_eq!(three.depth(), 3);
    }

    #[test]
    fn encoded_len_accounts_for_headers() {
        assert_eq!(Message::new().encoded_len(), 4);
        let msg = Message::new().with(1, "ping");
        assert_eq!(msg.encoded_len(), 4 + 9 + 4);
        let nested = Message::new().with(1, msg.clone());
        assert_eq!(nested.encoded_len(), 4 + 9 + msg.encoded_len());
    }
}
