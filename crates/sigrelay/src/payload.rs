use tungstenite::Message;

/// One opaque signaling message.
///
/// The relay never looks inside a payload; it only remembers whether it
/// arrived as a text or a binary frame so it leaves in the same shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// Arrived as a WebSocket text frame.
    Text(String),
    /// Arrived as a WebSocket binary frame.
    Binary(Vec<u8>),
}

impl Payload {
    /// Extract the payload from a data frame. Control frames yield `None`.
    #[must_use]
    pub fn from_message(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(Self::Text(text)),
            Message::Binary(data) => Some(Self::Binary(data)),
            _ => None,
        }
    }

    /// Size of the payload in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Returns `true` for a zero-length payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Message::Text(text),
            Payload::Binary(data) => Message::Binary(data),
        }
    }
}
