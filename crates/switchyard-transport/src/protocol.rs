//! JSON frame codec for client-gateway communication.

use serde::{Deserialize, Serialize};
use switchyard_core::{
    ClientMessage, ConnectionHandle, Envelope, ErrorCode, ServerMessage, SessionId,
};
use thiserror::Error;

/// Frame from client to gateway.
///
/// The message fields sit next to an optional `session_id`:
/// `{"session_id":"abc","type":"request","id":1,"method":"search"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

impl ClientFrame {
    /// Attach the connection the frame arrived on.
    #[must_use]
    pub fn into_envelope(self, connection: ConnectionHandle) -> Envelope {
        Envelope {
            session_id: self.session_id,
            connection,
            message: self.message,
        }
    }
}

/// Frame codec error.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid message: binary frame is not UTF-8")]
    Utf8,
}

impl FrameError {
    /// Error frame sent back to the client.
    #[must_use]
    pub fn to_server_message(&self) -> ServerMessage {
        ServerMessage::Error {
            id: None,
            code: ErrorCode::InvalidMessage,
            message: self.to_string(),
        }
    }
}

/// Decode a text frame.
///
/// # Errors
/// Returns error if the frame is not a valid client message.
pub fn decode_frame(text: &str) -> Result<ClientFrame, FrameError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a binary frame carrying UTF-8 JSON.
///
/// # Errors
/// Returns error if the frame is not UTF-8 or not a valid client message.
pub fn decode_binary(data: &[u8]) -> Result<ClientFrame, FrameError> {
    let text = std::str::from_utf8(data).map_err(|_| FrameError::Utf8)?;
    decode_frame(text)
}

/// Encode a server message.
///
/// # Errors
/// Returns error if serialization fails.
pub fn encode_frame(message: &ServerMessage) -> Result<String, FrameError> {
    Ok(serde_json::to_string(message)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_frame_with_session() {
        let text = json!({
            "session_id": "abc",
            "type": "request",
            "id": 1,
            "method": "search",
            "params": {"q": "x"},
        })
        .to_string();
        let frame = decode_frame(&text).unwrap();
        assert_eq!(frame.session_id, Some(SessionId::from("abc")));
        assert_eq!(
            frame.message,
            ClientMessage::request(1, "search", json!({"q": "x"}))
        );
    }

    #[test]
    fn test_frame_without_session() {
        let frame = decode_frame(r#"{"type":"authorize"}"#).unwrap();
        assert_eq!(frame.session_id, None);
        assert_eq!(frame.message, ClientMessage::Authorize);

        let (conn, _rx) = ConnectionHandle::channel();
        let envelope = frame.into_envelope(conn.clone());
        assert_eq!(envelope.connection.id(), conn.id());
        assert!(envelope.session_id.is_none());
    }

    #[test]
    fn test_invalid_frames() {
        let err = decode_frame(r#"{"type":"teleport"}"#).unwrap_err();
        let ServerMessage::Error { code, id, .. } = err.to_server_message() else {
            panic!("expected error frame");
        };
        assert_eq!(code, ErrorCode::InvalidMessage);
        assert_eq!(id, None);

        assert!(matches!(decode_binary(&[0xff, 0xfe]), Err(FrameError::Utf8)));
        assert!(decode_binary(br#"{"type":"ping"}"#).is_ok());
    }

    #[test]
    fn test_encode_server_message() {
        let text = encode_frame(&ServerMessage::SessionAssigned {
            session_id: SessionId::from("abc"),
        })
        .unwrap();
        assert_eq!(text, r#"{"type":"session_assigned","session_id":"abc"}"#);
    }
}
