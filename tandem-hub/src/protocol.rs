//! Binary wire protocol spoken between replicas and the hub.
//!
//! Every frame starts with a varint message kind followed by a
//! kind-specific payload:
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ kind (var)   │ payload                                      │
//! ├──────────────┼──────────────────────────────────────────────┤
//! │ 0 = sync     │ sync type (var) │ length-prefixed bytes      │
//! │ 1 = presence │ length-prefixed presence update              │
//! │ other        │ ignored (forward compatible)                 │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Sync types: 0 = step 1 (state vector), 1 = step 2 (diff), 2 = update.
//! Integers use the lib0 variable-length encoding shared with `yrs`.

use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::doc::{DocError, SharedDoc};

/// Message kind for document sync frames.
pub const MESSAGE_SYNC: u64 = 0;
/// Message kind for presence (awareness) frames.
pub const MESSAGE_PRESENCE: u64 = 1;

/// Sync sub-type: state vector request.
pub const SYNC_STEP1: u64 = 0;
/// Sync sub-type: diff answering a step 1.
pub const SYNC_STEP2: u64 = 1;
/// Sync sub-type: incremental update.
pub const SYNC_UPDATE: u64 = 2;

/// Sub-messages of the sync protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Encoded state vector of the sender.
    Step1(Vec<u8>),
    /// Update containing everything the receiver was missing.
    Step2(Vec<u8>),
    /// Incremental update produced by a local edit.
    Update(Vec<u8>),
}

impl SyncMessage {
    fn sync_type(&self) -> u64 {
        match self {
            SyncMessage::Step1(_) => SYNC_STEP1,
            SyncMessage::Step2(_) => SYNC_STEP2,
            SyncMessage::Update(_) => SYNC_UPDATE,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            SyncMessage::Step1(p) | SyncMessage::Step2(p) | SyncMessage::Update(p) => p,
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Raw presence update, handed whole to the presence table.
    Presence(Vec<u8>),
    /// A kind this hub does not understand.
    Unknown(u64),
}

impl Message {
    /// Decode a frame received from a connection.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let kind: u64 = cursor.read_var()?;
        match kind {
            MESSAGE_SYNC => {
                let sync_type: u64 = cursor.read_var()?;
                let payload = cursor.read_buf()?.to_vec();
                let msg = match sync_type {
                    SYNC_STEP1 => SyncMessage::Step1(payload),
                    SYNC_STEP2 => SyncMessage::Step2(payload),
                    SYNC_UPDATE => SyncMessage::Update(payload),
                    other => return Err(ProtocolError::InvalidSyncType(other)),
                };
                Ok(Message::Sync(msg))
            }
            MESSAGE_PRESENCE => Ok(Message::Presence(cursor.read_buf()?.to_vec())),
            other => Ok(Message::Unknown(other)),
        }
    }

    /// Encode to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Sync(sync) => {
                buf.write_var(MESSAGE_SYNC);
                buf.write_var(sync.sync_type());
                buf.write_buf(sync.payload());
            }
            Message::Presence(update) => {
                buf.write_var(MESSAGE_PRESENCE);
                buf.write_buf(update);
            }
            Message::Unknown(kind) => {
                buf.write_var(*kind);
            }
        }
        buf
    }
}

/// Result of feeding one sync message into a document.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Frame to send back to the originating connection only.
    pub reply: Option<Vec<u8>>,
    /// What the message changed in the document, if anything.
    pub applied: Option<Vec<u8>>,
}

/// Initial handshake frame: our state vector, asking the peer for its diff.
pub fn write_sync_step1(doc: &SharedDoc) -> Vec<u8> {
    Message::Sync(SyncMessage::Step1(doc.state_vector())).encode()
}

/// Frame carrying an applied update for fan-out.
pub fn write_update(update: &[u8]) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update.to_vec())).encode()
}

/// Frame carrying an encoded presence update.
pub fn write_presence(update: &[u8]) -> Vec<u8> {
    Message::Presence(update.to_vec()).encode()
}

/// Apply a sync message to `doc`.
///
/// Step 1 is answered with a step 2 holding the diff against the peer's
/// state vector. Step 2 and update are applied and produce no reply; the
/// outcome carries only the part that changed the document.
pub fn read_sync_message(msg: SyncMessage, doc: &SharedDoc) -> Result<SyncOutcome, ProtocolError> {
    match msg {
        SyncMessage::Step1(state_vector) => {
            let diff = doc.encode_diff(&state_vector)?;
            Ok(SyncOutcome {
                reply: Some(Message::Sync(SyncMessage::Step2(diff)).encode()),
                applied: None,
            })
        }
        SyncMessage::Step2(update) | SyncMessage::Update(update) => Ok(SyncOutcome {
            reply: None,
            applied: doc.apply_update(&update)?,
        }),
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Decode(String),
    #[error("Invalid sync message type: {0}")]
    InvalidSyncType(u64),
    #[error("Document rejected message: {0}")]
    Document(#[from] DocError),
}

impl From<yrs::encoding::read::Error> for ProtocolError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ProtocolError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

    fn doc_with_text(content: &str) -> SharedDoc {
        let doc = SharedDoc::new(true);
        {
            let mut txn = doc.inner().transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, content);
        }
        doc
    }

    #[test]
    fn test_decode_sync_step1() {
        let frame = Message::Sync(SyncMessage::Step1(vec![1, 2, 3])).encode();
        assert_eq!(frame[0], MESSAGE_SYNC as u8);
        assert_eq!(frame[1], SYNC_STEP1 as u8);

        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded, Message::Sync(SyncMessage::Step1(vec![1, 2, 3])));
    }

    #[test]
    fn test_decode_presence() {
        let frame = write_presence(&[9, 9]);
        assert_eq!(frame, vec![1, 2, 9, 9]);
        assert_eq!(Message::decode(&frame).unwrap(), Message::Presence(vec![9, 9]));
    }

    #[test]
    fn test_unknown_kind_is_not_an_error() {
        let decoded = Message::decode(&[7, 0xAA, 0xBB]).unwrap();
        assert_eq!(decoded, Message::Unknown(7));
    }

    #[test]
    fn test_empty_frame_is_malformed() {
        assert!(matches!(Message::decode(&[]), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        // Sync update claiming 10 payload bytes but carrying 2.
        let frame = vec![0, 2, 10, 1, 2];
        assert!(matches!(Message::decode(&frame), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_invalid_sync_type() {
        let frame = vec![0, 9, 0];
        assert!(matches!(
            Message::decode(&frame),
            Err(ProtocolError::InvalidSyncType(9))
        ));
    }

    #[test]
    fn test_step1_is_answered_with_diff() {
        let server = doc_with_text("hello");
        let client = SharedDoc::new(true);

        let step1 = SyncMessage::Step1(client.state_vector());
        let outcome = read_sync_message(step1, &server).unwrap();
        assert!(outcome.applied.is_none());

        let reply = outcome.reply.expect("step 1 must produce a reply");
        let Message::Sync(SyncMessage::Step2(diff)) = Message::decode(&reply).unwrap() else {
            panic!("expected step 2 reply");
        };
        client.apply_update(&diff).unwrap();

        let txn = client.inner().transact();
        let text = txn.get_text("content").unwrap();
        assert_eq!(text.get_string(&txn), "hello");
    }

    #[test]
    fn test_update_is_applied_without_reply() {
        let source = doc_with_text("abc");
        let target = SharedDoc::new(true);

        let outcome =
            read_sync_message(SyncMessage::Update(source.encode_state()), &target).unwrap();
        assert!(outcome.reply.is_none());
        assert!(outcome.applied.is_some());

        let txn = target.inner().transact();
        let text = txn.get_text("content").unwrap();
        assert_eq!(text.get_string(&txn), "abc");
    }

    #[test]
    fn test_redundant_sync_messages_apply_nothing() {
        let source = doc_with_text("abc");
        let target = SharedDoc::new(true);
        read_sync_message(SyncMessage::Update(source.encode_state()), &target).unwrap();

        let repeat =
            read_sync_message(SyncMessage::Update(source.encode_state()), &target).unwrap();
        assert_eq!(repeat, SyncOutcome::default());

        let empty_step2 = SyncMessage::Step2(SharedDoc::new(true).encode_state());
        assert_eq!(read_sync_message(empty_step2, &target).unwrap(), SyncOutcome::default());
    }

    #[test]
    fn test_garbage_update_is_rejected() {
        let doc = SharedDoc::new(true);
        let result = read_sync_message(SyncMessage::Update(vec![0xFF, 0xFF, 0xFF]), &doc);
        assert!(matches!(result, Err(ProtocolError::Document(_))));
    }

    #[test]
    fn test_write_update_frame() {
        let frame = write_update(&[5, 6]);
        assert_eq!(frame, vec![0, 2, 2, 5, 6]);
    }
}
