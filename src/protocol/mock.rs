//! Scripted wire-protocol peers for tests

use super::{Message, HEADER_LENGTH, OP_QUERY, OP_REPLY};
use crate::core::ServerRole;
use bson::{doc, Document};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Serialized bytes of `document`
pub(crate) fn encode(document: &Document) -> Vec<u8> {
    let mut bytes = Vec::new();
    document.to_writer(&mut bytes).unwrap();
    bytes
}

/// `OP_REPLY` body carrying one document
pub(crate) fn op_reply_body(document: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(20 + document.len());
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(&0i64.to_le_bytes());
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(&1i32.to_le_bytes());
    body.extend_from_slice(document);
    body
}

pub(crate) fn op_reply(document: Document) -> Message {
    Message::new(OP_REPLY, op_reply_body(&encode(&document)))
}

/// Full `OP_REPLY` frame with an arbitrary body
pub(crate) fn reply_frame(response_to: i32, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LENGTH + body.len());
    frame.extend_from_slice(&((HEADER_LENGTH + body.len()) as i32).to_le_bytes());
    frame.extend_from_slice(&0i32.to_le_bytes());
    frame.extend_from_slice(&response_to.to_le_bytes());
    frame.extend_from_slice(&OP_REPLY.to_le_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Read one framed request: (request id, opcode, body).
pub(crate) async fn read_request(stream: &mut TcpStream) -> Option<(i32, i32, Vec<u8>)> {
    let mut header = [0u8; HEADER_LENGTH];
    stream.read_exact(&mut header).await.ok()?;
    let length = i32::from_le_bytes(header[0..4].try_into().ok()?) as usize;
    let request_id = i32::from_le_bytes(header[4..8].try_into().ok()?);
    let op_code = i32::from_le_bytes(header[12..16].try_into().ok()?);
    let mut body = vec![0u8; length.checked_sub(HEADER_LENGTH)?];
    stream.read_exact(&mut body).await.ok()?;
    Some((request_id, op_code, body))
}

/// isMaster document a server with `role` would send
pub(crate) fn identity(role: ServerRole, set_name: Option<&str>) -> Vec<u8> {
    let mut document = match role {
        ServerRole::Primary => doc! { "ismaster": true, "secondary": false },
        ServerRole::Secondary => doc! { "ismaster": false, "secondary": true },
        ServerRole::Arbiter => doc! { "ismaster": false, "arbiterOnly": true },
        ServerRole::Standalone => doc! { "ismaster": true },
        ServerRole::Mongos => doc! { "ismaster": true, "msg": "isdbgrid" },
        ServerRole::Unknown => doc! { "ismaster": false },
    };
    if let Some(set_name) = set_name {
        document.insert("setName", set_name);
    }
    document.insert("maxWireVersion", 8);
    document.insert("maxMessageSizeBytes", 48_000_000);
    document.insert("ok", 1.0);
    encode(&document)
}

/// Loopback server answering identity queries and echoing everything else
pub(crate) struct MockServer {
    pub(crate) address: String,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start(identity: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        let identity = Arc::new(identity);
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let identity = Arc::clone(&identity);
                tokio::spawn(async move {
                    while let Some((request_id, op_code, body)) = read_request(&mut stream).await {
                        let reply = if op_code == OP_QUERY {
                            reply_frame(request_id, &op_reply_body(&identity))
                        } else {
                            reply_frame(request_id, &body)
                        };
                        if stream.write_all(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self {
            address,
            accepted,
            task,
        }
    }

    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Stop accepting; established connections keep being served.
    pub(crate) fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// An address nothing listens on
pub(crate) async fn unused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}
