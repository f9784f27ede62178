/// Server identity handshake
///
/// Builds the legacy `isMaster` command and reads the handful of top-level
/// fields of its reply that topology tracking needs.
use super::{Message, OP_MSG, OP_QUERY, OP_REPLY};
use crate::core::{HandshakeResult, ServerRole};
use crate::error::{DriverError, DriverResult};
use bson::{doc, Bson, Document};
use bytes::{BufMut, BytesMut};

const COMMAND_NAMESPACE: &str = "admin.$cmd";
const ROUTER_MSG: &str = "isdbgrid";

/// `{ isMaster: 1 }` as an `OP_QUERY` against `admin.$cmd`
pub fn is_master_query() -> DriverResult<Message> {
    let mut document = Vec::new();
    doc! { "isMaster": 1 }
        .to_writer(&mut document)
        .map_err(|e| DriverError::protocol(format!("cannot encode isMaster: {}", e)))?;

    let mut body = BytesMut::with_capacity(document.len() + COMMAND_NAMESPACE.len() + 13);
    body.put_i32_le(0); // flags
    body.extend_from_slice(COMMAND_NAMESPACE.as_bytes());
    body.put_u8(0);
    body.put_i32_le(0); // numberToSkip
    body.put_i32_le(-1); // numberToReturn
    body.extend_from_slice(&document);

    Ok(Message::new(OP_QUERY, body.freeze()))
}

/// Derive a [`HandshakeResult`] from an `isMaster` reply.
pub fn parse_is_master(reply: &Message) -> DriverResult<HandshakeResult> {
    let document = Document::from_reader(reply_document(reply)?)
        .map_err(|e| DriverError::protocol(format!("malformed isMaster reply: {}", e)))?;

    let ok = document.get("ok").and_then(as_f64).map_or(true, |v| v != 0.0);
    if !ok {
        return Err(DriverError::protocol("server rejected the isMaster command"));
    }

    let flag = |name: &str| document.get_bool(name).unwrap_or(false);
    let is_master = flag("ismaster") || flag("isWritablePrimary");
    let router = document.get_str("msg").map_or(false, |msg| msg == ROUTER_MSG);

    let mut result = HandshakeResult {
        set_name: document.get_str("setName").ok().map(str::to_string),
        ..HandshakeResult::default()
    };
    if let Some(v) = document.get("maxWireVersion").and_then(as_i64) {
        result.wire_version = i32::try_from(v).unwrap_or(i32::MAX);
    }
    if let Some(v) = document
        .get("maxMessageSizeBytes")
        .and_then(as_i64)
        .filter(|v| *v > 0)
    {
        result.max_message_size = usize::try_from(v).unwrap_or(usize::MAX);
    }

    result.role = if router {
        ServerRole::Mongos
    } else if flag("arbiterOnly") {
        ServerRole::Arbiter
    } else if result.set_name.is_some() || flag("isreplicaset") {
        if is_master {
            ServerRole::Primary
        } else if flag("secondary") {
            ServerRole::Secondary
        } else {
            ServerRole::Unknown
        }
    } else if is_master {
        ServerRole::Standalone
    } else {
        ServerRole::Unknown
    };

    Ok(result)
}

/// Servers report numbers as int32, int64 or double depending on version.
fn as_i64(value: &Bson) -> Option<i64> {
    match *value {
        Bson::Int32(v) => Some(i64::from(v)),
        Bson::Int64(v) => Some(v),
        Bson::Double(v) => Some(v as i64),
        _ => None,
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match *value {
        Bson::Int32(v) => Some(f64::from(v)),
        Bson::Int64(v) => Some(v as f64),
        Bson::Double(v) => Some(v),
        Bson::Boolean(v) => Some(if v { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Locate the first document in an `OP_REPLY` or kind-0 `OP_MSG` body.
fn reply_document(reply: &Message) -> DriverResult<&[u8]> {
    let body = &reply.body[..];
    let offset = match reply.op_code {
        // responseFlags, cursorID, startingFrom, numberReturned
        OP_REPLY => 20,
        // flagBits, section kind
        OP_MSG => {
            if body.get(4) != Some(&0) {
                return Err(DriverError::protocol("OP_MSG reply without a body section"));
            }
            5
        }
        other => {
            return Err(DriverError::protocol(format!(
                "unexpected handshake reply opcode {}",
                other
            )))
        }
    };

    body.get(offset..)
        .filter(|doc| doc.len() >= 5)
        .ok_or_else(|| DriverError::protocol("handshake reply holds no document"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mock::{encode, op_reply};

    #[test]
    fn test_is_master_query_layout() {
        let query = is_master_query().unwrap();
        assert_eq!(query.op_code, OP_QUERY);

        let body = &query.body[..];
        assert_eq!(&body[4..15], b"admin.$cmd\0");
        assert_eq!(&body[15..19], &0i32.to_le_bytes());
        assert_eq!(&body[19..23], &(-1i32).to_le_bytes());

        let document = Document::from_reader(&body[23..]).unwrap();
        assert_eq!(document, doc! { "isMaster": 1 });
        assert_eq!(body.len() - 23, encode(&document).len());
    }

    #[test]
    fn test_parse_primary() {
        let reply = op_reply(doc! {
            "ismaster": true,
            "secondary": false,
            "setName": "rs0",
            "hosts": ["a:27017", "b:27017"],
            "maxWireVersion": 8,
            "maxMessageSizeBytes": 48_000_000,
            "ok": 1.0,
        });

        let result = parse_is_master(&reply).unwrap();
        assert_eq!(result.role, ServerRole::Primary);
        assert_eq!(result.set_name.as_deref(), Some("rs0"));
        assert_eq!(result.wire_version, 8);
        assert_eq!(result.max_message_size, 48_000_000);
    }

    #[test]
    fn test_parse_roles() {
        let secondary = op_reply(doc! {
            "ismaster": false,
            "secondary": true,
            "setName": "rs0",
        });
        assert_eq!(
            parse_is_master(&secondary).unwrap().role,
            ServerRole::Secondary
        );

        let arbiter = op_reply(doc! { "arbiterOnly": true, "setName": "rs0" });
        assert_eq!(parse_is_master(&arbiter).unwrap().role, ServerRole::Arbiter);

        let router = op_reply(doc! { "ismaster": true, "msg": "isdbgrid" });
        assert_eq!(parse_is_master(&router).unwrap().role, ServerRole::Mongos);

        let standalone = op_reply(doc! { "ismaster": true });
        assert_eq!(
            parse_is_master(&standalone).unwrap().role,
            ServerRole::Standalone
        );

        let recovering = op_reply(doc! { "ismaster": false, "isreplicaset": true });
        assert_eq!(
            parse_is_master(&recovering).unwrap().role,
            ServerRole::Unknown
        );
    }

    #[test]
    fn test_parse_numeric_widths() {
        let reply = op_reply(doc! {
            "ismaster": true,
            "maxWireVersion": 13_i64,
            "maxMessageSizeBytes": 16_777_216.0,
            "ok": 1,
        });

        let result = parse_is_master(&reply).unwrap();
        assert_eq!(result.wire_version, 13);
        assert_eq!(result.max_message_size, 16_777_216);
    }

    #[test]
    fn test_parse_op_msg_reply() {
        let mut body = BytesMut::new();
        body.put_u32_le(0);
        body.put_u8(0);
        body.extend_from_slice(&encode(&doc! {
            "isWritablePrimary": true,
            "maxWireVersion": 17,
        }));

        let result = parse_is_master(&Message::new(OP_MSG, body.freeze())).unwrap();
        assert_eq!(result.role, ServerRole::Standalone);
        assert_eq!(result.wire_version, 17);
    }

    #[test]
    fn test_rejected_and_truncated_replies() {
        let rejected = op_reply(doc! { "ok": 0.0 });
        assert!(parse_is_master(&rejected).is_err());

        let mut reply = op_reply(doc! { "ismaster": true });
        reply.body = reply.body.slice(..reply.body.len() - 3);
        assert!(matches!(
            parse_is_master(&reply),
            Err(DriverError::Protocol(_))
        ));
    }
}
