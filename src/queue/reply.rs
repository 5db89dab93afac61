//! Strict decoding of consumer-group read replies.
//!
//! The read script and the prefer-stream fast path both hand back the raw
//! `XREADGROUP` reply shape `[[stream, [[id, [k, v, …]]]]]`. Anything that
//! deviates from that shape is rejected rather than guessed at.

use std::collections::HashMap;

use redis::Value;

use super::QueueError;

/// A delivered queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Key of the stream the message was read from.
    pub stream: String,
    /// Server-assigned entry ID (`millis-seq`).
    pub id: String,
    /// Field/value payload.
    pub values: HashMap<String, String>,
}

fn malformed(detail: impl Into<String>) -> QueueError {
    QueueError::MalformedReply(detail.into())
}

fn as_string(value: &Value) -> Result<String, QueueError> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|_| malformed("non-utf8 string in stream reply")),
        Value::SimpleString(s) => Ok(s.clone()),
        other => Err(malformed(format!("expected string, got {other:?}"))),
    }
}

/// Decode a single-message consumer-group read reply.
///
/// `Nil` (no message) decodes to `None`; a stream block with an empty entry
/// list does too. Everything else must be exactly one stream holding exactly
/// one entry.
pub(crate) fn parse_read_reply(value: &Value) -> Result<Option<Message>, QueueError> {
    let streams = match value {
        Value::Nil => return Ok(None),
        Value::Array(streams) => streams,
        other => return Err(malformed(format!("expected stream array, got {other:?}"))),
    };

    let [stream_block] = streams.as_slice() else {
        return Err(malformed(format!(
            "expected exactly one stream, got {}",
            streams.len()
        )));
    };
    let Value::Array(stream_parts) = stream_block else {
        return Err(malformed("stream block is not an array"));
    };
    let [name, entries] = stream_parts.as_slice() else {
        return Err(malformed("stream block is not a [name, entries] pair"));
    };

    let stream = as_string(name)?;
    let Value::Array(entries) = entries else {
        return Err(malformed("entry list is not an array"));
    };
    if entries.is_empty() {
        return Ok(None);
    }
    let [entry] = entries.as_slice() else {
        return Err(malformed(format!(
            "expected exactly one entry, got {}",
            entries.len()
        )));
    };

    let Value::Array(entry_parts) = entry else {
        return Err(malformed("entry is not an array"));
    };
    let [id, fields] = entry_parts.as_slice() else {
        return Err(malformed("entry is not an [id, fields] pair"));
    };

    let id = as_string(id)?;
    let Value::Array(fields) = fields else {
        return Err(malformed("field list is not an array"));
    };
    if fields.len() % 2 != 0 {
        return Err(malformed("odd field/value count"));
    }

    let mut values = HashMap::with_capacity(fields.len() / 2);
    for pair in fields.chunks_exact(2) {
        let [k, v] = pair else {
            return Err(malformed("field pair missing"));
        };
        values.insert(as_string(k)?, as_string(v)?);
    }

    Ok(Some(Message { stream, id, values }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn reply(stream: &str, id: &str, fields: &[(&str, &str)]) -> Value {
        let mut flat = Vec::new();
        for (k, v) in fields {
            flat.push(bulk(k));
            flat.push(bulk(v));
        }
        Value::Array(vec![Value::Array(vec![
            bulk(stream),
            Value::Array(vec![Value::Array(vec![bulk(id), Value::Array(flat)])]),
        ])])
    }

    #[test]
    fn decodes_single_entry() {
        let value = reply("jobs:s1", "1700000000000-0", &[("kind", "predict"), ("id", "42")]);
        let msg = parse_read_reply(&value).unwrap().unwrap();
        assert_eq!(msg.stream, "jobs:s1");
        assert_eq!(msg.id, "1700000000000-0");
        assert_eq!(msg.values.get("kind").map(String::as_str), Some("predict"));
        assert_eq!(msg.values.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn nil_is_no_message() {
        assert_eq!(parse_read_reply(&Value::Nil).unwrap(), None);
    }

    #[test]
    fn empty_entry_list_is_no_message() {
        let value = Value::Array(vec![Value::Array(vec![
            bulk("jobs:s0"),
            Value::Array(vec![]),
        ])]);
        assert_eq!(parse_read_reply(&value).unwrap(), None);
    }

    #[test]
    fn rejects_multiple_streams() {
        let a = reply("jobs:s0", "1-0", &[]);
        let b = reply("jobs:s1", "2-0", &[]);
        let (Value::Array(mut xs), Value::Array(ys)) = (a, b) else {
            unreachable!()
        };
        xs.extend(ys);
        let err = parse_read_reply(&Value::Array(xs)).unwrap_err();
        assert!(matches!(err, QueueError::MalformedReply(_)));
    }

    #[test]
    fn rejects_odd_field_count() {
        let value = Value::Array(vec![Value::Array(vec![
            bulk("jobs:s0"),
            Value::Array(vec![Value::Array(vec![
                bulk("1-0"),
                Value::Array(vec![bulk("orphan")]),
            ])]),
        ])]);
        let err = parse_read_reply(&value).unwrap_err();
        assert!(matches!(err, QueueError::MalformedReply(_)));
    }

    #[test]
    fn rejects_scalar_reply() {
        let err = parse_read_reply(&Value::Int(3)).unwrap_err();
        assert!(matches!(err, QueueError::MalformedReply(_)));
    }
}
