//! Parsing of admin command replies.
//!
//! Every command reply is a JSON document with an `ok` field. Failed
//! commands carry `code`, `codeName` and `errmsg`.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::admin::{RegisteredShard, ReplicaSetStatus};
use crate::error::{codes, CommandError};

/// Interpret `ok`, which shells print as `1`, `1.0` or `true`.
fn is_ok(reply: &Value) -> bool {
    match reply.get("ok") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v == 1.0),
        _ => false,
    }
}

/// Turn an `ok: 0` reply into [`CommandError::Server`].
pub fn check_ok(reply: &Value) -> Result<(), CommandError> {
    if !reply.is_object() {
        return Err(CommandError::MalformedReply(format!(
            "expected a document, got {reply}"
        )));
    }
    if is_ok(reply) {
        return Ok(());
    }
    let code = reply
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok())
        .unwrap_or(-1);
    let code_name = reply
        .get("codeName")
        .and_then(Value::as_str)
        .unwrap_or("UnknownError");
    let message = reply
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or("command failed without a message");
    Err(CommandError::server(code, code_name, message))
}

fn decode<T: DeserializeOwned>(reply: Value) -> Result<T, CommandError> {
    serde_json::from_value(reply).map_err(|e| CommandError::MalformedReply(e.to_string()))
}

/// `replSetGetStatus`: `NotYetInitialized` means "no config yet", not failure.
pub fn parse_status(reply: Value) -> Result<Option<ReplicaSetStatus>, CommandError> {
    match check_ok(&reply) {
        Ok(()) => decode(reply).map(Some),
        Err(err) if err.code() == Some(codes::NOT_YET_INITIALIZED) => Ok(None),
        Err(err) => Err(err),
    }
}

pub fn parse_shards(reply: Value) -> Result<Vec<RegisteredShard>, CommandError> {
    check_ok(&reply)?;
    match reply.get("shards") {
        Some(shards) => decode(shards.clone()),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn ok_variants() {
        assert!(check_ok(&json!({"ok": 1})).is_ok());
        assert!(check_ok(&json!({"ok": 1.0})).is_ok());
        assert!(check_ok(&json!({"ok": true})).is_ok());
        assert!(check_ok(&json!({"ok": 0})).is_err());
    }

    #[test]
    fn server_error_fields_are_extracted() {
        let err = check_ok(&json!({
            "ok": 0,
            "code": 23,
            "codeName": "AlreadyInitialized",
            "errmsg": "already initialized"
        }))
        .unwrap_err();
        assert_matches!(
            err,
            CommandError::Server { code: 23, ref code_name, .. } if code_name == "AlreadyInitialized"
        );
    }

    #[test]
    fn non_document_reply_is_malformed() {
        assert_matches!(check_ok(&json!("ok")), Err(CommandError::MalformedReply(_)));
    }

    #[test]
    fn not_yet_initialized_status_is_none() {
        let reply = json!({
            "ok": 0,
            "code": 94,
            "codeName": "NotYetInitialized",
            "errmsg": "no replset config has been received"
        });
        assert_matches!(parse_status(reply), Ok(None));
    }

    #[test]
    fn other_status_errors_propagate() {
        let reply = json!({ "ok": 0, "code": 13, "codeName": "Unauthorized", "errmsg": "auth" });
        assert_matches!(parse_status(reply), Err(CommandError::Server { code: 13, .. }));
    }

    #[test]
    fn initiated_status_parses() {
        let reply = json!({
            "set": "configReplSet",
            "members": [{ "_id": 0, "name": "localhost:27020", "stateStr": "PRIMARY", "health": 1 }],
            "ok": 1
        });
        let status = parse_status(reply).unwrap().unwrap();
        assert_eq!(status.set_name, "configReplSet");
        assert!(status.primary().is_some());
    }

    #[test]
    fn list_shards_parses_entries() {
        let reply = json!({
            "shards": [
                { "_id": "shard1", "host": "shard1/localhost:27023,localhost:27024,localhost:27025", "state": 1 }
            ],
            "ok": 1
        });
        let shards = parse_shards(reply).unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].id, "shard1");
        assert!(parse_shards(json!({"ok": 1})).unwrap().is_empty());
    }
}
