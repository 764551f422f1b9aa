//! Parsed server replies and their classification
//!
//! A [`Response`] wraps the decoded RESP value tree and answers the questions
//! the dispatch pipeline asks of a reply: is it an error, is it the
//! "command not available" class of error that triggers vendor fallbacks, and
//! does it have the `[cursor, items]` shape of a SCAN-family reply.

use crate::core::value::RespValue;
use bytes::Bytes;

/// A parsed reply from the server
#[derive(Debug, Clone, Default)]
pub struct Response {
    value: RespValue,
}

impl Response {
    /// Wrap a decoded RESP value
    #[must_use]
    pub const fn new(value: RespValue) -> Self {
        Self { value }
    }

    /// Borrow the underlying value tree
    #[must_use]
    pub const fn value(&self) -> &RespValue {
        &self.value
    }

    /// Consume the response, yielding the value tree
    #[must_use]
    pub fn into_value(self) -> RespValue {
        self.value
    }

    /// True when the reply is an array
    #[must_use]
    pub const fn is_array(&self) -> bool {
        matches!(self.value, RespValue::Array(_))
    }

    /// True when the reply is a server error
    #[must_use]
    pub const fn is_error_message(&self) -> bool {
        self.value.is_error()
    }

    /// Error text of the reply, or the empty string for non-errors
    #[must_use]
    pub fn error_text(&self) -> String {
        self.value.error_text().unwrap_or_default().to_string()
    }

    /// True for errors meaning the command does not exist on this server or
    /// has been administratively disabled. Some managed Redis vendors reject
    /// commands this way instead of not advertising them.
    #[must_use]
    pub fn is_disabled_command_error_message(&self) -> bool {
        let Some(text) = self.value.error_text() else {
            return false;
        };
        let text = text.to_ascii_lowercase();

        text.contains("unknown command")
            || text.contains("command is disabled")
            || text.contains("unsupported command")
    }

    /// True when the reply has the SCAN shape: a 2-element array whose first
    /// element parses as an unsigned cursor and whose second element is an
    /// array of strings.
    #[must_use]
    pub fn is_valid_scan_response(&self) -> bool {
        let Some(items) = self.value.array() else {
            return false;
        };

        if items.len() != 2 || items[0].as_u64().is_err() {
            return false;
        }

        match items[1].array() {
            Some(members) => members.iter().all(|m| {
                matches!(
                    m,
                    RespValue::BulkString(_) | RespValue::SimpleString(_)
                )
            }),
            None => false,
        }
    }

    /// Cursor of a SCAN-shaped reply; 0 when the reply has no cursor
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.value
            .array()
            .and_then(|items| items.first())
            .and_then(|c| c.as_u64().ok())
            .unwrap_or(0)
    }

    /// Items of a SCAN-shaped reply
    #[must_use]
    pub fn collection(&self) -> Vec<Bytes> {
        let Some(items) = self.value.array() else {
            return Vec::new();
        };

        items
            .get(1)
            .and_then(RespValue::array)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|m| m.as_bytes().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl From<RespValue> for Response {
    fn from(value: RespValue) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_reply(cursor: &str, items: &[&str]) -> Response {
        Response::new(RespValue::Array(vec![
            RespValue::from(cursor),
            RespValue::Array(items.iter().map(|i| RespValue::from(*i)).collect()),
        ]))
    }

    #[test]
    fn test_error_classification() {
        let err = Response::new(RespValue::Error("ERR unknown command 'SCAN'".into()));
        assert!(err.is_error_message());
        assert!(err.is_disabled_command_error_message());

        let err = Response::new(RespValue::Error(
            "ERR This command is disabled on cluster instances".into(),
        ));
        assert!(err.is_disabled_command_error_message());

        let err = Response::new(RespValue::Error("ERR wrong number of arguments".into()));
        assert!(err.is_error_message());
        assert!(!err.is_disabled_command_error_message());

        let ok = Response::new(RespValue::SimpleString("OK".into()));
        assert!(!ok.is_error_message());
        assert_eq!(ok.error_text(), "");
    }

    #[test]
    fn test_valid_scan_response() {
        let reply = scan_reply("48", &["a", "b"]);
        assert!(reply.is_valid_scan_response());
        assert_eq!(reply.cursor(), 48);
        assert_eq!(
            reply.collection(),
            vec![Bytes::from("a"), Bytes::from("b")]
        );
    }

    #[test]
    fn test_invalid_scan_shapes() {
        // wrong arity
        let reply = Response::new(RespValue::Array(vec![RespValue::from("0")]));
        assert!(!reply.is_valid_scan_response());

        // non-numeric cursor
        let reply = Response::new(RespValue::Array(vec![
            RespValue::from("x"),
            RespValue::Array(vec![]),
        ]));
        assert!(!reply.is_valid_scan_response());

        // second element not an array
        let reply = Response::new(RespValue::Array(vec![
            RespValue::from("0"),
            RespValue::from("oops"),
        ]));
        assert!(!reply.is_valid_scan_response());

        // not an array at all
        let reply = Response::new(RespValue::SimpleString("OK".into()));
        assert!(!reply.is_valid_scan_response());
        assert_eq!(reply.cursor(), 0);
        assert!(reply.collection().is_empty());
    }

    #[test]
    fn test_terminal_cursor() {
        let reply = scan_reply("0", &["c"]);
        assert!(reply.is_valid_scan_response());
        assert_eq!(reply.cursor(), 0);
    }

    #[test]
    fn test_default_response_is_null() {
        let response = Response::default();
        assert!(response.value().is_null());
        assert!(!response.is_error_message());
    }
}
