//! Scripted transport used by the integration tests.
//!
//! The transport answers commands from a per-connection script: each
//! [`Phase`] describes one connection session (the initial connect is phase
//! 0, every reconnect advances to the next phase). Rules match on a
//! case-insensitive prefix of the rendered command line.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use redis_conduit::protocol::RespDecoder;
use redis_conduit::{RedisError, RedisResult, RespValue, Transport};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn bulk(s: &str) -> RespValue {
    RespValue::from(s)
}

pub fn status(s: &str) -> RespValue {
    RespValue::SimpleString(s.to_string())
}

pub fn error(s: &str) -> RespValue {
    RespValue::Error(s.to_string())
}

pub fn int(i: i64) -> RespValue {
    RespValue::Integer(i)
}

pub fn array(items: Vec<RespValue>) -> RespValue {
    RespValue::Array(items)
}

pub fn bulk_array(items: &[&str]) -> RespValue {
    array(items.iter().map(|i| bulk(i)).collect())
}

/// `[cursor, [items...]]` as SCAN-family commands reply
pub fn scan_reply(cursor: &str, items: &[&str]) -> RespValue {
    array(vec![bulk(cursor), bulk_array(items)])
}

pub const STANDALONE_INFO: &str =
    "# Server\r\nredis_version:7.2.4\r\nredis_mode:standalone\r\n";

pub const CLUSTER_INFO: &str = "# Server\r\nredis_version:7.0.5\r\nredis_mode:cluster\r\n";

pub const SENTINEL_INFO: &str = "# Server\r\nredis_version:7.0.5\r\nredis_mode:sentinel\r\n";

enum Replies {
    /// Same reply every time the prefix matches
    Repeat(RespValue),
    /// Consumed front to back; exhausted rules stop matching
    Sequence(VecDeque<RespValue>),
    /// Match but never reply (the command hangs in flight)
    Withhold,
}

struct Rule {
    prefix: String,
    replies: Replies,
}

/// Script for one connection session
#[derive(Default)]
pub struct Phase {
    fail_connect: Option<String>,
    rules: Vec<Rule>,
}

impl Phase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase with PING and a standalone `INFO` already scripted
    pub fn standalone() -> Self {
        Self::new()
            .on("PING", status("PONG"))
            .on("INFO", bulk(STANDALONE_INFO))
    }

    /// Phase with PING and a cluster `INFO` already scripted
    pub fn cluster() -> Self {
        Self::new()
            .on("PING", status("PONG"))
            .on("INFO", bulk(CLUSTER_INFO))
    }

    /// Reply with `reply` every time a command starts with `prefix`
    pub fn on(mut self, prefix: &str, reply: RespValue) -> Self {
        self.rules.push(Rule {
            prefix: prefix.to_string(),
            replies: Replies::Repeat(reply),
        });
        self
    }

    /// Reply with each of `replies` in turn for successive matches
    pub fn on_seq(mut self, prefix: &str, replies: Vec<RespValue>) -> Self {
        self.rules.push(Rule {
            prefix: prefix.to_string(),
            replies: Replies::Sequence(replies.into()),
        });
        self
    }

    /// Accept the command but never deliver its reply
    pub fn on_withhold(mut self, prefix: &str) -> Self {
        self.rules.push(Rule {
            prefix: prefix.to_string(),
            replies: Replies::Withhold,
        });
        self
    }

    /// Make this session's connect attempt fail
    pub fn failing_connect(mut self, message: &str) -> Self {
        self.fail_connect = Some(message.to_string());
        self
    }

    fn reply_for(&mut self, line: &str) -> Option<RespValue> {
        let upper = line.to_uppercase();
        for rule in &mut self.rules {
            if !upper.starts_with(&rule.prefix.to_uppercase()) {
                continue;
            }
            match &mut rule.replies {
                Replies::Repeat(reply) => return Some(reply.clone()),
                Replies::Sequence(queue) => {
                    if let Some(reply) = queue.pop_front() {
                        return Some(reply);
                    }
                    // exhausted, try the next rule
                }
                Replies::Withhold => return None,
            }
        }
        Some(error(&format!("ERR unscripted command '{line}'")))
    }

}

pub struct ScriptedTransport {
    phases: Vec<Phase>,
    connect_count: usize,
    pending: VecDeque<RespValue>,
    /// Every (host, port) the connection dialed, in order
    pub connects: Arc<Mutex<Vec<(String, u16)>>>,
    /// Every command line put on the wire, in order
    pub commands: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self {
            phases,
            connect_count: 0,
            pending: VecDeque::new(),
            connects: Arc::new(Mutex::new(Vec::new())),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn connect_log(&self) -> Arc<Mutex<Vec<(String, u16)>>> {
        self.connects.clone()
    }

    pub fn command_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.commands.clone()
    }

    fn current_phase(&mut self) -> &mut Phase {
        let index = self
            .connect_count
            .saturating_sub(1)
            .min(self.phases.len().saturating_sub(1));
        &mut self.phases[index]
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self, host: &str, port: u16, _: Duration) -> RedisResult<()> {
        self.connects
            .lock()
            .unwrap()
            .push((host.to_string(), port));
        self.connect_count += 1;
        self.pending.clear();

        if let Some(message) = self.current_phase().fail_connect.clone() {
            return Err(RedisError::Transport(message));
        }
        Ok(())
    }

    async fn send(&mut self, payload: Bytes, _: Duration) -> RedisResult<()> {
        let mut cursor = Cursor::new(&payload[..]);
        let frame = RespDecoder::decode(&mut cursor)
            .expect("test transport received malformed payload")
            .expect("test transport received incomplete payload");

        let line = frame
            .array()
            .expect("commands are multibulk arrays")
            .iter()
            .map(|part| part.as_string().unwrap_or_default())
            .collect::<Vec<_>>()
            .join(" ");

        self.commands.lock().unwrap().push(line.clone());

        if let Some(reply) = self.current_phase().reply_for(&line) {
            self.pending.push_back(reply);
        }
        Ok(())
    }

    async fn read_reply(&mut self) -> RedisResult<RespValue> {
        if let Some(reply) = self.pending.pop_front() {
            return Ok(reply);
        }
        // withheld reply: park until the read future is dropped
        std::future::pending::<RedisResult<RespValue>>().await
    }

    async fn close(&mut self) {}
}
