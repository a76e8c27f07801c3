//! Bucketed key-value store driven by the Raft log.
//!
//! Commands are the textual command lines (`SET bucket key value`, ...) as
//! UTF-8 bytes. Shape errors are answered with literal responses, never by
//! failing the apply.

use super::state_machine::StateMachine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Commands that the key-value store can handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Set {
        bucket: String,
        key: String,
        value: String,
    },
    Get {
        bucket: String,
        key: String,
    },
    Del {
        bucket: String,
        key: String,
    },
    Keys {
        bucket: String,
    },
    DelBucket {
        bucket: String,
    },
    Buckets,
}

impl KvCommand {
    /// Parses a command line. Names are case-insensitive.
    pub fn parse(line: &str) -> Result<Self, KvResponse> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(name) = parts.first() else {
            return Err(KvResponse::BadArgs);
        };
        let args = &parts[1..];

        let arity = match name.to_uppercase().as_str() {
            "SET" => 3,
            "GET" | "DEL" => 2,
            "KEYS" | "DELBUCKET" => 1,
            "BUCKETS" => 0,
            _ => return Err(KvResponse::BadCmd),
        };
        if args.len() != arity {
            return Err(KvResponse::BadArgs);
        }

        let arg = |i: usize| args[i].to_string();
        Ok(match name.to_uppercase().as_str() {
            "SET" => KvCommand::Set {
                bucket: arg(0),
                key: arg(1),
                value: arg(2),
            },
            "GET" => KvCommand::Get {
                bucket: arg(0),
                key: arg(1),
            },
            "DEL" => KvCommand::Del {
                bucket: arg(0),
                key: arg(1),
            },
            "KEYS" => KvCommand::Keys { bucket: arg(0) },
            "DELBUCKET" => KvCommand::DelBucket { bucket: arg(0) },
            _ => KvCommand::Buckets,
        })
    }
}

/// Response type returned by the state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvResponse {
    Ok,
    Value(Option<String>),
    NoKey,
    NoBucket,
    Keys(Vec<String>),
    Buckets(Vec<String>),
    BadCmd,
    BadArgs,
}

impl fmt::Display for KvResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvResponse::Ok => f.write_str("OK"),
            KvResponse::Value(Some(v)) => f.write_str(v),
            KvResponse::Value(None) => f.write_str("None"),
            KvResponse::NoKey => f.write_str("NO_KEY"),
            KvResponse::NoBucket => f.write_str("NO_BUCKET"),
            KvResponse::Keys(list) | KvResponse::Buckets(list) => {
                let rendered = serde_json::to_string(list).map_err(|_| fmt::Error)?;
                f.write_str(&rendered)
            }
            KvResponse::BadCmd => f.write_str("BAD_CMD"),
            KvResponse::BadArgs => f.write_str("BAD_ARGS"),
        }
    }
}

/// In-memory buckets of string keys and values.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BucketStore {
    buckets: BTreeMap<String, BTreeMap<String, String>>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, bucket: &str, key: &str, value: &str) -> KvResponse {
        self.buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        KvResponse::Ok
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<String> {
        self.buckets.get(bucket)?.get(key).cloned()
    }

    /// Removes a key; the bucket stays even when it becomes empty.
    pub fn delete(&mut self, bucket: &str, key: &str) -> KvResponse {
        match self.buckets.get_mut(bucket).and_then(|b| b.remove(key)) {
            Some(_) => KvResponse::Ok,
            None => KvResponse::NoKey,
        }
    }

    pub fn delete_bucket(&mut self, bucket: &str) -> KvResponse {
        match self.buckets.remove(bucket) {
            Some(_) => KvResponse::Ok,
            None => KvResponse::NoBucket,
        }
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list_buckets(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    pub fn execute(&mut self, command: KvCommand) -> KvResponse {
        match command {
            KvCommand::Set { bucket, key, value } => self.set(&bucket, &key, &value),
            KvCommand::Get { bucket, key } => KvResponse::Value(self.get(&bucket, &key)),
            KvCommand::Del { bucket, key } => self.delete(&bucket, &key),
            KvCommand::Keys { bucket } => KvResponse::Keys(self.keys(&bucket)),
            KvCommand::DelBucket { bucket } => self.delete_bucket(&bucket),
            KvCommand::Buckets => KvResponse::Buckets(self.list_buckets()),
        }
    }
}

impl StateMachine for BucketStore {
    type Response = KvResponse;

    fn apply(&mut self, command: &[u8]) -> KvResponse {
        let Ok(line) = std::str::from_utf8(command) else {
            return KvResponse::BadCmd;
        };
        match KvCommand::parse(line) {
            Ok(cmd) => self.execute(cmd),
            Err(response) => response,
        }
    }
}
