// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Messages
//!
//! Every message travelling through the broker exposes a stable type
//! identifier, the wire-level discriminator carried in the AMQP `type`
//! property. Concrete messages implement [`TypedMessage`] and get the
//! object-safe [`BaseMessage`] contract for free.

use crate::errors::MappingError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{any::Any, fmt::Debug};

/// Object-safe contract shared by every broker message.
pub trait BaseMessage: Any + Debug + Send + Sync {
    /// Wire-level type identifier.
    fn msg_type(&self) -> &str;

    /// JSON body published for this message.
    fn encode(&self) -> Result<Vec<u8>, MappingError>;

    fn as_any(&self) -> &dyn Any;
}

impl dyn BaseMessage {
    pub fn is<T: BaseMessage>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: BaseMessage>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// A concrete, serde-backed message shape.
///
/// `Default` is the zero value a payload is decoded over: fields missing from
/// the payload keep their default.
pub trait TypedMessage:
    Serialize + DeserializeOwned + Default + Debug + Send + Sync + 'static
{
    const MSG_TYPE: &'static str;
}

impl<T: TypedMessage> BaseMessage for T {
    fn msg_type(&self) -> &str {
        T::MSG_TYPE
    }

    fn encode(&self) -> Result<Vec<u8>, MappingError> {
        serde_json::to_vec(self).map_err(|err| MappingError::EncodeError {
            msg_type: T::MSG_TYPE.to_owned(),
            cause: err.to_string(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Untyped payload handed to a mapper.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Raw encoded JSON bytes, as received from the wire.
    Bytes(Vec<u8>),
    /// An already-decoded generic key/value structure.
    Value(Value),
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload::Bytes(value.to_vec())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

impl From<serde_json::Map<String, Value>> for Payload {
    fn from(value: serde_json::Map<String, Value>) -> Self {
        Payload::Value(Value::Object(value))
    }
}

/// Decodes `payload` over `seed`, so fields the payload leaves out keep the
/// seed's value.
pub fn decode_into<T: TypedMessage>(
    msg_type: &str,
    seed: T,
    payload: Payload,
) -> Result<T, MappingError> {
    let decode_err = |err: serde_json::Error| MappingError::DecodeError {
        msg_type: msg_type.to_owned(),
        cause: err.to_string(),
    };

    let incoming = match payload {
        Payload::Bytes(bytes) => serde_json::from_slice::<Value>(&bytes).map_err(decode_err)?,
        Payload::Value(value) => value,
    };

    match incoming {
        Value::Null => Ok(seed),
        Value::Object(fields) => {
            let mut base = serde_json::to_value(seed).map_err(decode_err)?;
            match &mut base {
                Value::Object(target) => {
                    target.extend(fields);
                }
                other => *other = Value::Object(fields),
            }
            serde_json::from_value(base).map_err(decode_err)
        }
        other => serde_json::from_value(other).map_err(decode_err),
    }
}

/// Reference message without payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {}

impl TypedMessage for Message {
    const MSG_TYPE: &'static str = "message";
}

/// Reference message carrying plain text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Text {
    pub body: String,
}

impl Text {
    pub fn new(body: &str) -> Self {
        Text {
            body: body.to_owned(),
        }
    }
}

impl TypedMessage for Text {
    const MSG_TYPE: &'static str = "text";
}
