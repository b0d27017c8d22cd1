// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Mappers
//!
//! A mapper resolves a wire-level type identifier to a concrete message shape
//! and decodes an untyped [`Payload`] into it. Two strategies share the
//! [`MessageMapper`] contract:
//!
//! - [`StaticMapper`]: a closed match over the reference message types.
//! - [`DynamicMapper`]: a registry of decoders populated at start-up, one per
//!   registered shape, keyed by the identifier the shape reports.

use crate::{
    errors::MappingError,
    message::{decode_into, BaseMessage, Message, Payload, Text, TypedMessage},
};
use std::{collections::HashMap, fmt, sync::Arc};

#[cfg(any(test, feature = "mocks"))]
use mockall::automock;

#[cfg_attr(any(test, feature = "mocks"), automock)]
pub trait MessageMapper: Send + Sync {
    fn map_message(
        &self,
        msg_type: &str,
        payload: Payload,
    ) -> Result<Box<dyn BaseMessage>, MappingError>;
}

/// Mapper over the fixed set of reference message types.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticMapper;

impl StaticMapper {
    pub fn new() -> Self {
        StaticMapper
    }
}

impl MessageMapper for StaticMapper {
    fn map_message(
        &self,
        msg_type: &str,
        payload: Payload,
    ) -> Result<Box<dyn BaseMessage>, MappingError> {
        match msg_type {
            "message" => Ok(Box::new(decode_into(
                msg_type,
                Message::default(),
                payload,
            )?)),
            "text" => Ok(Box::new(decode_into(msg_type, Text::default(), payload)?)),
            _ => Err(MappingError::UnknownMessageType(msg_type.to_owned())),
        }
    }
}

type Decoder = Arc<dyn Fn(&str, Payload) -> Result<Box<dyn BaseMessage>, MappingError> + Send + Sync>;

/// Registry-backed mapper.
///
/// Registration happens before the mapper is shared; lookups afterwards only
/// read the registry.
#[derive(Clone, Default)]
pub struct DynamicMapper {
    decoders: HashMap<String, Decoder>,
}

impl DynamicMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` using its `Default` value as the zero value.
    pub fn register<T: TypedMessage>(&mut self) -> Result<(), MappingError> {
        self.register_factory(T::default)
    }

    /// Registers a shape with an explicit constructor for its zero value.
    ///
    /// The identifier is read from a freshly constructed instance and must be
    /// non-empty and free of whitespace.
    pub fn register_factory<T, F>(&mut self, factory: F) -> Result<(), MappingError>
    where
        T: TypedMessage,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let msg_type = factory().msg_type().to_owned();

        if msg_type.is_empty() || msg_type.chars().any(char::is_whitespace) {
            return Err(MappingError::InvalidMessageShape(
                std::any::type_name::<T>().to_owned(),
            ));
        }

        let decoder: Decoder = Arc::new(move |msg_type: &str, payload: Payload| {
            let message = decode_into(msg_type, factory(), payload)?;
            Ok(Box::new(message) as Box<dyn BaseMessage>)
        });

        self.decoders.insert(msg_type, decoder);
        Ok(())
    }

    pub fn is_registered(&self, msg_type: &str) -> bool {
        self.decoders.contains_key(msg_type)
    }

    pub fn registered_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl MessageMapper for DynamicMapper {
    fn map_message(
        &self,
        msg_type: &str,
        payload: Payload,
    ) -> Result<Box<dyn BaseMessage>, MappingError> {
        let Some(decoder) = self.decoders.get(msg_type) else {
            return Err(MappingError::NoMapping(msg_type.to_owned()));
        };

        decoder(msg_type, payload)
    }
}

impl fmt::Debug for DynamicMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicMapper")
            .field("registered", &self.registered_types())
            .finish()
    }
}
