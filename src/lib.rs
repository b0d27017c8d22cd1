// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod amqp;
pub mod backoff;
pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod emitter;
pub mod errors;
pub mod exchange;
pub mod listener;
pub mod mapper;
pub mod message;
pub mod queue;
pub mod topology;
pub mod transport;
