// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! High throughput MQTT 3.1.1 client.
//!
//! The crate is organised as a pipeline of single-consumer stages bound
//! together by bounded channels: a transport driver shuttles bytes
//! between the socket and a watermarked duplex byte channel, decoder and
//! encoder stages translate between bytes and typed packets, a routing
//! stage dispatches inbound packets, and per-QoS engines own the retry
//! state. A session supervisor runs the connect/reconnect/disconnect
//! lifecycle on top and [`AsyncClient`] is the public face of it all.

pub mod byte_channel;
mod client;
mod commands;
mod connect_options;
mod dedup_cache;
mod engine;
mod error;
mod packet_ids;
mod pipeline;
mod status;
mod supervisor;
pub mod transport;
mod types;

pub use client::{AsyncClient, MessageStream};
pub use connect_options::{
    ConnectOptions, ConnectType, LastWill, MemoryConnect, MqttConnect, MqttsConnect,
    SelfSignedTls, TlsType,
};
pub use dedup_cache::LruDedupCache;
pub use error::{Error, ErrorKind};
pub use packet_ids::PacketIdSource;
pub use status::ConnectionStatus;
pub use types::{DisconnectEvent, DisconnectReason};

// The wire types observable through the public API.
pub use codec::{PublishPacket, QoS, SubscribeAck, SubscribeAckPacket, UnsubscribeAckPacket};
