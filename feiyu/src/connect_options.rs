// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::utils::random_client_id;
use codec::{ProtocolLevel, QoS};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

/// Self signed certificate chain, generated with `openssl` or other tools.
#[derive(Debug, Clone)]
pub struct SelfSignedTls {
    pub root_ca_pem: PathBuf,
}

#[derive(Debug, Clone)]
pub enum TlsType {
    /// Signed by a public root CA, like `Let's Encrypt`; trust anchors
    /// come from the webpki root set.
    CASigned,

    /// Trust a local root certificate file instead.
    SelfSigned(SelfSignedTls),
}

/// Plain TCP endpoint, `host:port`. The host is resolved again on every
/// connect attempt.
#[derive(Debug, Clone)]
pub struct MqttConnect {
    pub address: String,
}

/// TLS over TCP endpoint.
#[derive(Debug, Clone)]
pub struct MqttsConnect {
    pub address: String,

    /// Server name presented during the TLS handshake.
    pub domain: String,

    pub tls_type: TlsType,
}

/// In-process loopback endpoint, used by tests and benchmarks.
///
/// Each connect attempt creates a fresh duplex pair and hands the server
/// end to this acceptor channel.
#[derive(Debug, Clone)]
pub struct MemoryConnect {
    pub accept_tx: mpsc::UnboundedSender<DuplexStream>,
}

#[derive(Debug, Clone)]
pub enum ConnectType {
    Mqtt(MqttConnect),
    Mqtts(MqttsConnect),
    Memory(MemoryConnect),
}

/// Message the server publishes on ungraceful loss of this client.
#[derive(Debug, Clone)]
pub struct LastWill {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Client side configuration.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    connect_type: ConnectType,
    protocol_level: ProtocolLevel,
    client_id: String,
    clean_session: bool,
    username: Option<String>,
    password: Option<Vec<u8>>,
    last_will: Option<LastWill>,

    keep_alive: Duration,
    connect_timeout: Duration,

    max_publish_retries: u32,
    publish_retry_interval: Duration,

    max_retained_packet_ids: usize,
    max_packet_id_retention: Duration,

    max_reconnect_attempts: u32,

    max_frame_size: usize,
    max_packet_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_type: ConnectType::Mqtt(MqttConnect {
                address: "127.0.0.1:1883".to_string(),
            }),
            protocol_level: ProtocolLevel::V311,
            client_id: random_client_id(8),
            clean_session: true,
            username: None,
            password: None,
            last_will: None,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            max_publish_retries: 3,
            publish_retry_interval: Duration::from_secs(5),
            max_retained_packet_ids: 4096,
            max_packet_id_retention: Duration::from_secs(300),
            max_reconnect_attempts: 3,
            max_frame_size: 128 * 1024,
            max_packet_size: 1024 * 1024,
        }
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn new(address: &str) -> Self {
        Self {
            connect_type: ConnectType::Mqtt(MqttConnect {
                address: address.to_string(),
            }),
            ..Self::default()
        }
    }

    pub fn set_connect_type(&mut self, connect_type: ConnectType) -> &mut Self {
        self.connect_type = connect_type;
        self
    }

    #[must_use]
    pub const fn connect_type(&self) -> &ConnectType {
        &self.connect_type
    }

    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    pub fn set_client_id(&mut self, client_id: &str) -> &mut Self {
        self.client_id = client_id.to_string();
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.clean_session = clean_session;
        self
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn set_credentials(&mut self, username: &str, password: &[u8]) -> &mut Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_vec());
        self
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_deref()
    }

    pub fn set_last_will(&mut self, last_will: LastWill) -> &mut Self {
        self.last_will = Some(last_will);
        self
    }

    #[must_use]
    pub const fn last_will(&self) -> Option<&LastWill> {
        self.last_will.as_ref()
    }

    pub fn set_keep_alive(&mut self, keep_alive: Duration) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn set_connect_timeout(&mut self, connect_timeout: Duration) -> &mut Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn set_max_publish_retries(&mut self, retries: u32) -> &mut Self {
        self.max_publish_retries = retries;
        self
    }

    #[must_use]
    pub const fn max_publish_retries(&self) -> u32 {
        self.max_publish_retries
    }

    pub fn set_publish_retry_interval(&mut self, interval: Duration) -> &mut Self {
        self.publish_retry_interval = interval;
        self
    }

    #[must_use]
    pub const fn publish_retry_interval(&self) -> Duration {
        self.publish_retry_interval
    }

    pub fn set_max_retained_packet_ids(&mut self, capacity: usize) -> &mut Self {
        self.max_retained_packet_ids = capacity;
        self
    }

    #[must_use]
    pub const fn max_retained_packet_ids(&self) -> usize {
        self.max_retained_packet_ids
    }

    pub fn set_max_packet_id_retention(&mut self, retention: Duration) -> &mut Self {
        self.max_packet_id_retention = retention;
        self
    }

    #[must_use]
    pub const fn max_packet_id_retention(&self) -> Duration {
        self.max_packet_id_retention
    }

    pub fn set_max_reconnect_attempts(&mut self, attempts: u32) -> &mut Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect_attempts
    }

    pub fn set_max_frame_size(&mut self, size: usize) -> &mut Self {
        self.max_frame_size = size;
        self
    }

    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn set_max_packet_size(&mut self, size: usize) -> &mut Self {
        self.max_packet_size = size;
        self
    }

    #[must_use]
    pub const fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}
