// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::DuplexStream;
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{self, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;

use crate::connect_options::{ConnectType, MemoryConnect, MqttsConnect, TlsType};
use crate::error::{Error, ErrorKind};

/// Size of one in-memory loopback window.
const MEMORY_PIPE_CAPACITY: usize = 64 * 1024;

/// Established byte stream under the transport driver.
///
/// TLS, when enabled, is layered before the driver loops ever see the
/// stream.
pub enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Memory(DuplexStream),
}

impl Stream {
    /// Open a stream for `connect_type`.
    ///
    /// Host names are resolved here, once per attempt.
    ///
    /// # Errors
    ///
    /// Returns error if resolution, the TCP connect or the TLS handshake
    /// fails or exceeds `connect_timeout`.
    pub async fn connect(
        connect_type: &ConnectType,
        connect_timeout: Duration,
    ) -> Result<Self, Error> {
        let connecting = async {
            match connect_type {
                ConnectType::Mqtt(mqtt) => Self::new_tcp(&mqtt.address).await,
                ConnectType::Mqtts(mqtts) => Self::new_tls(mqtts).await,
                ConnectType::Memory(memory) => Self::new_memory(memory),
            }
        };
        tokio::time::timeout(connect_timeout, connecting)
            .await
            .map_err(|_elapsed| {
                Error::new(ErrorKind::SocketError, "Connect attempt timed out")
            })?
    }

    async fn new_tcp(address: &str) -> Result<Self, Error> {
        let addr = lookup_host(address)
            .await
            .map_err(|err| {
                Error::from_string(ErrorKind::DnsError, format!("Resolve {address}: {err}"))
            })?
            .next()
            .ok_or_else(|| {
                Error::from_string(ErrorKind::DnsError, format!("No address for {address}"))
            })?;
        let socket = TcpStream::connect(addr).await?;
        Ok(Self::Tcp(socket))
    }

    async fn new_tls(mqtts: &MqttsConnect) -> Result<Self, Error> {
        let mut root_store = RootCertStore::empty();
        match &mqtts.tls_type {
            TlsType::CASigned => {
                root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                    OwnedTrustAnchor::from_subject_spki_name_constraints(
                        ta.subject,
                        ta.spki,
                        ta.name_constraints,
                    )
                }));
            }
            TlsType::SelfSigned(self_signed) => {
                let fd = File::open(&self_signed.root_ca_pem)?;
                let certs = rustls_pemfile::certs(&mut BufReader::new(fd))?;
                let (added, _ignored) = root_store.add_parsable_certificates(&certs);
                if added == 0 {
                    return Err(Error::new(
                        ErrorKind::CertError,
                        "No usable certificate in root ca file",
                    ));
                }
            }
        }

        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let domain = ServerName::try_from(mqtts.domain.as_str()).map_err(|err| {
            Error::from_string(
                ErrorKind::CertError,
                format!("Invalid domain {}: {err}", mqtts.domain),
            )
        })?;

        let addr = lookup_host(&mqtts.address)
            .await
            .map_err(|err| {
                Error::from_string(
                    ErrorKind::DnsError,
                    format!("Resolve {}: {err}", mqtts.address),
                )
            })?
            .next()
            .ok_or_else(|| {
                Error::from_string(
                    ErrorKind::DnsError,
                    format!("No address for {}", mqtts.address),
                )
            })?;
        let socket = TcpStream::connect(addr).await?;
        let socket = connector.connect(domain, socket).await?;
        Ok(Self::Tls(Box::new(socket)))
    }

    fn new_memory(memory: &MemoryConnect) -> Result<Self, Error> {
        let (client, server) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
        memory.accept_tx.send(server).map_err(|_err| {
            Error::new(ErrorKind::SocketError, "Loopback acceptor is gone")
        })?;
        Ok(Self::Memory(client))
    }
}
