// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::MqttPacket;
use std::fmt::{self, Display};
use std::io;
use tokio::sync::{mpsc, oneshot};

use crate::commands::{
    AckWaiterCmd, EncoderCmd, HeartbeatCmd, Qos1Cmd, Qos2Cmd, SessionEvent, SupervisorCmd,
};

/// Represent the types of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Error occurred while performing I/O.
    IoError,

    /// Packet encode error.
    EncodeError,

    /// Packet decode error.
    DecodeError,

    /// Socket stream error.
    SocketError,

    /// Host name did not resolve.
    DnsError,

    /// Cert files error.
    CertError,

    /// A packet id is already in flight.
    PidError,

    /// mpsc/oneshot channel error, the peer task is gone.
    ChannelError,

    /// Operation is not valid in the current connection status.
    InvalidClientStatus,

    /// Retry budget or ack deadline ran out.
    Timeout,

    /// The caller dropped the operation before it finished.
    Cancelled,

    /// The peer answered with a failure code.
    ProtocolError,
}

#[derive(Debug, Clone)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
        }
    }

    pub fn from_string(kind: ErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_string(ErrorKind::IoError, format!("IoError {err}"))
    }
}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Self::from_string(ErrorKind::EncodeError, format!("{err:?}"))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Self::from_string(ErrorKind::DecodeError, format!("{err:?}"))
    }
}

impl From<codec::FrameError> for Error {
    fn from(err: codec::FrameError) -> Self {
        Self::from_string(ErrorKind::DecodeError, err.to_string())
    }
}

impl From<codec::TopicError> for Error {
    fn from(err: codec::TopicError) -> Self {
        Self::from_string(ErrorKind::EncodeError, format!("Invalid topic: {err:?}"))
    }
}

impl From<codec::utils::ClientIdError> for Error {
    fn from(err: codec::utils::ClientIdError) -> Self {
        Self::from_string(ErrorKind::EncodeError, format!("Invalid client id: {err:?}"))
    }
}

impl From<tokio_rustls::rustls::Error> for Error {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::from_string(ErrorKind::CertError, format!("Rustls error: {err}"))
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(err: oneshot::error::RecvError) -> Self {
        Self::from_string(
            ErrorKind::ChannelError,
            format!("Reply channel dropped: {err}"),
        )
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        Self::new(ErrorKind::Timeout, "Deadline elapsed")
    }
}

macro_rules! convert_send_error {
    ($cmd_type: ident) => {
        impl From<mpsc::error::SendError<$cmd_type>> for Error {
            fn from(err: mpsc::error::SendError<$cmd_type>) -> Self {
                Self::from_string(
                    ErrorKind::ChannelError,
                    format!("{} channel error: {}", stringify!($cmd_type), err),
                )
            }
        }
    };
}

convert_send_error!(Qos1Cmd);
convert_send_error!(Qos2Cmd);
convert_send_error!(AckWaiterCmd);
convert_send_error!(HeartbeatCmd);
convert_send_error!(EncoderCmd);
convert_send_error!(SupervisorCmd);
convert_send_error!(SessionEvent);
convert_send_error!(MqttPacket);
