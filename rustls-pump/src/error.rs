use std::error::Error as StdError;
use std::fmt;
use std::io;

/// rustls-pump reports failures using this type.
///
/// The first three variants are *fatal*: once the adapter has returned one
/// of them it records it, and every later pump operation reports the same
/// error again without touching the engine or the buffers.  A [`Misuse`] is
/// a caller bug and is never recorded.
#[non_exhaustive]
#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    /// The TLS engine rejected the peer's data or failed internally.
    Tls(rustls::Error),

    /// The transport ended without the peer closing the session cleanly,
    /// or ended while the handshake was still in progress.
    UnexpectedEof,

    /// Any other failure reported by an engine.
    General(String),

    /// The adapter was used in a way its state does not allow.
    Misuse(Misuse),
}

/// Ways of driving an adapter that are always a caller error.
#[non_exhaustive]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Misuse {
    /// A certificate decision was supplied while no selection was pending.
    ///
    /// This is what a second answer to the same selection produces.
    NoPendingSelection,

    /// The engine tried to suspend for certificate selection while a
    /// selection was already pending.
    SelectionAlreadyPending,

    /// The adapter has been closed.
    Closed,

    /// Plaintext was offered after `shutdown()`.
    WriteAfterShutdown,

    /// `release_client_hello()` was called while no ClientHello was held.
    ClientHelloNotHeld,
}

impl From<rustls::Error> for Error {
    #[inline]
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}

impl From<Misuse> for Error {
    #[inline]
    fn from(e: Misuse) -> Self {
        Self::Misuse(e)
    }
}

impl Error {
    /// True if this error is recorded by the adapter and repeated by every
    /// later operation.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Misuse(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Tls(ref err) => write!(f, "tls failure: {}", err),
            Self::UnexpectedEof => write!(f, "peer closed connection without sending close_notify"),
            Self::General(ref why) => write!(f, "engine failure: {}", why),
            Self::Misuse(ref why) => write!(f, "adapter misused: {}", why),
        }
    }
}

impl fmt::Display for Misuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NoPendingSelection => write!(f, "no certificate selection is pending"),
            Self::SelectionAlreadyPending => {
                write!(f, "a certificate selection is already pending")
            }
            Self::Closed => write!(f, "adapter is closed"),
            Self::WriteAfterShutdown => write!(f, "write after shutdown"),
            Self::ClientHelloNotHeld => write!(f, "no ClientHello is being held"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Tls(err) => Some(err),
            _ => None,
        }
    }
}

impl StdError for Misuse {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match e {
            Error::Tls(_) => io::ErrorKind::InvalidData,
            Error::UnexpectedEof => io::ErrorKind::UnexpectedEof,
            Error::General(_) | Error::Misuse(_) => io::ErrorKind::Other,
        };
        Self::new(kind, e)
    }
}
