use crate::buffer::SegmentedBuffer;
use crate::error::Error;
use crate::latch::{CertificateSelectionLatch, SelectionContext};

/// Which side of the handshake an engine plays.  Fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The client: speaks first.
    Initiator,
    /// The server: waits for the ClientHello.
    Responder,
}

/// The outcome of one call into a [`HandshakeEngine`].
///
/// Everything except `Done` asks the caller to come back later; engine
/// failures are reported through `Err` instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress<T> {
    /// The operation completed with this value.
    Done(T),
    /// The engine needs more ciphertext from the peer.
    WantRead,
    /// The engine needs its output drained first.
    WantWrite,
    /// The peer ended the session.  For plaintext reads this means a clean
    /// close; during the handshake any end of stream is premature.
    ZeroReturn,
    /// The engine armed the certificate selection latch and is waiting for
    /// a decision.
    Deferred,
}

/// The in-memory stream pair an engine reads and writes ciphertext through.
pub struct Endpoints<'a> {
    /// Ciphertext received from the peer.
    pub incoming: &'a mut SegmentedBuffer,
    /// Ciphertext waiting to be sent to the peer.
    pub outgoing: &'a mut SegmentedBuffer,
}

impl<'a> Endpoints<'a> {
    /// Borrow a buffer pair.
    pub fn new(incoming: &'a mut SegmentedBuffer, outgoing: &'a mut SegmentedBuffer) -> Self {
        Self { incoming, outgoing }
    }
}

/// A continuation captured when an engine defers for certificate selection.
///
/// It runs once, with the engine, its endpoints and the caller's decision.
pub type ResumeFn<E> = Box<
    dyn FnOnce(&mut E, &mut Endpoints<'_>, <E as HandshakeEngine>::Decision) -> Result<(), Error>,
>;

/// Everything a handshake step may touch: the endpoints and the adapter's
/// certificate selection latch.
pub struct EngineContext<'a, E: HandshakeEngine> {
    /// Ciphertext in and out.
    pub io: Endpoints<'a>,
    latch: &'a mut CertificateSelectionLatch<ResumeFn<E>>,
}

impl<'a, E: HandshakeEngine> EngineContext<'a, E> {
    /// Bundle endpoints with a latch.
    pub fn new(io: Endpoints<'a>, latch: &'a mut CertificateSelectionLatch<ResumeFn<E>>) -> Self {
        Self { io, latch }
    }

    /// Suspend the handshake until the caller supplies a certificate
    /// decision for `context`.  `resume` then runs exactly once.
    ///
    /// Returns `Progress::Deferred`, which the engine should hand straight
    /// back to its caller.
    pub fn defer_certificate(
        &mut self,
        context: SelectionContext,
        resume: ResumeFn<E>,
    ) -> Result<Progress<()>, Error> {
        self.latch.arm(context, resume)?;
        Ok(Progress::Deferred)
    }
}

/// A synchronous TLS engine.
///
/// Engines read ciphertext from [`Endpoints::incoming`] and write ciphertext
/// to [`Endpoints::outgoing`], and must never block: when the incoming
/// buffer runs dry they return `Progress::WantRead`.  Every call receives
/// its context explicitly.
pub trait HandshakeEngine: Sized {
    /// What the caller supplies to finish a deferred certificate selection.
    type Decision;

    /// Which side this engine plays.
    fn role(&self) -> Role;

    /// Run one handshake step.
    ///
    /// `Done(())` means the handshake is complete.  To wait for certificate
    /// selection, call [`EngineContext::defer_certificate`] and return what
    /// it returns.
    fn handshake(&mut self, cx: &mut EngineContext<'_, Self>) -> Result<Progress<()>, Error>;

    /// Decrypt into `out`, which is never empty.
    fn read_plaintext(
        &mut self,
        io: &mut Endpoints<'_>,
        out: &mut [u8],
    ) -> Result<Progress<usize>, Error>;

    /// Encrypt a prefix of `data`, which is never empty.
    fn write_plaintext(
        &mut self,
        io: &mut Endpoints<'_>,
        data: &[u8],
    ) -> Result<Progress<usize>, Error>;

    /// Queue a close notification for the peer.
    fn shutdown(&mut self, io: &mut Endpoints<'_>) -> Result<(), Error>;

    /// True until the handshake has completed.
    fn is_handshaking(&self) -> bool;

    /// The application protocol agreed during the handshake.
    fn negotiated_protocol(&self) -> Option<&[u8]> {
        None
    }

    /// The peer's end-entity certificate, DER encoded.
    fn peer_identity(&self) -> Option<&[u8]> {
        None
    }

    /// The resumption ticket presented in this session's ClientHello, if
    /// the engine tracks it.
    fn session_ticket(&self) -> Option<&[u8]> {
        None
    }

    /// The server name the client asked for.
    fn server_name(&self) -> Option<&str> {
        None
    }
}
