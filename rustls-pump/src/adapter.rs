use std::fmt;
use std::io;

use crate::buffer::{
    SegmentedBuffer, GROWTH_CHUNK_SIZE, INITIAL_CHUNK_SIZE, INITIAL_CLIENT_CHUNK_SIZE,
};
use crate::engine::{EngineContext, Endpoints, HandshakeEngine, Progress, ResumeFn, Role};
use crate::error::{Error, Misuse};
use crate::hello::{ClientHello, ClientHelloMode, ClientHelloSniffer, MAX_CLIENT_HELLO_RECORD};
use crate::latch::{CertificateSelectionLatch, SelectionContext};
use crate::log::{debug, trace, warn};
use crate::observer::Observer;

/// What an end of stream without a close notification means once the
/// handshake is complete.  During the handshake it is always fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EofPolicy {
    /// Treat it like a clean close: [`Status::PeerClosed`].
    Allow,
    /// Fail with [`Error::UnexpectedEof`], which is fatal.
    Reject,
}

/// Common configuration for a [`TlsAdapter`].
///
/// Make one with [`AdapterConfig::default`] and adjust the fields you care
/// about.
#[derive(Clone, Debug)]
pub struct AdapterConfig {
    /// Size of the first inbound chunk.  `None` picks by role:
    /// [`INITIAL_CLIENT_CHUNK_SIZE`] for an initiator,
    /// [`INITIAL_CHUNK_SIZE`] for a responder.
    pub initial_chunk_size: Option<usize>,

    /// Size of every later chunk, in both directions.
    pub growth_chunk_size: usize,

    /// Whether a responder inspects the client's first record.  Ignored by
    /// initiators.
    pub client_hello: ClientHelloMode,

    /// Capacity of the side buffer used to inspect the first record.
    pub max_client_hello_size: usize,

    /// How [`TlsAdapter::decrypt_to_plaintext`] reports a truncated stream.
    pub eof_policy: EofPolicy,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            initial_chunk_size: None,
            growth_chunk_size: GROWTH_CHUNK_SIZE,
            client_hello: ClientHelloMode::Pass,
            max_client_hello_size: MAX_CLIENT_HELLO_RECORD,
            eof_policy: EofPolicy::Reject,
        }
    }
}

/// Where a [`TlsAdapter`] is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// The handshake is in progress.
    Handshaking,
    /// The handshake is suspended on certificate selection.
    AwaitingCertificate,
    /// Application data can flow both ways.
    HandshakeComplete,
    /// We sent a close notification; the peer may still send data.
    ShutdownPending,
    /// Nothing more will happen.
    Closed,
}

/// Non-fatal outcome of a pump operation.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// This many bytes of plaintext were consumed or produced.
    ///
    /// From [`TlsAdapter::pump_handshake`], `Transferred(0)` means the
    /// handshake is complete.
    Transferred(usize),
    /// Nothing can happen until more ciphertext arrives or queued
    /// ciphertext is drained.
    WouldBlock,
    /// The handshake waits for [`TlsAdapter::supply_decision`].
    AwaitingCertificate,
    /// The handshake waits for [`TlsAdapter::release_client_hello`].
    AwaitingClientHello,
    /// The peer closed the session cleanly.
    PeerClosed,
}

/// Pumps ciphertext and plaintext between a non-blocking transport and a
/// synchronous [`HandshakeEngine`].
///
/// The transport side calls [`Self::feed_ciphertext`] whenever bytes arrive
/// and [`Self::drain_ciphertext`] whenever it can send.  The application
/// side calls [`Self::encrypt_plaintext`] and
/// [`Self::decrypt_to_plaintext`].  Until the handshake completes, each of
/// those runs at most one handshake step and reports whether it is waiting
/// ([`Status::WouldBlock`], [`Status::AwaitingCertificate`],
/// [`Status::AwaitingClientHello`]).  No call ever blocks.
///
/// Fatal errors are sticky: after one is returned, every later pump
/// operation returns a clone of it without touching the engine or the
/// buffers.  Queued ciphertext (such as the alert describing the error) can
/// still be drained.
pub struct TlsAdapter<E: HandshakeEngine> {
    engine: E,
    role: Role,
    state: State,
    incoming: SegmentedBuffer,
    outgoing: SegmentedBuffer,
    latch: CertificateSelectionLatch<ResumeFn<E>>,
    sniffer: Option<ClientHelloSniffer>,
    client_hello: Option<ClientHello>,
    eof_policy: EofPolicy,
    handshake_started: bool,
    handshake_complete: bool,
    shutdown_sent: bool,
    shutdown_received: bool,
    error: Option<Error>,
    observer: Option<Box<dyn Observer>>,
}

impl<E: HandshakeEngine> TlsAdapter<E> {
    /// Wrap `engine`.
    pub fn new(engine: E, config: &AdapterConfig) -> Self {
        let role = engine.role();
        let initial = config
            .initial_chunk_size
            .unwrap_or(match role {
                Role::Initiator => INITIAL_CLIENT_CHUNK_SIZE,
                Role::Responder => INITIAL_CHUNK_SIZE,
            });

        let sniffer = match (role, config.client_hello) {
            (Role::Responder, ClientHelloMode::Inspect) => Some(ClientHelloSniffer::new(
                config.max_client_hello_size,
                false,
            )),
            (Role::Responder, ClientHelloMode::Hold) => Some(ClientHelloSniffer::new(
                config.max_client_hello_size,
                true,
            )),
            _ => None,
        };

        debug!("new {:?} adapter", role);
        Self {
            engine,
            role,
            state: State::Handshaking,
            incoming: SegmentedBuffer::with_chunk_sizes(initial, config.growth_chunk_size),
            outgoing: SegmentedBuffer::with_chunk_sizes(
                INITIAL_CHUNK_SIZE,
                config.growth_chunk_size,
            ),
            latch: CertificateSelectionLatch::new(),
            sniffer,
            client_hello: None,
            eof_policy: config.eof_policy,
            handshake_started: false,
            handshake_complete: false,
            shutdown_sent: false,
            shutdown_received: false,
            error: None,
            observer: None,
        }
    }

    /// Install an observer, replacing any previous one.
    pub fn set_observer(&mut self, observer: Box<dyn Observer>) {
        self.observer = Some(observer);
    }

    /// Append ciphertext received from the peer.
    ///
    /// Returns how many bytes were accepted.  That is all of them, except
    /// while a held ClientHello has filled its side buffer (a prefix,
    /// possibly empty; offer the rest again after
    /// [`Self::release_client_hello`]) and once the adapter is closed or
    /// has failed, when it is always 0.  Use [`Self::try_feed_ciphertext`]
    /// to tell those apart.
    pub fn feed_ciphertext(&mut self, data: &[u8]) -> usize {
        if self.state == State::Closed {
            return 0;
        }

        let Some(sniffer) = self.sniffer.as_mut() else {
            trace!("fed {} ciphertext bytes", data.len());
            self.incoming.write(data);
            return data.len();
        };

        let (taken, finished) = sniffer.offer(data);
        let inspecting = !sniffer.is_complete() || sniffer.is_holding();
        if let Some(hello) = finished {
            if let (Some(hello), Some(observer)) = (&hello, self.observer.as_mut()) {
                observer.client_hello(hello);
            }
            self.client_hello = hello;
        }

        if inspecting {
            return taken;
        }
        self.finish_sniffing();
        self.incoming.write(&data[taken..]);
        data.len()
    }

    /// Like [`Self::feed_ciphertext`], but a closed adapter reports
    /// [`Misuse::Closed`] and a failed one its recorded error.  `Ok` with a
    /// short count only ever means a held ClientHello is pushing back.
    pub fn try_feed_ciphertext(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.check_usable()?;
        Ok(self.feed_ciphertext(data))
    }

    /// Record that the transport will deliver no more ciphertext.
    pub fn feed_eof(&mut self) {
        if self.state == State::Closed {
            return;
        }
        debug!("transport reached end of stream");
        self.finish_sniffing();
        self.incoming.mark_eof();
    }

    /// Copy queued ciphertext into `out`, returning how many bytes.
    pub fn drain_ciphertext(&mut self, out: &mut [u8]) -> usize {
        let used = self.outgoing.read(out);
        if used > 0 {
            trace!("drained {} ciphertext bytes", used);
        }
        used
    }

    /// Write queued ciphertext to `wr` in one vectored write.
    pub fn write_ciphertext_to(&mut self, wr: &mut dyn io::Write) -> io::Result<usize> {
        self.outgoing.write_to(wr)
    }

    /// Queued ciphertext as a scatter list, for transports that write
    /// vectored.  Follow with [`Self::commit_ciphertext`].
    pub fn ciphertext_slices(&self) -> Vec<io::IoSlice<'_>> {
        self.outgoing.peek_multiple()
    }

    /// Discard `used` bytes of queued ciphertext after sending them.
    pub fn commit_ciphertext(&mut self, used: usize) {
        self.outgoing.commit(used);
    }

    /// How many bytes of ciphertext are queued for the peer.
    pub fn pending_ciphertext(&self) -> usize {
        self.outgoing.len()
    }

    /// True if there is ciphertext to send.
    pub fn wants_write(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Encrypt `data` for the peer.
    ///
    /// While handshaking this runs one handshake step instead and returns
    /// how it went; retry once the handshake is complete.  Afterwards it
    /// returns `Transferred(n)` for the prefix of `data` accepted.
    pub fn encrypt_plaintext(&mut self, data: &[u8]) -> Result<Status, Error> {
        self.check_usable()?;
        if self.shutdown_sent {
            return Err(Misuse::WriteAfterShutdown.into());
        }
        if !self.handshake_complete {
            let status = self.handshake_step()?;
            if !self.handshake_complete {
                return Ok(status);
            }
        }
        if data.is_empty() {
            return Ok(Status::Transferred(0));
        }

        let mut io = Endpoints::new(&mut self.incoming, &mut self.outgoing);
        let result = self.engine.write_plaintext(&mut io, data);
        self.classify(result, EofPolicy::Reject)
    }

    /// Decrypt received ciphertext into `out`.
    ///
    /// Gated on the handshake like [`Self::encrypt_plaintext`].  Afterwards
    /// returns `Transferred(n)`, `WouldBlock` when no complete record is
    /// buffered, or `PeerClosed` once the peer has closed.  A stream that
    /// ends without a close notification is handled according to
    /// [`AdapterConfig::eof_policy`].
    pub fn decrypt_to_plaintext(&mut self, out: &mut [u8]) -> Result<Status, Error> {
        self.check_usable()?;
        if !self.handshake_complete {
            let status = self.handshake_step()?;
            if !self.handshake_complete {
                return Ok(status);
            }
        }
        if out.is_empty() {
            return Ok(Status::Transferred(0));
        }

        let mut io = Endpoints::new(&mut self.incoming, &mut self.outgoing);
        let result = self.engine.read_plaintext(&mut io, out);
        let policy = self.eof_policy;
        self.classify(result, policy)
    }

    /// Run at most one handshake step.
    pub fn pump_handshake(&mut self) -> Result<Status, Error> {
        self.check_usable()?;
        match self.handshake_complete {
            true => Ok(Status::Transferred(0)),
            false => self.handshake_step(),
        }
    }

    /// Answer a pending certificate selection.
    ///
    /// The captured continuation runs exactly once, here; the handshake
    /// then carries on at the next pump operation.  Answering when nothing
    /// is pending (including answering twice) is
    /// [`Misuse::NoPendingSelection`].
    pub fn supply_decision(&mut self, decision: E::Decision) -> Result<(), Error> {
        self.check_usable()?;
        let (context, resume) = self.latch.release()?;
        debug!("certificate decision supplied for {:?}", context.server_name);
        self.state = State::Handshaking;

        let mut io = Endpoints::new(&mut self.incoming, &mut self.outgoing);
        match resume(&mut self.engine, &mut io, decision) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Hand a held ClientHello, and everything received after it, to the
    /// engine.
    pub fn release_client_hello(&mut self) -> Result<(), Error> {
        self.check_usable()?;
        if !self
            .sniffer
            .as_ref()
            .is_some_and(ClientHelloSniffer::is_holding)
        {
            return Err(Misuse::ClientHelloNotHeld.into());
        }
        self.finish_sniffing();
        Ok(())
    }

    /// Queue a close notification for the peer.  Further plaintext is
    /// refused; decryption carries on until the peer closes too.
    ///
    /// Shutting down before the handshake completes closes the adapter.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        self.check_usable()?;
        if self.shutdown_sent {
            return Ok(());
        }

        let mut io = Endpoints::new(&mut self.incoming, &mut self.outgoing);
        if let Err(err) = self.engine.shutdown(&mut io) {
            return Err(self.fail(err));
        }
        self.shutdown_sent = true;
        self.state = match self.handshake_complete && !self.shutdown_received {
            true => State::ShutdownPending,
            false => State::Closed,
        };
        self.latch.cancel();
        debug!("shutdown sent; now {:?}", self.state);
        Ok(())
    }

    /// Release all buffered data and any pending certificate selection.
    /// Every later pump operation fails with [`Misuse::Closed`] (or the
    /// recorded fatal error).
    pub fn close(&mut self) {
        if self.state != State::Closed {
            debug!("closing {:?} adapter", self.role);
        }
        self.state = State::Closed;
        self.incoming.reset();
        self.outgoing.reset();
        self.latch.cancel();
        self.sniffer = None;
    }

    /// True once the handshake has completed.
    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    /// The application protocol agreed during the handshake.
    pub fn negotiated_protocol(&self) -> Option<&[u8]> {
        match self.handshake_complete {
            true => self.engine.negotiated_protocol(),
            false => None,
        }
    }

    /// The peer's end-entity certificate, DER encoded.
    pub fn peer_identity(&self) -> Option<&[u8]> {
        match self.handshake_complete {
            true => self.engine.peer_identity(),
            false => None,
        }
    }

    /// The resumption ticket this session's ClientHello presented, as an
    /// opaque blob.  `None` for a full handshake.
    ///
    /// An initiator knows it from the hello it sent.  A responder knows it
    /// from an inspected hello (see [`AdapterConfig::client_hello`]), or
    /// from the engine.
    pub fn session_ticket(&self) -> Option<&[u8]> {
        self.engine
            .session_ticket()
            .or_else(|| {
                self.client_hello
                    .as_ref()
                    .and_then(ClientHello::resumption_ticket)
            })
    }

    /// The server name the client asked for, as known to the engine or
    /// from the ClientHello.
    pub fn server_name(&self) -> Option<&str> {
        self.engine
            .server_name()
            .or_else(|| {
                self.client_hello
                    .as_ref()
                    .and_then(ClientHello::server_name)
            })
    }

    /// The ClientHello: for an initiator the one it sent, for a responder
    /// the one it inspected, if inspection was configured and the first
    /// record held one.
    pub fn client_hello(&self) -> Option<&ClientHello> {
        self.client_hello.as_ref()
    }

    /// What the pending certificate selection is for.
    pub fn selection_context(&self) -> Option<&SelectionContext> {
        self.latch.context()
    }

    /// Where the adapter is in its life.
    pub fn state(&self) -> State {
        self.state
    }

    /// Initiator or responder.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The recorded fatal error, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// The wrapped engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn check_usable(&self) -> Result<(), Error> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.state == State::Closed {
            return Err(Misuse::Closed.into());
        }
        Ok(())
    }

    fn handshake_step(&mut self) -> Result<Status, Error> {
        match self.state {
            State::Handshaking => {}
            State::AwaitingCertificate => return Ok(Status::AwaitingCertificate),
            _ => return Ok(Status::Transferred(0)),
        }

        if let Some(sniffer) = &self.sniffer {
            return Ok(match sniffer.is_holding() {
                true => Status::AwaitingClientHello,
                false => Status::WouldBlock,
            });
        }

        let first_step = !self.handshake_started;
        if first_step {
            self.handshake_started = true;
            if let Some(observer) = self.observer.as_mut() {
                observer.handshake_started();
            }
        }

        let mut cx = EngineContext::new(
            Endpoints::new(&mut self.incoming, &mut self.outgoing),
            &mut self.latch,
        );
        let result = self.engine.handshake(&mut cx);

        if first_step && self.role == Role::Initiator {
            self.client_hello = self.sent_client_hello();
        }

        match result {
            Ok(Progress::Done(())) => {
                self.complete_handshake();
                Ok(Status::Transferred(0))
            }
            Ok(Progress::WantRead | Progress::WantWrite) => Ok(Status::WouldBlock),
            Ok(Progress::Deferred) => self.await_certificate(),
            Ok(Progress::ZeroReturn) => Err(self.fail(Error::UnexpectedEof)),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn await_certificate(&mut self) -> Result<Status, Error> {
        let Some(context) = self.latch.context_mut() else {
            return Err(self.fail(Error::General(
                "engine deferred without a pending certificate selection".into(),
            )));
        };
        if let Some(hello) = &self.client_hello {
            context.ocsp_requested |= hello.ocsp_requested();
        }

        debug!("handshake waits for certificate selection");
        self.state = State::AwaitingCertificate;
        if let (Some(observer), Some(context)) = (self.observer.as_mut(), self.latch.context()) {
            observer.certificate_needed(context);
        }
        Ok(Status::AwaitingCertificate)
    }

    fn complete_handshake(&mut self) {
        debug!("{:?} handshake complete", self.role);
        self.handshake_complete = true;
        self.state = State::HandshakeComplete;
        if let Some(observer) = self.observer.as_mut() {
            observer.handshake_done();
        }
    }

    fn classify(
        &mut self,
        result: Result<Progress<usize>, Error>,
        policy: EofPolicy,
    ) -> Result<Status, Error> {
        match result {
            Ok(Progress::Done(used)) => Ok(Status::Transferred(used)),
            Ok(Progress::WantRead | Progress::WantWrite) => Ok(Status::WouldBlock),
            Ok(Progress::ZeroReturn) => Ok(self.peer_closed()),
            Err(Error::UnexpectedEof) if policy == EofPolicy::Allow => {
                debug!("peer ended the stream without close_notify");
                Ok(self.peer_closed())
            }
            Ok(Progress::Deferred) => Err(self.fail(Error::General(
                "engine deferred outside the handshake".into(),
            ))),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn peer_closed(&mut self) -> Status {
        if !self.shutdown_received {
            debug!("peer closed the session");
            self.shutdown_received = true;
        }
        if self.shutdown_sent {
            self.state = State::Closed;
        }
        Status::PeerClosed
    }

    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            warn!("{:?} adapter failed: {}", self.role, err);
            self.error = Some(err.clone());
            self.state = State::Closed;
            self.incoming.reset();
            self.latch.cancel();
            self.sniffer = None;
        }
        err
    }

    /// Parse our own first flight, still queued in `outgoing`.
    fn sent_client_hello(&self) -> Option<ClientHello> {
        let mut record = Vec::new();
        for run in self.outgoing.peek_multiple() {
            record.extend_from_slice(&run);
            if record.len() >= MAX_CLIENT_HELLO_RECORD {
                break;
            }
        }
        ClientHello::parse(&record)
    }

    fn finish_sniffing(&mut self) {
        if let Some(sniffer) = self.sniffer.take() {
            let buffered = sniffer.into_buffered();
            trace!("passing {} sniffed bytes to the engine", buffered.len());
            self.incoming.write(&buffered);
        }
    }
}

impl<E: HandshakeEngine> fmt::Debug for TlsAdapter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAdapter")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("incoming", &self.incoming.len())
            .field("outgoing", &self.outgoing.len())
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
