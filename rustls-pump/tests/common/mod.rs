#![allow(dead_code)]

use std::cell::RefCell;
use std::cmp;
use std::rc::Rc;
pub use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pump::{
    AdapterConfig, ClientHello, EngineContext, Endpoints, Error, HandshakeEngine, Observer,
    Progress, Role, RustlsEngine, SegmentedBuffer, SelectionContext, TlsAdapter,
};

pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
}

// A toy record protocol: [kind][u16 length][payload].  DATA payloads are
// xored with KEY so ciphertext never equals plaintext.
pub const HELLO: u8 = 1;
pub const REPLY: u8 = 2;
pub const CLOSE: u8 = 21;
pub const DATA: u8 = 23;
pub const KEY: u8 = 0x5a;
pub const HELLO_LEN: usize = 64;
pub const MAX_DATA: usize = 1000;
pub const PROTOCOL: &[u8] = b"pump/1";
pub const DEFAULT_CERT: &[u8] = b"default-certificate";

pub fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![kind];
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn hello_frame(name: &str) -> Vec<u8> {
    let mut payload = vec![name.len() as u8];
    payload.extend_from_slice(name.as_bytes());
    payload.resize(HELLO_LEN, 0);
    frame(HELLO, &payload)
}

/// Copy the first `out.len()` unread bytes without consuming them.
fn peek_prefix(buf: &SegmentedBuffer, out: &mut [u8]) -> bool {
    let mut offs = 0;
    for run in buf.peek_multiple() {
        let take = cmp::min(run.len(), out.len() - offs);
        out[offs..offs + take].copy_from_slice(&run[..take]);
        offs += take;
        if offs == out.len() {
            break;
        }
    }
    offs == out.len()
}

/// Take one whole frame, or nothing.
fn take_frame(buf: &mut SegmentedBuffer) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 3];
    if !peek_prefix(buf, &mut header) {
        return None;
    }
    let len = usize::from(u16::from_be_bytes([header[1], header[2]]));
    if buf.len() < header.len() + len {
        return None;
    }

    buf.commit(header.len());
    let mut payload = vec![0u8; len];
    assert_eq!(buf.read(&mut payload), len);
    Some((header[0], payload))
}

fn unexpected(kind: u8) -> Error {
    Error::General(format!("unexpected frame kind {kind}"))
}

/// A deterministic engine speaking the toy protocol.
///
/// The initiator sends HELLO naming a server and waits for REPLY carrying a
/// certificate.  The responder answers HELLO with REPLY, optionally
/// deferring for certificate selection first.
pub struct ScriptedEngine {
    role: Role,
    server_name: Option<String>,
    select_certificate: bool,
    certificate: Option<Vec<u8>>,
    peer_certificate: Option<Vec<u8>>,
    hello_sent: bool,
    complete: bool,
    peer_closed: bool,
    plaintext: Vec<u8>,
    pub calls: usize,
    pub resumes: usize,
}

impl ScriptedEngine {
    fn new(role: Role) -> Self {
        Self {
            role,
            server_name: None,
            select_certificate: false,
            certificate: None,
            peer_certificate: None,
            hello_sent: false,
            complete: false,
            peer_closed: false,
            plaintext: Vec::new(),
            calls: 0,
            resumes: 0,
        }
    }

    pub fn initiator(server_name: &str) -> Self {
        Self {
            server_name: Some(server_name.to_string()),
            ..Self::new(Role::Initiator)
        }
    }

    pub fn responder() -> Self {
        Self::new(Role::Responder)
    }

    pub fn responder_with_selection() -> Self {
        Self {
            select_certificate: true,
            ..Self::new(Role::Responder)
        }
    }

    fn initiator_step(&mut self, io: &mut Endpoints<'_>) -> Result<Progress<()>, Error> {
        if !self.hello_sent {
            let name = self.server_name.clone().unwrap_or_default();
            io.outgoing.write(&hello_frame(&name));
            self.hello_sent = true;
        }

        match take_frame(io.incoming) {
            Some((REPLY, certificate)) => {
                self.peer_certificate = Some(certificate);
                self.complete = true;
                Ok(Progress::Done(()))
            }
            Some((kind, _)) => Err(unexpected(kind)),
            None if io.incoming.is_eof() => Ok(Progress::ZeroReturn),
            None => Ok(Progress::WantRead),
        }
    }

    fn responder_step(&mut self, cx: &mut EngineContext<'_, Self>) -> Result<Progress<()>, Error> {
        if self.server_name.is_none() {
            match take_frame(cx.io.incoming) {
                Some((HELLO, payload)) => {
                    let len = usize::from(payload[0]);
                    let name = String::from_utf8_lossy(&payload[1..1 + len]).into_owned();
                    self.server_name = Some(name);
                }
                Some((kind, _)) => return Err(unexpected(kind)),
                None if cx.io.incoming.is_eof() => return Ok(Progress::ZeroReturn),
                None => return Ok(Progress::WantRead),
            }
        }

        if self.certificate.is_none() {
            if self.select_certificate {
                let context = SelectionContext {
                    server_name: self.server_name.clone(),
                    alpn: vec![PROTOCOL.to_vec()],
                    ocsp_requested: false,
                };
                return cx.defer_certificate(
                    context,
                    Box::new(|engine: &mut Self, _io: &mut Endpoints<'_>, cert: Vec<u8>| {
                        engine.resumes += 1;
                        engine.certificate = Some(cert);
                        Ok(())
                    }),
                );
            }
            self.certificate = Some(DEFAULT_CERT.to_vec());
        }

        if let Some(cert) = &self.certificate {
            cx.io.outgoing.write(&frame(REPLY, cert));
        }
        self.complete = true;
        Ok(Progress::Done(()))
    }
}

impl HandshakeEngine for ScriptedEngine {
    type Decision = Vec<u8>;

    fn role(&self) -> Role {
        self.role
    }

    fn handshake(&mut self, cx: &mut EngineContext<'_, Self>) -> Result<Progress<()>, Error> {
        self.calls += 1;
        match self.role {
            Role::Initiator => self.initiator_step(&mut cx.io),
            Role::Responder => self.responder_step(cx),
        }
    }

    fn read_plaintext(
        &mut self,
        io: &mut Endpoints<'_>,
        out: &mut [u8],
    ) -> Result<Progress<usize>, Error> {
        self.calls += 1;
        if self.plaintext.is_empty() {
            if self.peer_closed {
                return Ok(Progress::ZeroReturn);
            }
            match take_frame(io.incoming) {
                Some((DATA, payload)) => {
                    self.plaintext = payload.iter().map(|b| b ^ KEY).collect();
                }
                Some((CLOSE, _)) => {
                    self.peer_closed = true;
                    return Ok(Progress::ZeroReturn);
                }
                Some((kind, _)) => return Err(unexpected(kind)),
                None if io.incoming.is_eof() => return Err(Error::UnexpectedEof),
                None => return Ok(Progress::WantRead),
            }
        }

        let used = cmp::min(out.len(), self.plaintext.len());
        out[..used].copy_from_slice(&self.plaintext[..used]);
        self.plaintext.drain(..used);
        Ok(Progress::Done(used))
    }

    fn write_plaintext(
        &mut self,
        io: &mut Endpoints<'_>,
        data: &[u8],
    ) -> Result<Progress<usize>, Error> {
        self.calls += 1;
        let used = cmp::min(data.len(), MAX_DATA);
        let sealed: Vec<u8> = data[..used]
            .iter()
            .map(|b| b ^ KEY)
            .collect();
        io.outgoing.write(&frame(DATA, &sealed));
        Ok(Progress::Done(used))
    }

    fn shutdown(&mut self, io: &mut Endpoints<'_>) -> Result<(), Error> {
        io.outgoing.write(&frame(CLOSE, &[]));
        Ok(())
    }

    fn is_handshaking(&self) -> bool {
        !self.complete
    }

    fn negotiated_protocol(&self) -> Option<&[u8]> {
        self.complete.then_some(PROTOCOL)
    }

    fn peer_identity(&self) -> Option<&[u8]> {
        self.peer_certificate.as_deref()
    }

    fn server_name(&self) -> Option<&str> {
        match self.role {
            Role::Responder => self.server_name.as_deref(),
            Role::Initiator => None,
        }
    }
}

pub fn scripted_pair() -> (TlsAdapter<ScriptedEngine>, TlsAdapter<ScriptedEngine>) {
    (
        TlsAdapter::new(
            ScriptedEngine::initiator("pump.example"),
            &AdapterConfig::default(),
        ),
        TlsAdapter::new(ScriptedEngine::responder(), &AdapterConfig::default()),
    )
}

/// Chooses fragment lengths in `1..=max` from a fixed seed.
pub struct Fragments {
    state: u64,
    max: usize,
}

impl Fragments {
    pub fn new(seed: u64, max: usize) -> Self {
        Self {
            state: seed | 1,
            max,
        }
    }

    pub fn next_len(&mut self) -> usize {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        1 + (self.state % self.max as u64) as usize
    }
}

/// Split `data` at the ascending offsets in `cuts`.
pub fn split_at_cuts<'a>(data: &'a [u8], cuts: &[usize]) -> Vec<&'a [u8]> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for &cut in cuts.iter().chain([data.len()].iter()) {
        pieces.push(&data[start..cut]);
        start = cut;
    }
    pieces
}

/// Move all queued ciphertext from `left` to `right`.
pub fn transfer<L: HandshakeEngine, R: HandshakeEngine>(
    left: &mut TlsAdapter<L>,
    right: &mut TlsAdapter<R>,
) -> usize {
    let mut buf = [0u8; 65536];
    let mut total = 0;

    while left.wants_write() {
        let sz = left.drain_ciphertext(&mut buf);
        assert_eq!(right.feed_ciphertext(&buf[..sz]), sz);
        total += sz;
    }

    total
}

/// Move all queued ciphertext from `left` to `right` in pieces chosen by
/// `sizes`.
pub fn transfer_in_pieces<L: HandshakeEngine, R: HandshakeEngine>(
    left: &mut TlsAdapter<L>,
    right: &mut TlsAdapter<R>,
    sizes: &mut Fragments,
) -> usize {
    let mut total = 0;

    while left.wants_write() {
        let mut buf = vec![0u8; sizes.next_len()];
        let sz = left.drain_ciphertext(&mut buf);
        assert_eq!(right.feed_ciphertext(&buf[..sz]), sz);
        total += sz;
    }

    total
}

/// Pump both sides until both handshakes complete, returning the number of
/// rounds taken.
pub fn do_handshake<C: HandshakeEngine, S: HandshakeEngine>(
    client: &mut TlsAdapter<C>,
    server: &mut TlsAdapter<S>,
) -> usize {
    let mut rounds = 0;
    while !(client.is_handshake_complete() && server.is_handshake_complete()) {
        rounds += 1;
        assert!(rounds < 20, "handshake is not making progress");
        let _ = client.pump_handshake().unwrap();
        transfer(client, server);
        let _ = server.pump_handshake().unwrap();
        transfer(server, client);
    }
    rounds
}

/// Encrypt all of `data` on `left`, moving it to `right` in pieces, and
/// decrypt it there.
pub fn send_in_pieces<L: HandshakeEngine, R: HandshakeEngine>(
    left: &mut TlsAdapter<L>,
    right: &mut TlsAdapter<R>,
    data: &[u8],
    sizes: &mut Fragments,
) -> Vec<u8> {
    let mut offs = 0;
    while offs < data.len() {
        let end = cmp::min(data.len(), offs + sizes.next_len());
        match left.encrypt_plaintext(&data[offs..end]).unwrap() {
            rustls_pump::Status::Transferred(n) => offs += n,
            status => panic!("unexpected {status:?}"),
        }
    }
    transfer_in_pieces(left, right, sizes);

    let mut received = Vec::new();
    loop {
        let mut buf = vec![0u8; sizes.next_len()];
        match right.decrypt_to_plaintext(&mut buf).unwrap() {
            rustls_pump::Status::Transferred(n) => received.extend_from_slice(&buf[..n]),
            rustls_pump::Status::WouldBlock => break,
            status => panic!("unexpected {status:?}"),
        }
    }
    received
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Started,
    Done,
    ClientHello(Option<String>),
    CertificateNeeded(Option<String>),
}

/// Shared log of observer callbacks.
#[derive(Clone, Default)]
pub struct Events(Rc<RefCell<Vec<Event>>>);

impl Events {
    pub fn observer(&self) -> Box<dyn Observer> {
        Box::new(Recorder(self.clone()))
    }

    pub fn take(&self) -> Vec<Event> {
        self.0.borrow_mut().drain(..).collect()
    }
}

struct Recorder(Events);

impl Observer for Recorder {
    fn handshake_started(&mut self) {
        self.0 .0.borrow_mut().push(Event::Started);
    }

    fn handshake_done(&mut self) {
        self.0 .0.borrow_mut().push(Event::Done);
    }

    fn client_hello(&mut self, hello: &ClientHello) {
        self.0 .0
            .borrow_mut()
            .push(Event::ClientHello(hello.server_name().map(str::to_owned)));
    }

    fn certificate_needed(&mut self, context: &SelectionContext) {
        self.0 .0
            .borrow_mut()
            .push(Event::CertificateNeeded(context.server_name.clone()));
    }
}

/// A self-signed certificate for "localhost" and configs that use it.
pub struct TestPki {
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

impl TestPki {
    pub fn new() -> Self {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        Self {
            cert: cert.der().clone(),
            key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
        }
    }

    pub fn cert_der(&self) -> &[u8] {
        self.cert.as_ref()
    }

    pub fn server_config(&self, alpn: &[&[u8]]) -> Arc<ServerConfig> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert.clone()], self.key.clone_key())
            .unwrap();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Arc::new(config)
    }

    pub fn client_config(&self, alpn: &[&[u8]]) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.clone()).unwrap();
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Arc::new(config)
    }

    pub fn client(&self, alpn: &[&[u8]]) -> TlsAdapter<RustlsEngine> {
        let name = ServerName::try_from("localhost").unwrap();
        let engine = RustlsEngine::client(self.client_config(alpn), name).unwrap();
        TlsAdapter::new(engine, &AdapterConfig::default())
    }
}
