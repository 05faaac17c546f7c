use std::cmp;

use crate::log::{debug, trace};

const RECORD_HEADER_LEN: usize = 5;
const MAX_FRAGMENT_LEN: usize = 16384;

/// The sniffer's default capacity: one record of the largest size TLS
/// allows, header included.
pub const MAX_CLIENT_HELLO_RECORD: usize = RECORD_HEADER_LEN + MAX_FRAGMENT_LEN;

const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;

const EXT_SERVER_NAME: u16 = 0;
const EXT_STATUS_REQUEST: u16 = 5;
const EXT_ALPN: u16 = 16;
const EXT_SESSION_TICKET: u16 = 35;
const EXT_PRE_SHARED_KEY: u16 = 41;

const SERVER_NAME_TYPE_HOST: u8 = 0;
const STATUS_TYPE_OCSP: u8 = 1;

/// How a responder treats the client's first record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientHelloMode {
    /// Hand bytes straight to the engine.
    Pass,
    /// Buffer the first record, report it, then hand it on.
    Inspect,
    /// As `Inspect`, but hold the record (and anything after it) until
    /// `release_client_hello()` is called.
    Hold,
}

/// Fields of interest from a peer's ClientHello.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientHello {
    legacy_version: u16,
    session_id: Vec<u8>,
    server_name: Option<String>,
    alpn: Vec<Vec<u8>>,
    ocsp_requested: bool,
    session_ticket: Option<Vec<u8>>,
    psk_identity: Option<Vec<u8>>,
}

impl ClientHello {
    /// The `legacy_version` field; 0x0303 for TLS1.2 and TLS1.3.
    pub fn legacy_version(&self) -> u16 {
        self.legacy_version
    }

    /// The legacy session id, which may be empty.
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// The host name from the SNI extension.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Offered ALPN protocols, in the client's order of preference.
    pub fn alpn(&self) -> &[Vec<u8>] {
        &self.alpn
    }

    /// The client sent an OCSP `status_request` extension.
    pub fn ocsp_requested(&self) -> bool {
        self.ocsp_requested
    }

    /// The contents of the `session_ticket` extension, if present.  An
    /// empty ticket means the client supports tickets but has none.
    pub fn session_ticket(&self) -> Option<&[u8]> {
        self.session_ticket.as_deref()
    }

    /// The first identity offered in a TLS1.3 `pre_shared_key` extension.
    pub fn psk_identity(&self) -> Option<&[u8]> {
        self.psk_identity.as_deref()
    }

    /// The ticket this hello presents for resumption: the first PSK
    /// identity, else a non-empty `session_ticket` extension.
    pub fn resumption_ticket(&self) -> Option<&[u8]> {
        self.psk_identity().or_else(|| {
            self.session_ticket()
                .filter(|ticket| !ticket.is_empty())
        })
    }

    /// Parse a complete TLS record holding a ClientHello.
    ///
    /// Returns `None` for anything else, including a ClientHello that
    /// continues in a later record.
    pub fn parse(record: &[u8]) -> Option<Self> {
        let mut rd = Reader::init(record);
        if rd.u8()? != CONTENT_TYPE_HANDSHAKE {
            return None;
        }
        rd.u16()?; // legacy record version
        let fragment_len = usize::from(rd.u16()?);
        let mut fragment = rd.sub(fragment_len)?;

        if fragment.u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
            return None;
        }
        let len = fragment.u24()?;
        let mut body = fragment.sub(len)?;
        Self::read_body(&mut body)
    }

    fn read_body(rd: &mut Reader<'_>) -> Option<Self> {
        let mut hello = Self {
            legacy_version: rd.u16()?,
            ..Default::default()
        };

        rd.take(32)?; // random
        let session_id_len = usize::from(rd.u8()?);
        hello.session_id = rd.take(session_id_len)?.to_vec();
        let suites_len = usize::from(rd.u16()?);
        rd.take(suites_len)?;
        let compression_len = usize::from(rd.u8()?);
        rd.take(compression_len)?;

        if !rd.any_left() {
            return Some(hello);
        }

        let extensions_len = usize::from(rd.u16()?);
        let mut extensions = rd.sub(extensions_len)?;
        while extensions.any_left() {
            let typ = extensions.u16()?;
            let len = usize::from(extensions.u16()?);
            let mut body = extensions.sub(len)?;
            match typ {
                EXT_SERVER_NAME => hello.server_name = read_server_name(&mut body),
                EXT_STATUS_REQUEST => {
                    hello.ocsp_requested = body.u8() == Some(STATUS_TYPE_OCSP);
                }
                EXT_ALPN => hello.alpn = read_alpn(&mut body)?,
                EXT_SESSION_TICKET => hello.session_ticket = Some(body.rest().to_vec()),
                EXT_PRE_SHARED_KEY => hello.psk_identity = read_psk_identity(&mut body),
                _ => {}
            }
        }

        Some(hello)
    }
}

fn read_server_name(rd: &mut Reader<'_>) -> Option<String> {
    let list_len = usize::from(rd.u16()?);
    let mut list = rd.sub(list_len)?;
    while list.any_left() {
        let typ = list.u8()?;
        let len = usize::from(list.u16()?);
        let name = list.take(len)?;
        if typ == SERVER_NAME_TYPE_HOST {
            return std::str::from_utf8(name)
                .ok()
                .map(str::to_owned);
        }
    }
    None
}

fn read_alpn(rd: &mut Reader<'_>) -> Option<Vec<Vec<u8>>> {
    let list_len = usize::from(rd.u16()?);
    let mut list = rd.sub(list_len)?;
    let mut protocols = Vec::new();
    while list.any_left() {
        let len = usize::from(list.u8()?);
        protocols.push(list.take(len)?.to_vec());
    }
    Some(protocols)
}

fn read_psk_identity(rd: &mut Reader<'_>) -> Option<Vec<u8>> {
    let identities_len = usize::from(rd.u16()?);
    let mut identities = rd.sub(identities_len)?;
    let len = usize::from(identities.u16()?);
    let identity = identities.take(len)?;
    identities.take(4)?; // obfuscated_ticket_age
    Some(identity.to_vec())
}

/// Read from a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    offs: usize,
}

impl<'a> Reader<'a> {
    fn init(bytes: &'a [u8]) -> Self {
        Self {
            buf: bytes,
            offs: 0,
        }
    }

    fn rest(&mut self) -> &'a [u8] {
        let ret = &self.buf[self.offs..];
        self.offs = self.buf.len();
        ret
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.left() < len {
            return None;
        }

        let current = self.offs;
        self.offs += len;
        Some(&self.buf[current..current + len])
    }

    fn any_left(&self) -> bool {
        self.offs < self.buf.len()
    }

    fn left(&self) -> usize {
        self.buf.len() - self.offs
    }

    fn sub(&mut self, len: usize) -> Option<Self> {
        self.take(len).map(Self::init)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| usize::from(b[0]) << 16 | usize::from(b[1]) << 8 | usize::from(b[2]))
    }
}

/// Side buffer that collects a responder's first TLS record before the
/// engine sees it.
///
/// Bytes are taken only up to the end of that record, so the caller can
/// pass the remainder straight on.  In hold mode the sniffer keeps taking
/// bytes after a ClientHello, up to its capacity, until it is released;
/// any other first record is never held.
pub(crate) struct ClientHelloSniffer {
    buf: Vec<u8>,
    capacity: usize,
    hold: bool,
    complete: bool,
}

impl ClientHelloSniffer {
    pub(crate) fn new(capacity: usize, hold: bool) -> Self {
        Self {
            buf: Vec::new(),
            capacity: cmp::max(capacity, RECORD_HEADER_LEN),
            hold,
            complete: false,
        }
    }

    /// Take a prefix of `data`.
    ///
    /// Returns how many bytes were taken and, when this call completed the
    /// first record, what it held.
    pub(crate) fn offer(&mut self, data: &[u8]) -> (usize, Option<Option<ClientHello>>) {
        let mut taken = 0;
        let mut finished = None;

        if !self.complete {
            while let Some(want) = self.wanted() {
                let take = cmp::min(want, data.len() - taken);
                if take == 0 {
                    break;
                }
                self.buf
                    .extend_from_slice(&data[taken..taken + take]);
                taken += take;
            }

            if self.wanted().is_none() {
                self.complete = true;
                let hello = ClientHello::parse(&self.buf);
                match &hello {
                    Some(hello) => debug!("sniffed ClientHello for {:?}", hello.server_name()),
                    None => debug!("first record is not a whole ClientHello; passing it on"),
                }
                self.hold &= hello.is_some();
                finished = Some(hello);
            }
        }

        if self.complete && self.hold {
            let room = self.capacity.saturating_sub(self.buf.len());
            let take = cmp::min(room, data.len() - taken);
            self.buf
                .extend_from_slice(&data[taken..taken + take]);
            taken += take;
            if take > 0 {
                trace!("holding {} bytes with the ClientHello", self.buf.len());
            }
        }

        (taken, finished)
    }

    /// How many more bytes finish the first record, or `None` once it is
    /// finished.  A record too big to hold, or one that is not a handshake
    /// record, is finished as soon as its header is.
    fn wanted(&self) -> Option<usize> {
        let have = self.buf.len();
        if have < RECORD_HEADER_LEN {
            return Some(RECORD_HEADER_LEN - have);
        }

        if self.buf[0] != CONTENT_TYPE_HANDSHAKE {
            return None;
        }

        let end = RECORD_HEADER_LEN + usize::from(u16::from_be_bytes([self.buf[3], self.buf[4]]));
        if end > self.capacity {
            return None;
        }

        match end > have {
            true => Some(end - have),
            false => None,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    pub(crate) fn is_holding(&self) -> bool {
        self.complete && self.hold
    }

    pub(crate) fn into_buffered(self) -> Vec<u8> {
        self.buf
    }
}
