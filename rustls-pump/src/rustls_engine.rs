use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::server::{Accepted, Acceptor};
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use crate::engine::{EngineContext, Endpoints, HandshakeEngine, Progress, ResumeFn, Role};
use crate::error::Error;
use crate::latch::SelectionContext;
use crate::log::{debug, trace};

/// A [`HandshakeEngine`] backed by a rustls connection.
///
/// A server made with [`RustlsEngine::server_with_selection`] reads the
/// ClientHello first and then defers; the caller picks a
/// [`ServerConfig`] (certificate, ALPN, and so on) for that client and
/// passes it to
/// [`TlsAdapter::supply_decision`](crate::TlsAdapter::supply_decision).
pub struct RustlsEngine {
    role: Role,
    state: EngineState,
}

enum EngineState {
    Accepting(Box<Acceptor>),
    Selecting,
    Connected(Connection),
}

impl RustlsEngine {
    /// Make a client connecting to `name`.
    pub fn client(config: Arc<ClientConfig>, name: ServerName<'static>) -> Result<Self, Error> {
        let conn = ClientConnection::new(config, name)?;
        Ok(Self {
            role: Role::Initiator,
            state: EngineState::Connected(conn.into()),
        })
    }

    /// Make a server with a fixed configuration.
    pub fn server(config: Arc<ServerConfig>) -> Result<Self, Error> {
        let conn = ServerConnection::new(config)?;
        Ok(Self {
            role: Role::Responder,
            state: EngineState::Connected(conn.into()),
        })
    }

    /// Make a server whose configuration is chosen once the ClientHello has
    /// been read.
    pub fn server_with_selection() -> Self {
        Self {
            role: Role::Responder,
            state: EngineState::Accepting(Box::default()),
        }
    }

    /// The underlying rustls connection, once there is one.
    pub fn connection(&self) -> Option<&Connection> {
        match &self.state {
            EngineState::Connected(conn) => Some(conn),
            _ => None,
        }
    }

    fn accept(&mut self, cx: &mut EngineContext<'_, Self>) -> Result<Progress<()>, Error> {
        let EngineState::Accepting(acceptor) = &mut self.state else {
            return Ok(Progress::WantRead);
        };

        loop {
            match acceptor.read_tls(&mut *cx.io.incoming) {
                Ok(0) => break,
                Ok(used) => trace!("acceptor took {} bytes", used),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(io_error(err)),
            }
        }

        match acceptor.accept() {
            Ok(Some(accepted)) => {
                let context = selection_context(&accepted);
                debug!("ClientHello read; deferring for {:?}", context.server_name);
                self.state = EngineState::Selecting;
                cx.defer_certificate(context, resume_with(accepted))
            }
            Ok(None) if cx.io.incoming.is_eof() => Ok(Progress::ZeroReturn),
            Ok(None) => Ok(Progress::WantRead),
            Err((err, mut alert)) => {
                // the alert is a courtesy to the peer; the error is what matters
                let _ = alert.write_all(&mut *cx.io.outgoing);
                Err(err.into())
            }
        }
    }

    fn finish_accept(
        &mut self,
        accepted: Accepted,
        io: &mut Endpoints<'_>,
        config: Arc<ServerConfig>,
    ) -> Result<(), Error> {
        match accepted.into_connection(config) {
            Ok(conn) => {
                self.state = EngineState::Connected(conn.into());
                Ok(())
            }
            Err((err, mut alert)) => {
                let _ = alert.write_all(&mut *io.outgoing);
                Err(err.into())
            }
        }
    }
}

fn resume_with(accepted: Accepted) -> ResumeFn<RustlsEngine> {
    Box::new(move |engine, io, config| engine.finish_accept(accepted, io, config))
}

fn selection_context(accepted: &Accepted) -> SelectionContext {
    let hello = accepted.client_hello();
    SelectionContext {
        server_name: hello.server_name().map(str::to_owned),
        alpn: hello
            .alpn()
            .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
            .unwrap_or_default(),
        ocsp_requested: false,
    }
}

/// Give the connection everything buffered in `io.incoming`.
fn pull(conn: &mut Connection, io: &mut Endpoints<'_>) -> Result<(), Error> {
    loop {
        match conn.read_tls(&mut *io.incoming) {
            Ok(0) => break,
            Ok(used) => trace!("engine took {} ciphertext bytes", used),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            // received plaintext backlog: the caller must read before we pull more
            Err(err) if err.kind() == io::ErrorKind::Other => break,
            Err(err) => return Err(io_error(err)),
        }

        if let Err(err) = conn.process_new_packets() {
            // queue the alert before reporting
            let _ = push(conn, io);
            return Err(err.into());
        }
    }
    Ok(())
}

/// Move everything the connection wants to send into `io.outgoing`.
fn push(conn: &mut Connection, io: &mut Endpoints<'_>) -> Result<(), Error> {
    while conn.wants_write() {
        if conn
            .write_tls(&mut *io.outgoing)
            .map_err(io_error)?
            == 0
        {
            break;
        }
    }
    Ok(())
}

fn io_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => Error::UnexpectedEof,
        _ => Error::General(err.to_string()),
    }
}

impl HandshakeEngine for RustlsEngine {
    type Decision = Arc<ServerConfig>;

    fn role(&self) -> Role {
        self.role
    }

    fn handshake(&mut self, cx: &mut EngineContext<'_, Self>) -> Result<Progress<()>, Error> {
        if let EngineState::Accepting(_) = self.state {
            return self.accept(cx);
        }

        let conn = match &mut self.state {
            EngineState::Accepting(_) => return Ok(Progress::WantRead),
            EngineState::Selecting => {
                return Err(Error::General(
                    "handshake resumed before a configuration was selected".into(),
                ));
            }
            EngineState::Connected(conn) => conn,
        };

        pull(conn, &mut cx.io)?;
        push(conn, &mut cx.io)?;

        if !conn.is_handshaking() {
            Ok(Progress::Done(()))
        } else if cx.io.incoming.is_eof() && cx.io.incoming.is_empty() {
            Ok(Progress::ZeroReturn)
        } else {
            Ok(Progress::WantRead)
        }
    }

    fn read_plaintext(
        &mut self,
        io: &mut Endpoints<'_>,
        out: &mut [u8],
    ) -> Result<Progress<usize>, Error> {
        let EngineState::Connected(conn) = &mut self.state else {
            return Ok(Progress::WantRead);
        };

        pull(conn, io)?;
        let result = conn.reader().read(out);
        push(conn, io)?;

        match result {
            Ok(0) => Ok(Progress::ZeroReturn),
            Ok(used) => Ok(Progress::Done(used)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Progress::WantRead),
            Err(err) => Err(io_error(err)),
        }
    }

    fn write_plaintext(
        &mut self,
        io: &mut Endpoints<'_>,
        data: &[u8],
    ) -> Result<Progress<usize>, Error> {
        let EngineState::Connected(conn) = &mut self.state else {
            return Ok(Progress::WantWrite);
        };

        let used = conn
            .writer()
            .write(data)
            .map_err(io_error)?;
        push(conn, io)?;
        Ok(Progress::Done(used))
    }

    fn shutdown(&mut self, io: &mut Endpoints<'_>) -> Result<(), Error> {
        if let EngineState::Connected(conn) = &mut self.state {
            conn.send_close_notify();
            push(conn, io)?;
        }
        Ok(())
    }

    fn is_handshaking(&self) -> bool {
        match &self.state {
            EngineState::Connected(conn) => conn.is_handshaking(),
            _ => true,
        }
    }

    fn negotiated_protocol(&self) -> Option<&[u8]> {
        self.connection()?.alpn_protocol()
    }

    fn peer_identity(&self) -> Option<&[u8]> {
        self.connection()?
            .peer_certificates()?
            .first()
            .map(|cert| cert.as_ref())
    }

    fn server_name(&self) -> Option<&str> {
        match self.connection()? {
            Connection::Server(conn) => conn.server_name(),
            Connection::Client(_) => None,
        }
    }
}
