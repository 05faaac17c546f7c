use crate::hello::ClientHello;
use crate::latch::SelectionContext;

/// Optional notifications from a [`TlsAdapter`](crate::TlsAdapter).
///
/// Every method has an empty default, so implement only what you need.
/// Each is called at most once per connection, from inside the adapter
/// operation that caused it.
pub trait Observer {
    /// The engine is about to run its first handshake step.
    fn handshake_started(&mut self) {}

    /// The handshake completed.
    fn handshake_done(&mut self) {}

    /// A responder inspected the client's first flight.
    fn client_hello(&mut self, _hello: &ClientHello) {}

    /// The handshake is suspended until
    /// [`TlsAdapter::supply_decision`](crate::TlsAdapter::supply_decision)
    /// is called, which can happen as soon as the current operation has
    /// returned or at any later time.
    fn certificate_needed(&mut self, _context: &SelectionContext) {}
}
