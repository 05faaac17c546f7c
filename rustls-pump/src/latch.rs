use std::fmt;

use crate::error::{Error, Misuse};

/// What the peer asked for, handed to whoever chooses the certificate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectionContext {
    /// The server name from the SNI extension, if the client sent one.
    pub server_name: Option<String>,
    /// ALPN protocols offered by the client, in its order of preference.
    pub alpn: Vec<Vec<u8>>,
    /// The client asked for a stapled OCSP response.
    pub ocsp_requested: bool,
}

/// A one-shot suspend/resume point for asynchronous certificate selection.
///
/// An engine that needs a certificate decision arms the latch with the
/// [`SelectionContext`] and a `resume` value (for the adapter, a boxed
/// continuation), then returns to its caller.  While the latch is pending
/// nothing re-enters the engine.  [`Self::release`] hands `resume` back
/// exactly once; asking again is a [`Misuse::NoPendingSelection`].
pub struct CertificateSelectionLatch<R> {
    pending: Option<Pending<R>>,
}

struct Pending<R> {
    context: SelectionContext,
    resume: R,
}

impl<R> CertificateSelectionLatch<R> {
    /// An idle latch.
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// Suspend, remembering `context` and `resume`.
    ///
    /// Fails if a selection is already pending; the earlier one is kept.
    pub fn arm(&mut self, context: SelectionContext, resume: R) -> Result<(), Error> {
        if self.pending.is_some() {
            return Err(Misuse::SelectionAlreadyPending.into());
        }
        self.pending = Some(Pending { context, resume });
        Ok(())
    }

    /// True between [`Self::arm`] and [`Self::release`] or [`Self::cancel`].
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The context of the pending selection.
    pub fn context(&self) -> Option<&SelectionContext> {
        self.pending
            .as_ref()
            .map(|p| &p.context)
    }

    pub(crate) fn context_mut(&mut self) -> Option<&mut SelectionContext> {
        self.pending
            .as_mut()
            .map(|p| &mut p.context)
    }

    /// Disarm, returning the context and the captured `resume`.
    pub fn release(&mut self) -> Result<(SelectionContext, R), Error> {
        match self.pending.take() {
            Some(Pending { context, resume }) => Ok((context, resume)),
            None => Err(Misuse::NoPendingSelection.into()),
        }
    }

    /// Drop any pending selection without resuming it.  Returns whether one
    /// was pending.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }
}

impl<R> Default for CertificateSelectionLatch<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for CertificateSelectionLatch<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateSelectionLatch")
            .field("pending", &self.context())
            .finish()
    }
}
