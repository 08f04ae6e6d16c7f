use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zget_core::discovery::{BrowseSession, ServiceBrowser};
use zget_core::{Ciphersuite, ServiceIdentity, ZgetError};

use crate::locator::{Discovery, PeerLocator};
use crate::transfer::{ProgressHook, TransferClient};

// ── Phases ──────────────────────────────────────────────────────────

/// Phase of one receive run.
///
/// Runs move strictly forward:
/// `Idle → DerivingIdentity → NegotiatingCipher → Discovering →
/// Transferring → Done`, with `Failed` reachable from any working phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    DerivingIdentity,
    NegotiatingCipher,
    Discovering,
    Transferring,
    Done,
    Failed,
}

/// What a user interrupt does in a given [`Phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptPolicy {
    /// Stop right away, release resources, report a clean cancellation.
    Abort,
    /// Keep going; the run ends on its own.
    LetFinish,
    /// The run is over, nothing to interrupt.
    Ignore,
}

impl Phase {
    #[must_use]
    pub fn interrupt_policy(self) -> InterruptPolicy {
        match self {
            Self::Idle | Self::DerivingIdentity | Self::NegotiatingCipher | Self::Discovering => {
                InterruptPolicy::Abort
            }
            Self::Transferring => InterruptPolicy::LetFinish,
            Self::Done | Self::Failed => InterruptPolicy::Ignore,
        }
    }

    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::DerivingIdentity)
                | (Self::DerivingIdentity, Self::NegotiatingCipher)
                | (Self::NegotiatingCipher, Self::Discovering)
                | (Self::Discovering, Self::Transferring)
                | (Self::Transferring, Self::Done)
                | (
                    Self::DerivingIdentity
                        | Self::NegotiatingCipher
                        | Self::Discovering
                        | Self::Transferring,
                    Self::Failed
                )
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Tracks the phase of a single run.
struct Run {
    phase: Phase,
}

impl Run {
    fn new() -> Self {
        Self { phase: Phase::Idle }
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal transition {:?} -> {next:?}",
            self.phase
        );
        debug!(from = ?self.phase, to = ?next, "Phase change");
        self.phase = next;
    }

    fn fail(&mut self, err: ZgetError) -> ZgetError {
        warn!(phase = ?self.phase, error = %err, "Receive failed");
        self.advance(Phase::Failed);
        err
    }
}

// ── Requests and outcomes ───────────────────────────────────────────

/// One file to fetch.
#[derive(Debug, Clone, Default)]
pub struct GetRequest {
    /// Name the sender shares the file under.  Only the basename is used
    /// to derive the service identity.
    pub filename: String,
    /// Destination path.  Defaults to the basename in the working
    /// directory.
    pub output: Option<PathBuf>,
    /// Discovery timeout.  `None` waits until cancelled.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    Completed { path: PathBuf },
    /// Interrupted during discovery.  Nothing was written.
    Cancelled,
}

// ── Receiver ────────────────────────────────────────────────────────

/// Receive orchestrator: identity, cipher, discovery, transfer.
///
/// Generic over the discovery backend so tests can run it over an
/// in-memory network.
pub struct Receiver<B> {
    locator: PeerLocator<B>,
    client: TransferClient,
}

impl<B: ServiceBrowser> Receiver<B> {
    /// # Errors
    ///
    /// Returns [`ZgetError::TransferFailed`] if the HTTP client cannot be
    /// built.
    pub fn new(browser: B) -> Result<Self, ZgetError> {
        Ok(Self {
            locator: PeerLocator::new(browser),
            client: TransferClient::new()?,
        })
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.locator = self.locator.with_poll_interval(poll_interval);
        self
    }

    /// Runs one receive to completion.
    ///
    /// `cancel` aborts discovery (an `Ok(GetOutcome::Cancelled)` result);
    /// once the transfer started it is ignored and the transfer runs until
    /// it succeeds or fails on its own.
    ///
    /// # Errors
    ///
    /// Any [`ZgetError`] except [`ZgetError::ShareTimedOut`].
    pub async fn get(
        &self,
        request: &GetRequest,
        ciphersuite: &Ciphersuite,
        mut progress: Option<ProgressHook>,
        cancel: &CancellationToken,
    ) -> Result<GetOutcome, ZgetError> {
        let mut run = Run::new();

        run.advance(Phase::DerivingIdentity);
        let identity = ServiceIdentity::derive(&request.filename);

        run.advance(Phase::NegotiatingCipher);
        if let Err(e) = ciphersuite.ensure_available() {
            return Err(run.fail(e.into()));
        }
        if ciphersuite.is_bypass() {
            debug!("Receiving without encryption");
        } else {
            debug!("Receiving with password-authenticated encryption");
        }

        run.advance(Phase::Discovering);
        let (peer, session) = match self.locator.locate(&identity, request.timeout, cancel).await {
            Ok(Discovery::Found { peer, session }) => (peer, session),
            Ok(Discovery::Cancelled) => {
                run.advance(Phase::Failed);
                info!("Cancelled before a peer was found");
                return Ok(GetOutcome::Cancelled);
            }
            Err(e) => return Err(run.fail(e)),
        };

        run.advance(Phase::Transferring);
        if cancel.is_cancelled() {
            debug!("Interrupt ignored, transfer already started");
        }
        let result = self
            .client
            .fetch(
                peer,
                &request.filename,
                request.output.as_deref(),
                ciphersuite,
                progress.as_deref_mut(),
            )
            .await;
        session.close();

        match result {
            Ok(path) => {
                run.advance(Phase::Done);
                info!(path = %path.display(), "Done.");
                Ok(GetOutcome::Completed { path })
            }
            Err(e) => Err(run.fail(e)),
        }
    }
}
