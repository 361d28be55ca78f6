use std::fmt;

/// Where a transfer session stands.
///
/// ```text
/// Idle → Connecting → WaitingForCounterpart ───────────────────────→ Transferring ─→ Complete
///                   └ WaitingForOffer → GeneratingAnswer → ShowingAnswer → Receiving ─┘
/// ```
/// `Error` is reachable from every non-terminal state; cancellation settles
/// in `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferState {
    #[default]
    Idle,
    Connecting,
    /// Sender: offer published, waiting for the answer and the channel
    WaitingForCounterpart,
    /// Receiver: waiting for the sender's offer
    WaitingForOffer,
    GeneratingAnswer,
    /// Receiver: answer published (or on screen), waiting for the channel
    ShowingAnswer,
    Transferring { sent: u32, total: u32 },
    Receiving { received: u32, total: u32 },
    Complete,
    Error(String),
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Error(_))
    }

    /// Whether a session is between `Idle` and a terminal state.
    pub fn is_active(&self) -> bool {
        !matches!(self, TransferState::Idle) && !self.is_terminal()
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransferState::Idle => "idle",
            TransferState::Connecting => "connecting",
            TransferState::WaitingForCounterpart => "waiting_for_counterpart",
            TransferState::WaitingForOffer => "waiting_for_offer",
            TransferState::GeneratingAnswer => "generating_answer",
            TransferState::ShowingAnswer => "showing_answer",
            TransferState::Transferring { .. } => "transferring",
            TransferState::Receiving { .. } => "receiving",
            TransferState::Complete => "complete",
            TransferState::Error(_) => "error",
        }
    }

    /// Legal successor check.
    pub fn allows(&self, next: &TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (_, Idle | Error(_)) => true,
            (Complete | Error(_), _) => matches!(next, Connecting),
            (Idle, Connecting) => true,
            (Connecting, WaitingForCounterpart | WaitingForOffer) => true,
            (WaitingForCounterpart, Transferring { .. }) => true,
            (WaitingForOffer, GeneratingAnswer) => true,
            (GeneratingAnswer, ShowingAnswer) => true,
            (ShowingAnswer, Receiving { .. }) => true,
            (Transferring { .. }, Transferring { .. } | Complete) => true,
            (Receiving { .. }, Receiving { .. } | Complete) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Transferring { sent, total } => write!(f, "transferring ({sent}/{total})"),
            TransferState::Receiving { received, total } => {
                write!(f, "receiving ({received}/{total})")
            }
            TransferState::Error(message) => write!(f, "error: {message}"),
            other => f.write_str(other.name()),
        }
    }
}
