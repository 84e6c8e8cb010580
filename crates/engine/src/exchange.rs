use std::fmt;

/// Identifier for one exchange; changes on every accepted submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(pub u64);

impl ExchangeId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "#{}", self.0)
    }
}

/// Lifecycle of the request/response cycle for one submission.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExchangeState {
    #[default]
    Idle,
    Sending(ExchangeId),
    Streaming(ExchangeId),
    Settled(ExchangeId),
    Failed { id: ExchangeId, reason: String },
}

/// State transition input for the exchange lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeTransition {
    Begin(ExchangeId),
    Attach(ExchangeId),
    Complete(ExchangeId),
    Fail { id: ExchangeId, reason: String },
    /// Drops an in-flight exchange without a terminal outcome.
    Abandon(ExchangeId),
    ReturnToIdle,
}

/// Rejection reason for illegal exchange transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeTransitionRejection {
    Busy {
        active: ExchangeId,
        attempted: ExchangeId,
    },
    NotIdle,
    NoActiveExchange,
    NotAttached(ExchangeId),
    ExchangeMismatch {
        active: ExchangeId,
        attempted: ExchangeId,
    },
}

pub type ExchangeTransitionResult = Result<ExchangeState, ExchangeTransitionRejection>;

impl ExchangeState {
    /// True while a request is open or a reply is streaming.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Sending(_) | Self::Streaming(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled(_) | Self::Failed { .. })
    }

    /// Applies one transition.
    ///
    /// Only `Idle` accepts a new exchange, and terminal transitions must name the exchange
    /// that is currently in flight.
    pub fn apply(&self, transition: ExchangeTransition) -> ExchangeTransitionResult {
        match transition {
            ExchangeTransition::Begin(id) => self.apply_begin(id),
            ExchangeTransition::Attach(id) => self.apply_attach(id),
            ExchangeTransition::Complete(id) => self.apply_complete(id),
            ExchangeTransition::Fail { id, reason } => self.apply_fail(id, reason),
            ExchangeTransition::Abandon(id) => self.apply_abandon(id),
            ExchangeTransition::ReturnToIdle => self.apply_return_to_idle(),
        }
    }

    fn apply_begin(&self, id: ExchangeId) -> ExchangeTransitionResult {
        match self {
            Self::Idle => Ok(Self::Sending(id)),
            Self::Sending(active) | Self::Streaming(active) => {
                Err(ExchangeTransitionRejection::Busy {
                    active: *active,
                    attempted: id,
                })
            }
            Self::Settled(_) | Self::Failed { .. } => Err(ExchangeTransitionRejection::NotIdle),
        }
    }

    fn apply_attach(&self, id: ExchangeId) -> ExchangeTransitionResult {
        match self {
            Self::Sending(active) if *active == id => Ok(Self::Streaming(id)),
            Self::Sending(active) | Self::Streaming(active) => {
                Err(ExchangeTransitionRejection::ExchangeMismatch {
                    active: *active,
                    attempted: id,
                })
            }
            Self::Idle | Self::Settled(_) | Self::Failed { .. } => {
                Err(ExchangeTransitionRejection::NoActiveExchange)
            }
        }
    }

    fn apply_complete(&self, id: ExchangeId) -> ExchangeTransitionResult {
        match self {
            Self::Streaming(active) if *active == id => Ok(Self::Settled(id)),
            Self::Sending(active) if *active == id => {
                Err(ExchangeTransitionRejection::NotAttached(id))
            }
            Self::Sending(active) | Self::Streaming(active) => {
                Err(ExchangeTransitionRejection::ExchangeMismatch {
                    active: *active,
                    attempted: id,
                })
            }
            Self::Idle | Self::Settled(_) | Self::Failed { .. } => {
                Err(ExchangeTransitionRejection::NoActiveExchange)
            }
        }
    }

    fn apply_fail(&self, id: ExchangeId, reason: String) -> ExchangeTransitionResult {
        match self {
            Self::Sending(active) | Self::Streaming(active) if *active == id => {
                Ok(Self::Failed { id, reason })
            }
            Self::Sending(active) | Self::Streaming(active) => {
                Err(ExchangeTransitionRejection::ExchangeMismatch {
                    active: *active,
                    attempted: id,
                })
            }
            Self::Idle | Self::Settled(_) | Self::Failed { .. } => {
                Err(ExchangeTransitionRejection::NoActiveExchange)
            }
        }
    }

    fn apply_abandon(&self, id: ExchangeId) -> ExchangeTransitionResult {
        match self {
            Self::Sending(active) | Self::Streaming(active) if *active == id => Ok(Self::Idle),
            Self::Sending(active) | Self::Streaming(active) => {
                Err(ExchangeTransitionRejection::ExchangeMismatch {
                    active: *active,
                    attempted: id,
                })
            }
            Self::Idle | Self::Settled(_) | Self::Failed { .. } => {
                Err(ExchangeTransitionRejection::NoActiveExchange)
            }
        }
    }

    fn apply_return_to_idle(&self) -> ExchangeTransitionResult {
        match self {
            Self::Idle | Self::Settled(_) | Self::Failed { .. } => Ok(Self::Idle),
            Self::Sending(active) | Self::Streaming(active) => {
                Err(ExchangeTransitionRejection::Busy {
                    active: *active,
                    attempted: *active,
                })
            }
        }
    }
}
