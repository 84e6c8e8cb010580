use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use apothecary_api::{
    ApiResult, DirectoryClient, PageQuery, PharmacistDashboard, PrescriptionRequest,
    SupportTicket,
};
use apothecary_engine::{RefreshReason, RefreshRequest};
use arc_swap::ArcSwap;

/// Latest view of the active user's open requests.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestsSnapshot {
    #[default]
    Empty,
    Customer {
        user_id: String,
        prescriptions: Vec<PrescriptionRequest>,
        support_tickets: Vec<SupportTicket>,
    },
    Pharmacist {
        user_id: String,
        dashboard: PharmacistDashboard,
    },
}

impl RequestsSnapshot {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Empty => None,
            Self::Customer { user_id, .. } | Self::Pharmacist { user_id, .. } => Some(user_id),
        }
    }

    pub fn summary(&self) -> String {
        match self {
            Self::Empty => "no requests loaded".to_string(),
            Self::Customer {
                prescriptions,
                support_tickets,
                ..
            } => format!(
                "{} prescription request(s), {} support ticket(s)",
                prescriptions.len(),
                support_tickets.len()
            ),
            Self::Pharmacist { dashboard, .. } => format!(
                "dashboard: {} prescription request(s), {} support request(s), {} sale record(s)",
                dashboard.prescriptions.len(),
                dashboard.support_requests.len(),
                dashboard.medications_sold.len()
            ),
        }
    }
}

/// Re-fetches the dependent request lists whenever the engine asks for it.
///
/// Refreshes may overlap. Each one takes a generation number when it starts, and only the
/// newest generation may publish, so a slow fetch for a previous user never overwrites the
/// lists of the current one.
#[derive(Clone)]
pub struct RequestsRefresher {
    directory: DirectoryClient,
    snapshot: Arc<ArcSwap<RequestsSnapshot>>,
    generation: Arc<AtomicU64>,
}

impl RequestsRefresher {
    pub fn new(directory: DirectoryClient) -> Self {
        Self {
            directory,
            snapshot: Arc::new(ArcSwap::from_pointee(RequestsSnapshot::Empty)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn snapshot(&self) -> Arc<RequestsSnapshot> {
        self.snapshot.load_full()
    }

    /// Fetches and publishes a new snapshot, returning whatever snapshot is current afterwards.
    ///
    /// A failed fetch publishes an empty snapshot. A fetch overtaken by a newer refresh is
    /// discarded.
    pub async fn refresh(&self, request: &RefreshRequest) -> Arc<RequestsSnapshot> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if request.reason == RefreshReason::ActiveUserChanged {
            // The previous user's lists must not linger while the new ones load.
            self.snapshot.store(Arc::new(RequestsSnapshot::Empty));
        }

        let snapshot = match self.fetch(request).await {
            Ok(snapshot) => {
                tracing::debug!(
                    user_id = %request.user_id,
                    reason = ?request.reason,
                    summary = %snapshot.summary(),
                    "refreshed requests"
                );
                snapshot
            }
            Err(error) => {
                tracing::warn!(
                    user_id = %request.user_id,
                    reason = ?request.reason,
                    error = %error,
                    "failed to refresh requests, clearing"
                );
                RequestsSnapshot::Empty
            }
        };

        let latest = self.generation.load(Ordering::SeqCst);
        if latest != generation {
            tracing::debug!(
                user_id = %request.user_id,
                generation,
                latest,
                "discarding refresh overtaken by a newer one"
            );
            return self.snapshot();
        }

        let snapshot = Arc::new(snapshot);
        self.snapshot.store(Arc::clone(&snapshot));
        snapshot
    }

    async fn fetch(&self, request: &RefreshRequest) -> ApiResult<RequestsSnapshot> {
        if request.role.is_pharmacist() {
            let dashboard = self.directory.fetch_dashboard(&request.user_id).await?;
            return Ok(RequestsSnapshot::Pharmacist {
                user_id: request.user_id.clone(),
                dashboard,
            });
        }

        let page = PageQuery::default();
        let (prescriptions, support_tickets) = futures::join!(
            self.directory.fetch_prescriptions(&request.user_id, &page),
            self.directory.fetch_support_tickets(&request.user_id, &page),
        );
        Ok(RequestsSnapshot::Customer {
            user_id: request.user_id.clone(),
            prescriptions: prescriptions?,
            support_tickets: support_tickets?,
        })
    }
}
