use std::sync::Arc;

use voxgate_config::Settings;
use voxgate_providers::registry::ProviderRegistry;
use voxgate_services::admission::AdmissionController;
use voxgate_services::auth::TokenVerifier;
use voxgate_services::usage::UsageRecorder;

use crate::ws::session::SessionTable;
use crate::ws::storage::ConnectionRegistry;

/// Shared application state, cloned into every connection task.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<ProviderRegistry>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub admission: Arc<AdmissionController>,
    pub recorder: Arc<UsageRecorder>,
    pub connections: Arc<ConnectionRegistry>,
    pub sessions: Arc<SessionTable>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        registry: ProviderRegistry,
        verifier: Arc<dyn TokenVerifier>,
        recorder: Arc<UsageRecorder>,
    ) -> Self {
        let admission = Arc::new(AdmissionController::new(settings.admission.clone()));
        Self {
            settings: Arc::new(settings),
            registry: Arc::new(registry),
            verifier,
            admission,
            recorder,
            connections: Arc::new(ConnectionRegistry::new()),
            sessions: Arc::new(SessionTable::new()),
        }
    }
}
