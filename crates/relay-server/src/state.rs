use std::sync::Arc;

use crate::{
    auth::{StaticTenants, TenantAuthenticator},
    config::RelayConfig,
    dispatcher::{DispatchSettings, Dispatcher},
    error::StoreError,
    interceptor::{ForwardedFor, InterceptorPipeline, RequestIdHeader},
    link::LinkRegistry,
    router::{LocalRouter, OriginRouter},
    store::{BodyStore, FileBodyStore, MemoryBodyStore},
};

pub struct AppState {
    pub config: RelayConfig,
    pub dispatcher: Arc<Dispatcher>,
    pub pipeline: Arc<InterceptorPipeline>,
    pub authenticator: Arc<dyn TenantAuthenticator>,
}

impl AppState {
    pub fn new(
        config: RelayConfig,
        dispatcher: Arc<Dispatcher>,
        pipeline: InterceptorPipeline,
        authenticator: Arc<dyn TenantAuthenticator>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            pipeline: Arc::new(pipeline),
            authenticator,
        }
    }

    /// Single instance setup: body store per config, tenants from config and
    /// the default interceptors.
    pub async fn from_config(config: RelayConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn BodyStore> = match &config.body_store_dir {
            Some(dir) => Arc::new(FileBodyStore::on_disk(dir).await?),
            None => Arc::new(MemoryBodyStore::in_memory()),
        };
        Ok(Self::with_router(config, store, Arc::new(LocalRouter)))
    }

    pub fn with_router(
        config: RelayConfig,
        store: Arc<dyn BodyStore>,
        router: Arc<dyn OriginRouter>,
    ) -> Self {
        let registry = Arc::new(LinkRegistry::new(config.selection_policy.selector()));
        let dispatcher = Arc::new(Dispatcher::new(
            config.instance_id.clone(),
            registry,
            store,
            router,
            DispatchSettings::from(&config),
        ));
        let pipeline = InterceptorPipeline::new()
            .with_request(ForwardedFor)
            .with_response(RequestIdHeader);
        let authenticator = Arc::new(StaticTenants::new(config.tenants.clone()));

        Self::new(config, dispatcher, pipeline, authenticator)
    }
}
