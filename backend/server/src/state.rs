use std::sync::Arc;

use tracing::info;

use super::{
    config::{Config, StoreKind},
    database::{MemoryOrderStore, OrderStore, PgOrderStore, StoreError},
    payments::{PaymentProvider, StripeClient},
};

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn OrderStore>,
    pub payments: Arc<dyn PaymentProvider>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Arc<Self>, StoreError> {
        let store: Arc<dyn OrderStore> = match (config.store, &config.database_url) {
            (StoreKind::Postgres, Some(url)) => {
                Arc::new(PgOrderStore::connect(url, config.database_max_connections).await?)
            }
            _ => {
                info!("Using in-memory order store, orders will not survive a restart");
                Arc::new(MemoryOrderStore::new())
            }
        };

        let payments = Arc::new(StripeClient::new(
            &config.stripe_secret_key,
            &config.stripe_api_base,
        ));

        Ok(Self::from_parts(config, store, payments))
    }

    pub fn from_parts(
        config: Config,
        store: Arc<dyn OrderStore>,
        payments: Arc<dyn PaymentProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            payments,
        })
    }
}
