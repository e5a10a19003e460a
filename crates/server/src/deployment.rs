//! Wiring of the services the HTTP layer serves.

use std::{fs, path::Path, sync::Arc};

use db::DBService;
use services::services::{
    config::Config,
    database_availability::AvailabilityManager,
    database_validator::DatabaseValidator,
    desktop::SystemNotifier,
    notification::NotificationService,
    notification_store::NotificationStore,
};
use tracing::{info, warn};

#[derive(Clone)]
pub struct Deployment {
    config: Arc<Config>,
    availability: Option<AvailabilityManager>,
    notifications: NotificationService,
}

impl Deployment {
    /// Opens the configured store (if any) and applies migrations.
    ///
    /// A store that cannot be migrated is kept: the availability probe reports
    /// it and notifications fall back to local fan-out until it recovers.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db = match config.database_url.as_deref() {
            Some(url) => {
                if let Some(dir) = config.database_file().as_deref().and_then(Path::parent) {
                    fs::create_dir_all(dir)?;
                }
                let db = DBService::connect_lazy(url)?;
                if let Err(e) = db.migrate().await {
                    warn!(error = %e, "Failed to apply database migrations");
                }
                Some(db)
            }
            None => {
                info!("No database configured, notifications are delivered in-process only");
                None
            }
        };
        Ok(Self::from_parts(config, db))
    }

    pub fn from_parts(config: Config, db: Option<DBService>) -> Self {
        let availability = db.as_ref().map(|db| {
            let manager = AvailabilityManager::with_timings(
                Arc::new(DatabaseValidator::new(db.pool.clone())),
                config.availability.cache_ttl(),
                config.availability.probe_timeout(),
            );
            manager.subscribe(|state| info!(state = %state, "Database availability changed"));
            manager
        });

        let store = db.map(|db| Arc::new(db) as Arc<dyn NotificationStore>);
        let desktop = SystemNotifier::new(
            config.notifications.app_name.clone(),
            config.notifications.desktop_enabled,
        );
        let mut notifications =
            NotificationService::new(store).with_desktop_notifier(Arc::new(desktop));
        if let Some(availability) = &availability {
            notifications = notifications.with_availability(availability.clone());
        }

        Self {
            config: Arc::new(config),
            availability,
            notifications,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn availability(&self) -> Option<&AvailabilityManager> {
        self.availability.as_ref()
    }

    pub fn notifications(&self) -> &NotificationService {
        &self.notifications
    }
}
