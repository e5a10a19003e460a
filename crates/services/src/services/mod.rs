pub mod config;
pub mod database_availability;
pub mod database_validator;
pub mod desktop;
pub mod notification;
pub mod notification_store;
