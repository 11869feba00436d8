pub mod engine;
pub mod error;
pub mod file_store;
pub mod notifier;
pub mod orchestrator_client;
pub mod reconciliation;
pub mod validation;
