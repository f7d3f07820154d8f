pub mod app;
pub mod cleanup;
pub mod error;
pub mod events;
pub mod executor;
pub mod inventory;
pub mod plan;
pub mod remote;
pub mod session;
pub mod settings;
pub mod state;
pub mod transfer;
pub mod types;
pub mod ui;
