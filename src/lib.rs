pub mod config;
pub mod dispatch;
pub mod domain_utils;
pub mod error;
pub mod ledger;
pub mod mail;
pub mod message;
pub mod normalization;
pub mod parser;
pub mod server;
pub mod watcher;

pub use config::Config;
pub use dispatch::Dispatcher;
pub use ledger::{Ledger, SqliteLedger};
pub use parser::{AppointmentParser, AppointmentRecord};
pub use watcher::{CycleReport, Watcher, WatcherPhase};
