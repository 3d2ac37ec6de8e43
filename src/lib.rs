pub mod clock;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod models;
pub mod reply;
pub mod schedule;
pub mod server;
pub mod templates;
