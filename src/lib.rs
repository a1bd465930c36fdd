pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod generation;
pub mod ledger;
pub mod model;
pub mod payload;
pub mod processor;
pub mod schedule;
pub mod sweeper;
pub mod timezone;
pub mod worker;
