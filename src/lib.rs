pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod llm;
pub mod report;
pub mod sql;
pub mod util;
pub mod web;
