pub mod config;
pub mod db;
pub mod jobs;
pub mod logging;
pub mod repositories;
