pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod items;
pub mod leaderboard;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod upstream;
pub mod utils;
