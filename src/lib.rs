pub mod checkpoint;
pub mod complexity;
pub mod config;
pub mod diff;
pub mod error;
pub mod gate;
pub mod inspector;
pub mod rollback;
pub mod runner;
pub mod scanner;
pub mod server;
pub mod session;
pub mod tools;
pub mod workspace;
