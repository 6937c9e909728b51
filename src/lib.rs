pub mod backend;
pub mod capture;
pub mod config;
pub mod error;
pub mod memory;
pub mod paths;
pub mod permissions;
pub mod pipeline;
pub mod scaler;
pub mod selection;
