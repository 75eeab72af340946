pub mod adb;
pub mod bundler;
pub mod chunker;
pub mod config;
pub mod device;
pub mod error;
pub mod plan;
pub mod push;
pub mod reassembly;
pub mod scanner;

pub use error::{Result, TransferError};
