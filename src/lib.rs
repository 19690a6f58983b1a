pub mod artifacts;
pub mod cli;
pub mod engine;
pub mod export;
pub mod invoke;
pub mod storage;
pub mod workflows;
