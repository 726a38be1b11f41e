pub mod config;
pub mod export;
pub mod ingest;
pub mod init;
pub mod review;
pub mod run;
pub mod sample;
pub mod stats;
pub mod status;
