pub mod config;
pub mod imports;
pub mod spotify;
pub mod sqlite_persistence;
pub mod storage;
