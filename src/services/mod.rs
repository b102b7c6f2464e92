pub mod compression;
pub mod file_service;
pub mod id_generator;
pub mod metadata_store;
pub mod preferences;
pub mod progress;
pub mod storage;
pub mod transfer;
pub mod worker;
