pub use super::file_records::Entity as FileRecords;
pub use super::owner_settings::Entity as OwnerSettings;
