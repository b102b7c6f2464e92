use crate::entities::{file_records, prelude::*};
use crate::models::{CompressionAlgorithm, FileRecord, StatusFields, TransferStatus};
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, SqlErr,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Duplicate file id: {0}")]
    DuplicateId(String),

    #[error("File record not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("Record invariant violated for {id}: {reason}")]
    InvariantViolation { id: String, reason: String },

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

/// Durable id → [`FileRecord`] mapping.
///
/// Writes go straight to the database and are committed before the call
/// returns. Status updates are compare-and-set on the row's current status,
/// so writers for different ids never contend on anything but the database
/// itself.
#[derive(Clone)]
pub struct MetadataStore {
    db: DatabaseConnection,
}

impl MetadataStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn create(&self, record: &FileRecord) -> Result<(), StoreError> {
        if record.status != TransferStatus::Pending || record.storage_locator.is_some() {
            return Err(StoreError::InvariantViolation {
                id: record.id.clone(),
                reason: "records are created pending and without a locator".to_string(),
            });
        }

        let model = file_records::ActiveModel {
            id: Set(record.id.clone()),
            owner: Set(record.owner.clone()),
            original_name: Set(record.original_name.clone()),
            original_size: Set(record.original_size as i64),
            compression: Set(record.compression.as_str().to_string()),
            compression_level: Set(record.compression_level.map(|l| l as i32)),
            compressed_size: Set(None),
            storage_locator: Set(None),
            status: Set(record.status.as_str().to_string()),
            created_at: Set(record.created_at),
            completed_at: Set(None),
            error_detail: Set(None),
        };

        match model.insert(&self.db).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Err(StoreError::DuplicateId(record.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<FileRecord, StoreError> {
        let model = FileRecords::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        FileRecord::try_from(model)
    }

    /// Moves `id` to `next`, applying the fields that belong to that step.
    pub async fn update_status(
        &self,
        id: &str,
        next: TransferStatus,
        fields: StatusFields,
    ) -> Result<FileRecord, StoreError> {
        let current = self.get(id).await?;
        if !current.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: next,
            });
        }
        check_fields(&current, next, &fields)?;

        let mut updated = current.clone();
        let mut model = file_records::ActiveModel {
            status: Set(next.as_str().to_string()),
            ..Default::default()
        };

        if let Some(size) = fields.compressed_size {
            model.compressed_size = Set(Some(size as i64));
            updated.compressed_size = Some(size);
        }
        if let Some(locator) = fields.storage_locator {
            model.storage_locator = Set(Some(locator.clone()));
            updated.storage_locator = Some(locator);
        }
        if next == TransferStatus::Failed {
            let detail = fields
                .error_detail
                .unwrap_or_else(|| "transfer failed".to_string());
            model.error_detail = Set(Some(detail.clone()));
            updated.error_detail = Some(detail);
        }
        if next.is_terminal() {
            let now = Utc::now();
            model.completed_at = Set(Some(now));
            updated.completed_at = Some(now);
        }
        updated.status = next;

        let result = FileRecords::update_many()
            .set(model)
            .filter(file_records::Column::Id.eq(id))
            .filter(file_records::Column::Status.eq(current.status.as_str()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            // Lost a race with another writer for the same id
            let latest = self.get(id).await?;
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: latest.status,
                to: next,
            });
        }

        Ok(updated)
    }

    /// Records owned by `owner`, oldest first.
    pub async fn list_by_owner(&self, owner: &str) -> Result<Vec<FileRecord>, StoreError> {
        FileRecords::find()
            .filter(file_records::Column::Owner.eq(owner))
            .order_by_asc(file_records::Column::CreatedAt)
            .order_by_asc(file_records::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(FileRecord::try_from)
            .collect()
    }

    /// Removes a record. Only called by explicit delete operations.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let result = FileRecords::delete_by_id(id).exec(&self.db).await?;
        if result.rows_affected == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Fails every record still in flight. Run once at startup, before any
    /// transfer is accepted, so a crashed process leaves nothing stuck.
    pub async fn fail_interrupted(&self, reason: &str) -> Result<u64, StoreError> {
        let model = file_records::ActiveModel {
            status: Set(TransferStatus::Failed.as_str().to_string()),
            error_detail: Set(Some(reason.to_string())),
            completed_at: Set(Some(Utc::now())),
            ..Default::default()
        };

        let result = FileRecords::update_many()
            .set(model)
            .filter(file_records::Column::Status.is_in([
                TransferStatus::Pending.as_str(),
                TransferStatus::Compressing.as_str(),
                TransferStatus::Uploading.as_str(),
            ]))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected)
    }
}

fn check_fields(
    current: &FileRecord,
    next: TransferStatus,
    fields: &StatusFields,
) -> Result<(), StoreError> {
    let violation = |reason: &str| {
        Err(StoreError::InvariantViolation {
            id: current.id.clone(),
            reason: reason.to_string(),
        })
    };

    match (next, &fields.storage_locator) {
        (TransferStatus::Stored, None) => return violation("stored records need a locator"),
        (TransferStatus::Stored, Some(_)) => {}
        (_, Some(_)) => return violation("only stored records carry a locator"),
        _ => {}
    }

    let leaving_compression =
        current.status == TransferStatus::Compressing && next == TransferStatus::Uploading;
    match (current.compression, fields.compressed_size) {
        (CompressionAlgorithm::None, Some(_)) => {
            return violation("uncompressed records have no compressed size");
        }
        (CompressionAlgorithm::None, None) => {}
        (_, Some(_)) if !leaving_compression => {
            return violation("compressed size is set when compression completes");
        }
        (_, None) if leaving_compression => {
            return violation("compression completed without a compressed size");
        }
        (_, None) if current.status == TransferStatus::Pending
            && next == TransferStatus::Uploading =>
        {
            return violation("compressed records cannot skip compression");
        }
        _ => {}
    }

    if fields.error_detail.is_some() && next != TransferStatus::Failed {
        return violation("error detail is only recorded on failure");
    }

    Ok(())
}

impl TryFrom<file_records::Model> for FileRecord {
    type Error = StoreError;

    fn try_from(model: file_records::Model) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: model.id.clone(),
            reason,
        };
        let unsigned = |value: i64, field: &str| {
            u64::try_from(value).map_err(|_| corrupt(format!("negative {}: {}", field, value)))
        };

        let status = model.status.parse::<TransferStatus>().map_err(corrupt)?;
        let compression = model
            .compression
            .parse::<CompressionAlgorithm>()
            .map_err(|e| corrupt(e.to_string()))?;
        let original_size = unsigned(model.original_size, "original size")?;
        let compressed_size = model
            .compressed_size
            .map(|v| unsigned(v, "compressed size"))
            .transpose()?;
        let compression_level = model
            .compression_level
            .map(|l| u32::try_from(l).map_err(|_| corrupt(format!("bad level {}", l))))
            .transpose()?;

        Ok(FileRecord {
            id: model.id,
            owner: model.owner,
            original_name: model.original_name,
            original_size,
            compression,
            compression_level,
            compressed_size,
            storage_locator: model.storage_locator,
            status,
            created_at: model.created_at,
            completed_at: model.completed_at,
            error_detail: model.error_detail,
        })
    }
}
