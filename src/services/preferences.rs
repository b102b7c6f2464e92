use crate::entities::{owner_settings, prelude::*};
use crate::models::{CompressionAlgorithm, CompressionPreference};
use crate::services::compression::{CompressionError, validate_level};
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, DbErr, EntityTrait};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreferenceError {
    #[error(transparent)]
    Invalid(#[from] CompressionError),

    #[error("Corrupt settings for {owner}: {reason}")]
    Corrupt { owner: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

/// Per-owner compression preferences, one row per owner.
#[derive(Clone)]
pub struct PreferenceStore {
    db: DatabaseConnection,
}

impl PreferenceStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get(&self, owner: &str) -> Result<Option<CompressionPreference>, PreferenceError> {
        OwnerSettings::find_by_id(owner)
            .one(&self.db)
            .await?
            .map(CompressionPreference::try_from)
            .transpose()
    }

    /// Creates or replaces `owner`'s preference.
    ///
    /// `algorithm` must be a real codec; owners opt out with `enabled = false`.
    pub async fn save(
        &self,
        owner: &str,
        enabled: bool,
        algorithm: CompressionAlgorithm,
        level: Option<u32>,
    ) -> Result<CompressionPreference, PreferenceError> {
        if algorithm == CompressionAlgorithm::None {
            return Err(CompressionError::UnsupportedAlgorithm(
                "preferred codec must be zip, gzip or lzma; set enabled=false to store uncompressed"
                    .to_string(),
            )
            .into());
        }
        if let Some(level) = level {
            validate_level(algorithm, level)?;
        }

        let preference = CompressionPreference {
            owner: owner.to_string(),
            enabled,
            algorithm,
            level,
            updated_at: Utc::now(),
        };
        let model = owner_settings::ActiveModel {
            owner: Set(preference.owner.clone()),
            compression_enabled: Set(preference.enabled),
            compression: Set(preference.algorithm.as_str().to_string()),
            compression_level: Set(preference.level.map(|l| l as i32)),
            updated_at: Set(preference.updated_at),
        };

        OwnerSettings::insert(model)
            .on_conflict(
                OnConflict::column(owner_settings::Column::Owner)
                    .update_columns([
                        owner_settings::Column::CompressionEnabled,
                        owner_settings::Column::Compression,
                        owner_settings::Column::CompressionLevel,
                        owner_settings::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        tracing::info!(
            "⚙️  {} prefers {} (level {:?}, enabled: {})",
            owner,
            algorithm,
            level,
            enabled
        );
        Ok(preference)
    }

    /// Drops `owner`'s preference. Returns whether one existed.
    pub async fn clear(&self, owner: &str) -> Result<bool, PreferenceError> {
        let result = OwnerSettings::delete_by_id(owner).exec(&self.db).await?;
        Ok(result.rows_affected > 0)
    }
}

impl TryFrom<owner_settings::Model> for CompressionPreference {
    type Error = PreferenceError;

    fn try_from(model: owner_settings::Model) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| PreferenceError::Corrupt {
            owner: model.owner.clone(),
            reason,
        };
        let algorithm = model
            .compression
            .parse::<CompressionAlgorithm>()
            .map_err(|e| corrupt(e.to_string()))?;
        let level = model
            .compression_level
            .map(|l| u32::try_from(l).map_err(|_| corrupt(format!("bad level {}", l))))
            .transpose()?;

        Ok(CompressionPreference {
            owner: model.owner,
            enabled: model.compression_enabled,
            algorithm,
            level,
            updated_at: model.updated_at,
        })
    }
}
