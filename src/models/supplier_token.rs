use chrono::{DateTime, Duration, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Primary key of the single token row.
pub const SINGLETON_ID: i32 = 1;

/// Database entity for the supplier OAuth token
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "supplier_tokens")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i32,
    #[sea_orm(column_type = "Text")]
    pub access_token: String,
    #[sea_orm(column_type = "Text")]
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Bearer credentials for the supplier API.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl SupplierToken {
    pub fn issued_at(
        now: DateTime<Utc>,
        access_token: String,
        refresh_token: String,
        expires_in_secs: i64,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: now + Duration::seconds(expires_in_secs),
        }
    }

    /// True when less than `margin` of validity remains at `now`.
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - now < margin
    }
}

impl std::fmt::Debug for SupplierToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupplierToken")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl From<Model> for SupplierToken {
    fn from(model: Model) -> Self {
        Self {
            access_token: model.access_token,
            refresh_token: model.refresh_token,
            expires_at: model.expires_at,
        }
    }
}
