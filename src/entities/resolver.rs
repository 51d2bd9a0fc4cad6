use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "resolvers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Canonical `/regex/options` expression
    pub mount_point: String,
    pub mount_regex: String,
    pub mount_options: String,
    pub priority: i64,
    pub resolver_type: String,
    pub is_root_resolver: i64,
    pub config: String, // JSON-encoded strategy parameters
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
