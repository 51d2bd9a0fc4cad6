use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "locations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub href: String,
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub port: Option<i32>,
    pub path: String,
    pub hash: Option<String>,
    pub search: Option<String>,
    pub auth: Option<String>, // JSON-encoded Vec<String> of group names
    pub driver: Option<String>,
    pub entity_id: Option<String>,
    pub expires_at: Option<i64>,
    pub cache_expire_in: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
