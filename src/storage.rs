use crate::auth::scope;
use crate::cache;
use crate::entities;
use crate::errors::{MeridianError, Result};
use crate::location::{Entity, EntityKind, Location};
use crate::mount_point::{MountPoint, MountPointSpec};
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use chrono::Utc;
use rand::{Rng, RngCore};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, IntoActiveModel,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use sea_orm_migration::MigratorTrait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const ROOT_RESOLVER_TYPE: &str = "RootResolver";
pub const ROOT_MOUNT_POINT: &str = ".*";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverRecord {
    pub id: String,
    pub mount_point: MountPoint,
    pub priority: i64,
    pub resolver_type: String,
    pub is_root_resolver: bool,
    pub config: Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResolver {
    pub mount_point: MountPointSpec,
    #[serde(default)]
    pub priority: Option<i64>,
    pub resolver_type: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverUpdate {
    #[serde(default)]
    pub mount_point: Option<MountPointSpec>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub config: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverFilter {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub resolver_type: Option<String>,
    #[serde(default)]
    pub mount_point: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationFilter {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityFilter {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub source_href: Option<String>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub subject: String,
    pub username: String,
    pub scope: Vec<String>,
    pub disabled: bool,
    #[serde(default)]
    pub identities: Vec<Identity>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub scope: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserUpdate {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub scope: Option<Vec<String>>,
    #[serde(default)]
    pub disabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub subject: String,
    pub provider: String,
    pub provider_user_id: String,
    pub profile: Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Provider,
    Consumer,
    Registration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    pub client_secret: String,
    pub client_name: Option<String>,
    pub redirect_uri: Option<String>,
    pub roles: Vec<ClientRole>,
    /// Ceiling on grantable scopes, as regex patterns
    pub scope: Vec<String>,
    pub default_user: Option<String>,
    pub created_at: i64,
}

impl Client {
    pub fn has_role(&self, role: ClientRole) -> bool {
        self.roles.contains(&role)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewClient {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub roles: Vec<ClientRole>,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub default_user: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Bearer,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Bearer => "bearer",
            TokenType::Refresh => "refresh",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "bearer" => Ok(TokenType::Bearer),
            "refresh" => Ok(TokenType::Refresh),
            other => Err(MeridianError::Other(format!("unknown token type `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: String,
    pub token_type: TokenType,
    pub token: String,
    pub scope: Vec<String>,
    pub client_id: String,
    pub subject: String,
    pub linked_token: Option<String>,
    pub expires_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStateKind {
    /// Outbound leg to a federated provider
    Provider,
    /// Authorization code handed back to the consumer
    Code,
}

impl AuthStateKind {
    fn as_str(&self) -> &'static str {
        match self {
            AuthStateKind::Provider => "provider",
            AuthStateKind::Code => "code",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthState {
    pub code: String,
    pub kind: AuthStateKind,
    pub client_id: String,
    pub redirect_uri: Option<String>,
    pub scope: Vec<String>,
    pub subject: Option<String>,
    pub provider: Option<String>,
    pub client_state: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection> {
    let db = Database::connect(&cfg.url).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

/// Alphanumeric code for short URLs.
pub fn random_code(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn now() -> i64 {
    Utc::now().timestamp()
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

// ============================================================================
// Locations
// ============================================================================

fn location_from_model(model: entities::location::Model) -> Result<Location> {
    let auth = match model.auth {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };

    Ok(Location {
        id: Some(model.id),
        href: model.href,
        protocol: model.protocol,
        host: model.host,
        port: model.port.and_then(|p| u16::try_from(p).ok()),
        path: model.path,
        hash: model.hash,
        search: model.search,
        auth,
        driver: model.driver,
        entity_id: model.entity_id,
        entity: None,
        expires_at: model.expires_at,
        cache_expire_in: model.cache_expire_in,
        created_at: Some(model.created_at),
        updated_at: Some(model.updated_at),
    })
}

pub async fn create_location(db: &DatabaseConnection, mut location: Location) -> Result<Location> {
    location.canonicalize()?;
    let now = now();
    let id = random_id();
    let auth = location.auth.as_ref().map(to_json).transpose()?;

    let model = entities::location::ActiveModel {
        id: Set(id),
        href: Set(location.href.clone()),
        protocol: Set(location.protocol.clone()),
        host: Set(location.host.clone()),
        port: Set(location.port.map(i32::from)),
        path: Set(location.path.clone()),
        hash: Set(location.hash.clone()),
        search: Set(location.search.clone()),
        auth: Set(auth),
        driver: Set(location.driver.clone()),
        entity_id: Set(location.entity_id.clone()),
        expires_at: Set(location.expires_at),
        cache_expire_in: Set(location.cache_expire_in),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?;

    cache::clear(db).await?;
    location_from_model(model)
}

pub async fn get_location(db: &DatabaseConnection, id: &str) -> Result<Option<Location>> {
    entities::Location::find_by_id(id.to_string())
        .one(db)
        .await?
        .map(location_from_model)
        .transpose()
}

/// Live location with exactly this href. Locations past `expires_at` are treated as absent.
pub async fn get_location_by_href(db: &DatabaseConnection, href: &str) -> Result<Option<Location>> {
    use entities::location::Column;

    let Some(model) = entities::Location::find()
        .filter(Column::Href.eq(href))
        .one(db)
        .await?
    else {
        return Ok(None);
    };

    if model.expires_at.is_some_and(|at| at <= now()) {
        return Ok(None);
    }
    location_from_model(model).map(Some)
}

pub async fn find_locations(db: &DatabaseConnection, filter: LocationFilter) -> Result<Vec<Location>> {
    use entities::location::Column;

    let mut query = entities::Location::find();
    if let Some(id) = filter.id {
        query = query.filter(Column::Id.eq(id));
    }
    if let Some(href) = filter.href {
        query = query.filter(Column::Href.eq(href));
    }
    if let Some(driver) = filter.driver {
        query = query.filter(Column::Driver.eq(driver));
    }
    if let Some(entity_id) = filter.entity_id {
        query = query.filter(Column::EntityId.eq(entity_id));
    }
    if let Some(limit) = filter.limit {
        query = query.limit(limit);
    }

    query
        .order_by_asc(Column::Href)
        .all(db)
        .await?
        .into_iter()
        .map(location_from_model)
        .collect()
}

/// Replace the stored location `id` with `location`, re-deriving the href.
pub async fn update_location(
    db: &DatabaseConnection,
    id: &str,
    mut location: Location,
) -> Result<Location> {
    let existing = entities::Location::find_by_id(id.to_string())
        .one(db)
        .await?
        .ok_or_else(|| MeridianError::NotFound(format!("location {id}")))?;

    location.canonicalize()?;
    let auth = location.auth.as_ref().map(to_json).transpose()?;

    let mut active = existing.into_active_model();
    active.href = Set(location.href);
    active.protocol = Set(location.protocol);
    active.host = Set(location.host);
    active.port = Set(location.port.map(i32::from));
    active.path = Set(location.path);
    active.hash = Set(location.hash);
    active.search = Set(location.search);
    active.auth = Set(auth);
    active.driver = Set(location.driver);
    active.entity_id = Set(location.entity_id);
    active.expires_at = Set(location.expires_at);
    active.cache_expire_in = Set(location.cache_expire_in);
    active.updated_at = Set(now());

    let model = active.update(db).await?;
    cache::clear(db).await?;
    location_from_model(model)
}

pub async fn delete_locations(db: &DatabaseConnection, filter: LocationFilter) -> Result<u64> {
    use entities::location::Column;

    if filter.id.is_none()
        && filter.href.is_none()
        && filter.driver.is_none()
        && filter.entity_id.is_none()
    {
        return Err(MeridianError::MalformedRequest(
            "refusing to delete every location".to_string(),
        ));
    }

    let mut query = entities::Location::delete_many();
    if let Some(id) = filter.id {
        query = query.filter(Column::Id.eq(id));
    }
    if let Some(href) = filter.href {
        query = query.filter(Column::Href.eq(href));
    }
    if let Some(driver) = filter.driver {
        query = query.filter(Column::Driver.eq(driver));
    }
    if let Some(entity_id) = filter.entity_id {
        query = query.filter(Column::EntityId.eq(entity_id));
    }
    let deleted = query.exec(db).await?.rows_affected;
    cache::clear(db).await?;
    Ok(deleted)
}

/// Attach the owning entity, with its source location, to `location`.
pub async fn populate_entity(db: &DatabaseConnection, location: &mut Location) -> Result<()> {
    let Some(entity_id) = location.entity_id.as_deref() else {
        return Ok(());
    };
    let Some(mut entity) = get_entity(db, entity_id).await? else {
        tracing::warn!(href = %location.href, entity_id, "location points at a missing entity");
        return Ok(());
    };

    entity.source = get_location_by_href(db, &entity.source_href)
        .await?
        .map(Box::new);
    location.entity = Some(Box::new(entity));
    Ok(())
}

pub async fn attach_entity(db: &DatabaseConnection, location_id: &str, entity_id: &str) -> Result<()> {
    let existing = entities::Location::find_by_id(location_id.to_string())
        .one(db)
        .await?
        .ok_or_else(|| MeridianError::NotFound(format!("location {location_id}")))?;

    let mut active = existing.into_active_model();
    active.entity_id = Set(Some(entity_id.to_string()));
    active.updated_at = Set(now());
    active.update(db).await?;
    cache::clear(db).await?;
    Ok(())
}

/// Mint a `/s/<code>` location redirecting to `target`.
pub async fn create_short_url(
    db: &DatabaseConnection,
    public_base_url: &str,
    code_len: usize,
    target: &str,
    user: Option<String>,
) -> Result<Location> {
    Location::from_href(target)?;

    let href = format!("{}/s/{}", public_base_url.trim_end_matches('/'), random_code(code_len));
    let entity = create_entity(
        db,
        &href,
        EntityKind::Redirect {
            target: Some(target.to_string()),
            permanent: false,
        },
        user,
    )
    .await?;

    let mut location = Location::from_href(&href)?;
    location.driver = Some("Redirect".to_string());
    location.entity_id = Some(entity.id);
    create_location(db, location).await
}

// ============================================================================
// Entities
// ============================================================================

fn entity_from_model(model: entities::entity::Model) -> Result<Entity> {
    let data: Value = serde_json::from_str(&model.data)?;
    let kind: EntityKind = serde_json::from_value(json!({
        "type": model.entity_type,
        "data": data,
    }))?;

    Ok(Entity {
        id: model.id,
        source_href: model.source_href,
        source: None,
        kind,
        user: model.user_subject,
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}

fn kind_data(kind: &EntityKind) -> Result<String> {
    let value = serde_json::to_value(kind)?;
    to_json(value.get("data").unwrap_or(&Value::Null))
}

pub async fn create_entity(
    db: &DatabaseConnection,
    source_href: &str,
    kind: EntityKind,
    user: Option<String>,
) -> Result<Entity> {
    let now = now();
    let model = entities::entity::ActiveModel {
        id: Set(random_id()),
        source_href: Set(source_href.to_string()),
        entity_type: Set(kind.type_name().to_string()),
        data: Set(kind_data(&kind)?),
        user_subject: Set(user),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?;

    cache::clear(db).await?;
    entity_from_model(model)
}

pub async fn get_entity(db: &DatabaseConnection, id: &str) -> Result<Option<Entity>> {
    entities::ResourceEntity::find_by_id(id.to_string())
        .one(db)
        .await?
        .map(entity_from_model)
        .transpose()
}

pub async fn find_entities(db: &DatabaseConnection, filter: EntityFilter) -> Result<Vec<Entity>> {
    use entities::entity::Column;

    let mut query = entities::ResourceEntity::find();
    if let Some(id) = filter.id {
        query = query.filter(Column::Id.eq(id));
    }
    if let Some(source_href) = filter.source_href {
        query = query.filter(Column::SourceHref.eq(source_href));
    }
    if let Some(entity_type) = filter.entity_type {
        query = query.filter(Column::EntityType.eq(entity_type));
    }
    if let Some(user) = filter.user {
        query = query.filter(Column::UserSubject.eq(user));
    }

    query
        .order_by_asc(Column::CreatedAt)
        .all(db)
        .await?
        .into_iter()
        .map(entity_from_model)
        .collect()
}

pub async fn update_entity(
    db: &DatabaseConnection,
    id: &str,
    kind: EntityKind,
    user: Option<String>,
) -> Result<Entity> {
    let existing = entities::ResourceEntity::find_by_id(id.to_string())
        .one(db)
        .await?
        .ok_or_else(|| MeridianError::NotFound(format!("entity {id}")))?;

    let mut active = existing.into_active_model();
    active.entity_type = Set(kind.type_name().to_string());
    active.data = Set(kind_data(&kind)?);
    if user.is_some() {
        active.user_subject = Set(user);
    }
    active.updated_at = Set(now());

    let model = active.update(db).await?;
    cache::clear(db).await?;
    entity_from_model(model)
}

pub async fn delete_entities(db: &DatabaseConnection, filter: EntityFilter) -> Result<u64> {
    use entities::entity::Column;

    if filter.id.is_none()
        && filter.source_href.is_none()
        && filter.entity_type.is_none()
        && filter.user.is_none()
    {
        return Err(MeridianError::MalformedRequest(
            "refusing to delete every entity".to_string(),
        ));
    }

    let mut query = entities::ResourceEntity::delete_many();
    if let Some(id) = filter.id {
        query = query.filter(Column::Id.eq(id));
    }
    if let Some(source_href) = filter.source_href {
        query = query.filter(Column::SourceHref.eq(source_href));
    }
    if let Some(entity_type) = filter.entity_type {
        query = query.filter(Column::EntityType.eq(entity_type));
    }
    if let Some(user) = filter.user {
        query = query.filter(Column::UserSubject.eq(user));
    }
    let deleted = query.exec(db).await?.rows_affected;
    cache::clear(db).await?;
    Ok(deleted)
}

// ============================================================================
// Resolvers
// ============================================================================

pub fn resolver_from_model(model: entities::resolver::Model) -> Result<ResolverRecord> {
    Ok(ResolverRecord {
        mount_point: MountPoint {
            expression: model.mount_point,
            regex: model.mount_regex,
            options: model.mount_options,
        },
        id: model.id,
        priority: model.priority,
        resolver_type: model.resolver_type,
        is_root_resolver: model.is_root_resolver != 0,
        config: serde_json::from_str(&model.config)?,
        created_at: model.created_at,
    })
}

/// Next free priority for `mount`: the number of resolvers already sharing it,
/// bumped past the highest one in use so deleted slots are never reused.
pub async fn get_next_resolver_priority(db: &DatabaseConnection, mount: &MountPoint) -> Result<i64> {
    use entities::resolver::Column;

    let siblings = entities::Resolver::find().filter(Column::MountPoint.eq(&mount.expression));
    let count = siblings.clone().count(db).await? as i64;
    let highest = siblings
        .order_by_desc(Column::Priority)
        .one(db)
        .await?
        .map(|m| m.priority + 1)
        .unwrap_or(0);

    Ok(count.max(highest))
}

pub async fn create_resolver(db: &DatabaseConnection, input: NewResolver) -> Result<ResolverRecord> {
    let mount = input.mount_point.normalize()?;
    let priority = match input.priority {
        Some(p) => p,
        None => get_next_resolver_priority(db, &mount).await?,
    };
    let config = if input.config.is_null() {
        json!({})
    } else {
        input.config
    };
    let is_root = input.resolver_type == ROOT_RESOLVER_TYPE;

    let model = entities::resolver::ActiveModel {
        id: Set(random_id()),
        mount_point: Set(mount.expression),
        mount_regex: Set(mount.regex),
        mount_options: Set(mount.options),
        priority: Set(priority),
        resolver_type: Set(input.resolver_type),
        is_root_resolver: Set(if is_root { 1 } else { 0 }),
        config: Set(to_json(&config)?),
        created_at: Set(now()),
    }
    .insert(db)
    .await?;

    cache::clear(db).await?;
    resolver_from_model(model)
}

pub async fn get_resolver(db: &DatabaseConnection, id: &str) -> Result<Option<ResolverRecord>> {
    entities::Resolver::find_by_id(id.to_string())
        .one(db)
        .await?
        .map(resolver_from_model)
        .transpose()
}

pub async fn find_resolvers(db: &DatabaseConnection, filter: ResolverFilter) -> Result<Vec<ResolverRecord>> {
    use entities::resolver::Column;

    let mut query = entities::Resolver::find();
    if let Some(id) = filter.id {
        query = query.filter(Column::Id.eq(id));
    }
    if let Some(resolver_type) = filter.resolver_type {
        query = query.filter(Column::ResolverType.eq(resolver_type));
    }
    if let Some(mount) = filter.mount_point {
        let mount = MountPointSpec::Expression(mount).normalize()?;
        query = query.filter(Column::MountPoint.eq(mount.expression));
    }

    query
        .order_by_desc(Column::MountPoint)
        .order_by_asc(Column::Priority)
        .all(db)
        .await?
        .into_iter()
        .map(resolver_from_model)
        .collect()
}

pub async fn update_resolver(
    db: &DatabaseConnection,
    id: &str,
    update: ResolverUpdate,
) -> Result<ResolverRecord> {
    let existing = entities::Resolver::find_by_id(id.to_string())
        .one(db)
        .await?
        .ok_or_else(|| MeridianError::NotFound(format!("resolver {id}")))?;

    let mut active = existing.into_active_model();
    if let Some(spec) = update.mount_point {
        let mount = spec.normalize()?;
        active.mount_point = Set(mount.expression);
        active.mount_regex = Set(mount.regex);
        active.mount_options = Set(mount.options);
    }
    if let Some(priority) = update.priority {
        active.priority = Set(priority);
    }
    if let Some(config) = update.config {
        active.config = Set(to_json(&config)?);
    }

    let model = active.update(db).await?;
    cache::clear(db).await?;
    resolver_from_model(model)
}

pub async fn delete_resolvers(db: &DatabaseConnection, ids: &[String]) -> Result<u64> {
    use entities::resolver::Column;

    let root_targeted = entities::Resolver::find()
        .filter(Column::Id.is_in(ids.iter().cloned()))
        .filter(Column::IsRootResolver.eq(1))
        .count(db)
        .await?;
    if root_targeted > 0 {
        return Err(MeridianError::Conflict(
            "the root resolver cannot be deleted".to_string(),
        ));
    }

    let result = entities::Resolver::delete_many()
        .filter(Column::Id.is_in(ids.iter().cloned()))
        .exec(db)
        .await?;
    cache::clear(db).await?;
    Ok(result.rows_affected)
}

pub async fn ensure_root_resolver(db: &DatabaseConnection) -> Result<ResolverRecord> {
    use entities::resolver::Column;

    if let Some(model) = entities::Resolver::find()
        .filter(Column::IsRootResolver.eq(1))
        .one(db)
        .await?
    {
        return resolver_from_model(model);
    }

    let root = create_resolver(
        db,
        NewResolver {
            mount_point: MountPointSpec::from(ROOT_MOUNT_POINT),
            priority: None,
            resolver_type: ROOT_RESOLVER_TYPE.to_string(),
            config: json!({}),
        },
    )
    .await?;
    tracing::info!(id = %root.id, "Created root resolver");
    Ok(root)
}

// ============================================================================
// Users & identities
// ============================================================================

fn hash_password(password: &str) -> Result<String> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| MeridianError::Other(format!("Password hashing failed: {}", e)))?
        .to_string())
}

fn identity_from_model(model: entities::identity::Model) -> Result<Identity> {
    Ok(Identity {
        id: model.id,
        subject: model.subject,
        provider: model.provider,
        provider_user_id: model.provider_user_id,
        profile: serde_json::from_str(&model.profile)?,
        created_at: model.created_at,
    })
}

async fn user_from_model(db: &DatabaseConnection, model: entities::user::Model) -> Result<User> {
    use entities::identity::Column;

    let identities = entities::Identity::find()
        .filter(Column::Subject.eq(&model.subject))
        .all(db)
        .await?
        .into_iter()
        .map(identity_from_model)
        .collect::<Result<Vec<_>>>()?;

    Ok(User {
        subject: model.subject,
        username: model.username,
        scope: serde_json::from_str(&model.scope)?,
        disabled: model.disabled != 0,
        identities,
        created_at: model.created_at,
    })
}

pub async fn create_user(db: &DatabaseConnection, input: NewUser) -> Result<User> {
    scope::validate_patterns(&input.scope)?;
    let password_hash = input.password.as_deref().map(hash_password).transpose()?;

    let model = entities::user::ActiveModel {
        subject: Set(random_id()),
        username: Set(input.username),
        password_hash: Set(password_hash),
        scope: Set(to_json(&input.scope)?),
        disabled: Set(0),
        created_at: Set(now()),
    }
    .insert(db)
    .await?;

    user_from_model(db, model).await
}

pub async fn get_user(db: &DatabaseConnection, subject: &str) -> Result<Option<User>> {
    match entities::User::find_by_id(subject.to_string()).one(db).await? {
        Some(model) => Ok(Some(user_from_model(db, model).await?)),
        None => Ok(None),
    }
}

pub async fn get_user_by_username(db: &DatabaseConnection, username: &str) -> Result<Option<User>> {
    use entities::user::Column;

    match entities::User::find()
        .filter(Column::Username.eq(username))
        .one(db)
        .await?
    {
        Some(model) => Ok(Some(user_from_model(db, model).await?)),
        None => Ok(None),
    }
}

pub async fn find_users(db: &DatabaseConnection, username: Option<String>) -> Result<Vec<User>> {
    use entities::user::Column;

    let mut query = entities::User::find();
    if let Some(username) = username {
        query = query.filter(Column::Username.eq(username));
    }

    let mut users = Vec::new();
    for model in query.order_by_asc(Column::Username).all(db).await? {
        users.push(user_from_model(db, model).await?);
    }
    Ok(users)
}

pub async fn update_user(db: &DatabaseConnection, subject: &str, update: UserUpdate) -> Result<User> {
    let existing = entities::User::find_by_id(subject.to_string())
        .one(db)
        .await?
        .ok_or_else(|| MeridianError::NotFound(format!("user {subject}")))?;

    let mut active = existing.into_active_model();
    if let Some(scope) = update.scope {
        scope::validate_patterns(&scope)?;
        active.scope = Set(to_json(&scope)?);
    }
    if let Some(password) = update.password {
        active.password_hash = Set(Some(hash_password(&password)?));
    }
    if let Some(disabled) = update.disabled {
        active.disabled = Set(if disabled { 1 } else { 0 });
    }

    let model = active.update(db).await?;
    user_from_model(db, model).await
}

pub async fn delete_users(db: &DatabaseConnection, subjects: &[String]) -> Result<u64> {
    use entities::user::Column;

    let result = entities::User::delete_many()
        .filter(Column::Subject.is_in(subjects.iter().cloned()))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// The enabled user matching `username`/`password`, if any.
pub async fn verify_user_password(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
) -> Result<Option<User>> {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};
    use entities::user::Column;

    let Some(model) = entities::User::find()
        .filter(Column::Username.eq(username))
        .one(db)
        .await?
    else {
        return Ok(None);
    };
    if model.disabled != 0 {
        return Ok(None);
    }
    let Some(hash) = model.password_hash.as_deref() else {
        return Ok(None);
    };

    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| MeridianError::Other(format!("Invalid password hash: {}", e)))?;

    if Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
    {
        Ok(Some(user_from_model(db, model).await?))
    } else {
        Ok(None)
    }
}

pub async fn link_identity(
    db: &DatabaseConnection,
    subject: &str,
    provider: &str,
    provider_user_id: &str,
    profile: &Value,
) -> Result<Identity> {
    let model = entities::identity::ActiveModel {
        id: Set(random_id()),
        subject: Set(subject.to_string()),
        provider: Set(provider.to_string()),
        provider_user_id: Set(provider_user_id.to_string()),
        profile: Set(to_json(profile)?),
        created_at: Set(now()),
    }
    .insert(db)
    .await?;

    identity_from_model(model)
}

pub async fn find_user_by_identity(
    db: &DatabaseConnection,
    provider: &str,
    provider_user_id: &str,
) -> Result<Option<User>> {
    use entities::identity::Column;

    let Some(identity) = entities::Identity::find()
        .filter(Column::Provider.eq(provider))
        .filter(Column::ProviderUserId.eq(provider_user_id))
        .one(db)
        .await?
    else {
        return Ok(None);
    };
    get_user(db, &identity.subject).await
}

// ============================================================================
// Clients
// ============================================================================

fn client_from_model(model: entities::client::Model) -> Result<Client> {
    Ok(Client {
        client_id: model.client_id,
        client_secret: model.client_secret,
        client_name: model.client_name,
        redirect_uri: model.redirect_uri,
        roles: serde_json::from_str(&model.roles)?,
        scope: serde_json::from_str(&model.scope)?,
        default_user: model.default_user,
        created_at: model.created_at,
    })
}

pub async fn create_client(db: &DatabaseConnection, input: NewClient) -> Result<Client> {
    scope::validate_patterns(&input.scope)?;

    let model = entities::client::ActiveModel {
        client_id: Set(input.client_id.unwrap_or_else(random_id)),
        client_secret: Set(input.client_secret.unwrap_or_else(random_id)),
        client_name: Set(input.client_name),
        redirect_uri: Set(input.redirect_uri),
        roles: Set(to_json(&input.roles)?),
        scope: Set(to_json(&input.scope)?),
        default_user: Set(input.default_user),
        created_at: Set(now()),
    }
    .insert(db)
    .await?;

    client_from_model(model)
}

pub async fn get_client(db: &DatabaseConnection, client_id: &str) -> Result<Option<Client>> {
    entities::Client::find_by_id(client_id.to_string())
        .one(db)
        .await?
        .map(client_from_model)
        .transpose()
}

// ============================================================================
// Access tokens
// ============================================================================

fn token_from_model(model: entities::access_token::Model) -> Result<AccessToken> {
    Ok(AccessToken {
        id: model.id,
        token_type: TokenType::parse(&model.token_type)?,
        token: model.token,
        scope: serde_json::from_str(&model.scope)?,
        client_id: model.client_id,
        subject: model.subject,
        linked_token: model.linked_token,
        expires_at: model.expires_at,
        created_at: model.created_at,
    })
}

pub async fn insert_token(
    db: &DatabaseConnection,
    token_type: TokenType,
    client_id: &str,
    subject: &str,
    scope: &[String],
    ttl_secs: i64,
    linked_token: Option<String>,
) -> Result<AccessToken> {
    let now = now();
    let model = entities::access_token::ActiveModel {
        id: Set(random_id()),
        token_type: Set(token_type.as_str().to_string()),
        token: Set(random_id()),
        scope: Set(to_json(scope)?),
        client_id: Set(client_id.to_string()),
        subject: Set(subject.to_string()),
        linked_token: Set(linked_token),
        expires_at: Set(now + ttl_secs),
        created_at: Set(now),
    }
    .insert(db)
    .await?;

    token_from_model(model)
}

/// Stored token by its secret, regardless of expiry.
pub async fn get_token(
    db: &DatabaseConnection,
    token_type: TokenType,
    token: &str,
) -> Result<Option<AccessToken>> {
    use entities::access_token::Column;

    entities::AccessToken::find()
        .filter(Column::TokenType.eq(token_type.as_str()))
        .filter(Column::Token.eq(token))
        .one(db)
        .await?
        .map(token_from_model)
        .transpose()
}

pub async fn get_token_by_id(db: &DatabaseConnection, id: &str) -> Result<Option<AccessToken>> {
    entities::AccessToken::find_by_id(id.to_string())
        .one(db)
        .await?
        .map(token_from_model)
        .transpose()
}

/// Refresh token issued to `client_id`, regardless of expiry.
pub async fn find_refresh_token(
    db: &DatabaseConnection,
    client_id: &str,
    token: &str,
) -> Result<Option<AccessToken>> {
    use entities::access_token::Column;

    entities::AccessToken::find()
        .filter(Column::TokenType.eq(TokenType::Refresh.as_str()))
        .filter(Column::ClientId.eq(client_id))
        .filter(Column::Token.eq(token))
        .one(db)
        .await?
        .map(token_from_model)
        .transpose()
}

/// Live refresh token for the exact `(client, user, scope)` triple.
pub async fn find_reusable_refresh_token(
    db: &DatabaseConnection,
    client_id: &str,
    subject: &str,
    scope: &[String],
) -> Result<Option<AccessToken>> {
    use entities::access_token::Column;

    entities::AccessToken::find()
        .filter(Column::TokenType.eq(TokenType::Refresh.as_str()))
        .filter(Column::ClientId.eq(client_id))
        .filter(Column::Subject.eq(subject))
        .filter(Column::Scope.eq(to_json(scope)?))
        .filter(Column::ExpiresAt.gt(now()))
        .order_by_desc(Column::ExpiresAt)
        .one(db)
        .await?
        .map(token_from_model)
        .transpose()
}

pub async fn set_linked_token(db: &DatabaseConnection, id: &str, linked_token: &str) -> Result<()> {
    let existing = entities::AccessToken::find_by_id(id.to_string())
        .one(db)
        .await?
        .ok_or_else(|| MeridianError::NotFound(format!("token {id}")))?;

    let mut active = existing.into_active_model();
    active.linked_token = Set(Some(linked_token.to_string()));
    active.update(db).await?;
    Ok(())
}

/// Tokens of `subject` still valid at `at`, newest expiry first.
pub async fn live_tokens_for_subject(
    db: &DatabaseConnection,
    subject: &str,
    at: i64,
) -> Result<Vec<AccessToken>> {
    use entities::access_token::Column;

    entities::AccessToken::find()
        .filter(Column::Subject.eq(subject))
        .filter(Column::ExpiresAt.gt(at))
        .order_by_desc(Column::ExpiresAt)
        .all(db)
        .await?
        .into_iter()
        .map(token_from_model)
        .collect()
}

pub async fn purge_expired_tokens(db: &DatabaseConnection) -> Result<u64> {
    use entities::access_token::Column;

    let result = entities::AccessToken::delete_many()
        .filter(Column::ExpiresAt.lte(now()))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

// ============================================================================
// Authorization states
// ============================================================================

fn auth_state_from_model(model: entities::auth_state::Model) -> Result<AuthState> {
    let kind = match model.kind.as_str() {
        "provider" => AuthStateKind::Provider,
        "code" => AuthStateKind::Code,
        other => return Err(MeridianError::Other(format!("unknown auth state `{other}`"))),
    };

    Ok(AuthState {
        code: model.code,
        kind,
        client_id: model.client_id,
        redirect_uri: model.redirect_uri,
        scope: serde_json::from_str(&model.scope)?,
        subject: model.subject,
        provider: model.provider,
        client_state: model.client_state,
        created_at: model.created_at,
        expires_at: model.expires_at,
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn create_auth_state(
    db: &DatabaseConnection,
    kind: AuthStateKind,
    client_id: &str,
    redirect_uri: Option<String>,
    scope: &[String],
    subject: Option<String>,
    provider: Option<String>,
    client_state: Option<String>,
    ttl_secs: i64,
) -> Result<AuthState> {
    let now = now();
    let model = entities::auth_state::ActiveModel {
        code: Set(random_id()),
        kind: Set(kind.as_str().to_string()),
        client_id: Set(client_id.to_string()),
        redirect_uri: Set(redirect_uri),
        scope: Set(to_json(scope)?),
        subject: Set(subject),
        provider: Set(provider),
        client_state: Set(client_state),
        created_at: Set(now),
        expires_at: Set(now + ttl_secs),
    }
    .insert(db)
    .await?;

    auth_state_from_model(model)
}

/// Remove and return a live state record. Each code can be redeemed once.
pub async fn consume_auth_state(
    db: &DatabaseConnection,
    code: &str,
    kind: AuthStateKind,
) -> Result<Option<AuthState>> {
    use entities::auth_state::Column;

    let Some(model) = entities::AuthState::find_by_id(code.to_string())
        .filter(Column::Kind.eq(kind.as_str()))
        .one(db)
        .await?
    else {
        return Ok(None);
    };

    let result = entities::AuthState::delete_by_id(code.to_string())
        .exec(db)
        .await?;
    if result.rows_affected == 0 || model.expires_at <= now() {
        return Ok(None);
    }
    auth_state_from_model(model).map(Some)
}

pub async fn purge_expired_auth_states(db: &DatabaseConnection) -> Result<u64> {
    use entities::auth_state::Column;

    let result = entities::AuthState::delete_many()
        .filter(Column::ExpiresAt.lte(now()))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}
