//! JSON-RPC 2.0 endpoint mounted at `POST /rpc`.
//!
//! Every method is authorised with the scope `rpc.<method>`. Parameters are
//! either an object or a positional array mapped onto the method's parameter
//! names in order.
use crate::auth::scope::parse_scope_param;
use crate::auth::{get_access_token, Principal, ScopeTokenSearch, TokenForm};
use crate::drivers::{self, ipfs, s3};
use crate::errors::MeridianError;
use crate::location::{EntityKind, Location};
use crate::mount_point::MountPointSpec;
use crate::resolver::ResolveOptions;
use crate::storage::{
    self, EntityFilter, LocationFilter, NewClient, NewResolver, NewUser, ResolverFilter,
    ResolverUpdate, UserUpdate, ROOT_RESOLVER_TYPE,
};
use crate::web::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// Method name and positional parameter names.
const METHODS: &[(&str, &[&str])] = &[
    ("resolve", &["location", "options"]),
    ("createLocation", &["location"]),
    ("findLocations", &["filter"]),
    ("updateLocation", &["id", "location"]),
    ("deleteLocations", &["filter"]),
    ("createResolver", &["resolver"]),
    ("findResolvers", &["filter"]),
    ("updateResolver", &["id", "update"]),
    ("deleteResolvers", &["ids"]),
    ("getNextResolverPriority", &["mountPoint"]),
    ("createEntity", &["sourceHref", "entity"]),
    ("findEntities", &["filter"]),
    ("updateEntity", &["id", "entity"]),
    ("deleteEntities", &["filter"]),
    ("createUser", &["user"]),
    ("findUsers", &["username"]),
    ("updateUser", &["subject", "update"]),
    ("deleteUsers", &["subjects"]),
    ("createS3EntityFromLocation", &["href", "bucket", "key"]),
    ("createIPFSEntityFromLocation", &["href"]),
    ("pinIPFSEntity", &["id"]),
    ("unpinIPFSEntity", &["id"]),
    ("getAccessToken", &["form"]),
    ("getAccessTokensForScope", &["scope"]),
    ("createShortUrl", &["target"]),
    ("copyLocation", &["from", "to"]),
    ("createClient", &["client"]),
];

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

#[derive(Debug, Serialize)]
struct ErrorObject {
    code: i64,
    message: String,
    data: Value,
}

enum RpcError {
    Protocol {
        code: i64,
        message: String,
        status: StatusCode,
    },
    Domain(MeridianError),
}

impl From<MeridianError> for RpcError {
    fn from(value: MeridianError) -> Self {
        RpcError::Domain(value)
    }
}

impl RpcError {
    fn protocol(code: i64, message: impl Into<String>, status: StatusCode) -> Self {
        RpcError::Protocol {
            code,
            message: message.into(),
            status,
        }
    }

    fn into_object(self) -> ErrorObject {
        match self {
            RpcError::Protocol {
                code,
                message,
                status,
            } => {
                tracing::warn!(code, %message, "rpc request rejected");
                ErrorObject {
                    code,
                    message,
                    data: json!({ "httpCode": status.as_u16() }),
                }
            }
            RpcError::Domain(e) => {
                e.log();
                ErrorObject {
                    code: i64::from(e.code()),
                    message: e.public_message(),
                    data: json!({ "httpCode": e.status().as_u16() }),
                }
            }
        }
    }
}

type RpcResult = std::result::Result<Value, RpcError>;

fn envelope(id: Value, outcome: RpcResult) -> Value {
    match outcome {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(e) => json!({ "jsonrpc": "2.0", "id": id, "error": e.into_object() }),
    }
}

pub async fn handle(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            let error = RpcError::protocol(PARSE_ERROR, format!("Parse error: {e}"), StatusCode::BAD_REQUEST);
            return Json(envelope(Value::Null, Err(error))).into_response();
        }
    };

    let principal = match state.principal(&headers).await {
        Ok(principal) => principal,
        Err(e) => return Json(envelope(Value::Null, Err(e.into()))).into_response(),
    };

    match payload {
        Value::Array(calls) if !calls.is_empty() => {
            let mut responses = Vec::with_capacity(calls.len());
            for call in calls {
                responses.push(dispatch(&state, &principal, call).await);
            }
            Json(Value::Array(responses)).into_response()
        }
        call => Json(dispatch(&state, &principal, call).await).into_response(),
    }
}

async fn dispatch(state: &AppState, principal: &Principal, call: Value) -> Value {
    let request: RpcRequest = match serde_json::from_value(call) {
        Ok(request) => request,
        Err(e) => {
            let error = RpcError::protocol(INVALID_REQUEST, format!("Invalid request: {e}"), StatusCode::BAD_REQUEST);
            return envelope(Value::Null, Err(error));
        }
    };
    if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
        let error = RpcError::protocol(INVALID_REQUEST, "Unsupported jsonrpc version", StatusCode::BAD_REQUEST);
        return envelope(request.id, Err(error));
    }

    let outcome = call_method(state, principal, &request.method, request.params).await;
    envelope(request.id, outcome)
}

async fn call_method(state: &AppState, principal: &Principal, method: &str, params: Value) -> RpcResult {
    let Some((_, names)) = METHODS.iter().find(|(name, _)| *name == method) else {
        return Err(RpcError::protocol(
            METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
            StatusCode::NOT_FOUND,
        ));
    };
    principal.authorize(&state.public_scopes, &format!("rpc.{method}"))?;
    tracing::debug!(method, subject = ?principal.subject(), "rpc call");

    let params = named_params(params, names)?;
    let db = &state.db;
    let user = principal.subject().map(str::to_string);

    match method {
        "resolve" => {
            let p: ResolveParams = decode(params)?;
            let location = match p.location {
                LocationParam::Href(href) => Location::from_href(&href)?,
                LocationParam::Location(location) => *location,
            };
            to_value(state.resolution.resolve(&location, &p.options).await?)
        }

        "createLocation" => {
            let p: LocationParams = decode(params)?;
            ensure_driver(state, &p.location)?;
            to_value(storage::create_location(db, p.location).await?)
        }
        "findLocations" => {
            let p: FilterParams<LocationFilter> = decode(params)?;
            to_value(storage::find_locations(db, p.filter).await?)
        }
        "updateLocation" => {
            let p: UpdateLocationParams = decode(params)?;
            ensure_driver(state, &p.location)?;
            to_value(storage::update_location(db, &p.id, p.location).await?)
        }
        "deleteLocations" => {
            let p: FilterParams<LocationFilter> = decode(params)?;
            Ok(json!({ "deleted": storage::delete_locations(db, p.filter).await? }))
        }

        "createResolver" => {
            let p: ResolverParams = decode(params)?;
            ensure_resolver_type(state, &p.resolver.resolver_type)?;
            to_value(storage::create_resolver(db, p.resolver).await?)
        }
        "findResolvers" => {
            let p: FilterParams<ResolverFilter> = decode(params)?;
            to_value(storage::find_resolvers(db, p.filter).await?)
        }
        "updateResolver" => {
            let p: UpdateResolverParams = decode(params)?;
            to_value(storage::update_resolver(db, &p.id, p.update).await?)
        }
        "deleteResolvers" => {
            let p: IdsParams = decode(params)?;
            Ok(json!({ "deleted": storage::delete_resolvers(db, &p.ids).await? }))
        }
        "getNextResolverPriority" => {
            let p: MountPointParams = decode(params)?;
            let mount = p.mount_point.normalize()?;
            to_value(storage::get_next_resolver_priority(db, &mount).await?)
        }

        "createEntity" => {
            let p: EntityParams = decode(params)?;
            ensure_entity_type(state, &p.entity)?;
            to_value(storage::create_entity(db, &p.source_href, p.entity, user).await?)
        }
        "findEntities" => {
            let p: FilterParams<EntityFilter> = decode(params)?;
            to_value(storage::find_entities(db, p.filter).await?)
        }
        "updateEntity" => {
            let p: UpdateEntityParams = decode(params)?;
            ensure_entity_type(state, &p.entity)?;
            to_value(storage::update_entity(db, &p.id, p.entity, user).await?)
        }
        "deleteEntities" => {
            let p: FilterParams<EntityFilter> = decode(params)?;
            Ok(json!({ "deleted": storage::delete_entities(db, p.filter).await? }))
        }

        "createUser" => {
            let p: UserParams = decode(params)?;
            to_value(storage::create_user(db, p.user).await?)
        }
        "findUsers" => {
            let p: FindUsersParams = decode(params)?;
            to_value(storage::find_users(db, p.username).await?)
        }
        "updateUser" => {
            let p: UpdateUserParams = decode(params)?;
            to_value(storage::update_user(db, &p.subject, p.update).await?)
        }
        "deleteUsers" => {
            let p: SubjectsParams = decode(params)?;
            Ok(json!({ "deleted": storage::delete_users(db, &p.subjects).await? }))
        }

        "createS3EntityFromLocation" => {
            let p: S3EntityParams = decode(params)?;
            to_value(s3::create_entity_from_location(db, &p.href, &p.bucket, &p.key, user).await?)
        }
        "createIPFSEntityFromLocation" => {
            let p: HrefParams = decode(params)?;
            to_value(ipfs::create_entity_from_location(&state.drivers, &p.href, user).await?)
        }
        "pinIPFSEntity" => {
            let p: IdParams = decode(params)?;
            to_value(ipfs::pin_entity(&state.drivers, &p.id).await?)
        }
        "unpinIPFSEntity" => {
            let p: IdParams = decode(params)?;
            to_value(ipfs::unpin_entity(&state.drivers, &p.id).await?)
        }

        "getAccessToken" => {
            let p: TokenParams = decode(params)?;
            to_value(get_access_token(db, &state.settings.auth, &p.form).await?)
        }
        "getAccessTokensForScope" => {
            let p: ScopeParams = decode(params)?;
            let subject = principal.subject().ok_or(MeridianError::Unauthorized)?;
            let owner = storage::get_user(db, subject)
                .await?
                .ok_or_else(|| MeridianError::NotFound(format!("user {subject}")))?;
            let scopes = match p.scope {
                ScopeArg::Delimited(s) => parse_scope_param(&s),
                ScopeArg::List(list) => list,
            };
            let tokens = ScopeTokenSearch::new(db, &state.settings.auth, &owner, &scopes)
                .collect()
                .await?;
            to_value(tokens)
        }

        "createShortUrl" => {
            let p: ShortUrlParams = decode(params)?;
            let location = storage::create_short_url(
                db,
                &state.settings.public_base_url(),
                state.settings.resolver.short_url_size,
                &p.target,
                user,
            )
            .await?;
            to_value(location)
        }
        "copyLocation" => {
            let p: CopyParams = decode(params)?;
            let response = drivers::copy_location(&state.drivers, &p.from, &p.to).await?;
            Ok(json!({ "status": response.status }))
        }
        "createClient" => {
            let p: ClientParams = decode(params)?;
            to_value(storage::create_client(db, p.client).await?)
        }

        _ => Err(RpcError::protocol(
            METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
            StatusCode::NOT_FOUND,
        )),
    }
}

/// Turn positional params into an object keyed by `names`.
fn named_params(params: Value, names: &[&str]) -> std::result::Result<Value, RpcError> {
    match params {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(_) => Ok(params),
        Value::Array(values) => {
            if values.len() > names.len() {
                return Err(RpcError::protocol(
                    INVALID_PARAMS,
                    format!("expected at most {} params, got {}", names.len(), values.len()),
                    StatusCode::BAD_REQUEST,
                ));
            }
            Ok(Value::Object(
                names
                    .iter()
                    .map(|n| n.to_string())
                    .zip(values)
                    .collect(),
            ))
        }
        _ => Err(RpcError::protocol(
            INVALID_PARAMS,
            "params must be an object or an array",
            StatusCode::BAD_REQUEST,
        )),
    }
}

fn decode<T: DeserializeOwned>(params: Value) -> std::result::Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| {
        RpcError::protocol(INVALID_PARAMS, format!("Invalid params: {e}"), StatusCode::BAD_REQUEST)
    })
}

fn to_value<T: Serialize>(value: T) -> RpcResult {
    Ok(serde_json::to_value(value).map_err(MeridianError::from)?)
}

fn ensure_driver(state: &AppState, location: &Location) -> crate::errors::Result<()> {
    match location.driver.as_deref() {
        Some(driver) if !state.drivers.is_installed(driver) => Err(MeridianError::MalformedRequest(
            format!("driver `{driver}` is not installed"),
        )),
        _ => Ok(()),
    }
}

fn ensure_resolver_type(state: &AppState, resolver_type: &str) -> crate::errors::Result<()> {
    if resolver_type == ROOT_RESOLVER_TYPE {
        return Err(MeridianError::Conflict(
            "the root resolver is created at startup".to_string(),
        ));
    }
    let installed = state
        .settings
        .resolver
        .resolver_types
        .iter()
        .any(|t| t == resolver_type)
        && state.resolution.engine().strategies().contains(resolver_type);
    if !installed {
        return Err(MeridianError::MalformedRequest(format!(
            "resolver type `{resolver_type}` is not installed"
        )));
    }
    Ok(())
}

fn ensure_entity_type(state: &AppState, kind: &EntityKind) -> crate::errors::Result<()> {
    let name = kind.type_name();
    if !state.settings.resolver.entity_types.iter().any(|t| t == name) {
        return Err(MeridianError::MalformedRequest(format!(
            "entity type `{name}` is not installed"
        )));
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LocationParam {
    Href(String),
    Location(Box<Location>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScopeArg {
    Delimited(String),
    List(Vec<String>),
}

#[derive(Deserialize)]
struct ResolveParams {
    location: LocationParam,
    #[serde(default)]
    options: ResolveOptions,
}

#[derive(Deserialize)]
struct LocationParams {
    location: Location,
}

#[derive(Deserialize)]
struct UpdateLocationParams {
    id: String,
    location: Location,
}

#[derive(Deserialize)]
struct FilterParams<F: Default> {
    #[serde(default)]
    filter: F,
}

#[derive(Deserialize)]
struct ResolverParams {
    resolver: NewResolver,
}

#[derive(Deserialize)]
struct UpdateResolverParams {
    id: String,
    update: ResolverUpdate,
}

#[derive(Deserialize)]
struct IdsParams {
    ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MountPointParams {
    mount_point: MountPointSpec,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityParams {
    source_href: String,
    entity: EntityKind,
}

#[derive(Deserialize)]
struct UpdateEntityParams {
    id: String,
    entity: EntityKind,
}

#[derive(Deserialize)]
struct UserParams {
    user: NewUser,
}

#[derive(Deserialize)]
struct FindUsersParams {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Deserialize)]
struct UpdateUserParams {
    subject: String,
    update: UserUpdate,
}

#[derive(Deserialize)]
struct SubjectsParams {
    subjects: Vec<String>,
}

#[derive(Deserialize)]
struct S3EntityParams {
    href: String,
    bucket: String,
    key: String,
}

#[derive(Deserialize)]
struct HrefParams {
    href: String,
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Deserialize)]
struct TokenParams {
    form: TokenForm,
}

#[derive(Deserialize)]
struct ScopeParams {
    scope: ScopeArg,
}

#[derive(Deserialize)]
struct ShortUrlParams {
    target: String,
}

#[derive(Deserialize)]
struct CopyParams {
    from: String,
    to: String,
}

#[derive(Deserialize)]
struct ClientParams {
    client: NewClient,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_params_are_named() {
        let named = named_params(json!(["http://x/y", {"noCache": true}]), &["location", "options"])
            .ok()
            .unwrap();
        assert_eq!(named, json!({"location": "http://x/y", "options": {"noCache": true}}));

        let p: ResolveParams = decode(named).ok().unwrap();
        assert!(p.options.no_cache);
        assert!(matches!(p.location, LocationParam::Href(ref h) if h == "http://x/y"));
    }

    #[test]
    fn test_too_many_positional_params() {
        let err = named_params(json!([1, 2, 3]), &["a", "b"]).err().unwrap();
        assert!(matches!(err, RpcError::Protocol { code: INVALID_PARAMS, .. }));
    }

    #[test]
    fn test_missing_params_become_empty_object() {
        let named = named_params(Value::Null, &["filter"]).ok().unwrap();
        let p: FilterParams<LocationFilter> = decode(named).ok().unwrap();
        assert!(p.filter.href.is_none());
    }

    #[test]
    fn test_domain_error_envelope() {
        let value = envelope(json!(7), Err(MeridianError::NotFound("x".into()).into()));
        assert_eq!(value["id"], 7);
        assert_eq!(value["error"]["code"], 3000);
        assert_eq!(value["error"]["data"]["httpCode"], 404);
    }

    #[test]
    fn test_every_method_is_dispatchable_name() {
        let mut names: Vec<&str> = METHODS.iter().map(|(n, _)| *n).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), METHODS.len());
    }
}
