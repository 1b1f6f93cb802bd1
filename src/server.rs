//! REST resource layer over the engine.
//!
//! Routes, OData content negotiation, conditional requests and the error
//! taxonomy live here. Every handler takes the engine lock after routing and
//! parameter parsing and releases it before the response body is written.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header::{
    self, HeaderMap, HeaderValue, CONTENT_LOCATION, CONTENT_TYPE, ETAG, LAST_MODIFIED, LOCATION,
};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::document::doc_id;
use crate::engine::Engine;
use crate::query::{project, sort_documents, Direction, QueryOptions};
use crate::{Document, YarDbError};

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<Engine>>,
}

/// Build the application router around an opened engine.
pub fn router(engine: Engine) -> Router {
    let state = AppState {
        engine: Arc::new(Mutex::new(engine)),
    };
    Router::new()
        .route("/", get(root).fallback(method_not_allowed))
        .route(
            "/_reindex",
            get(reindex).post(reindex).fallback(method_not_allowed),
        )
        .route(
            "/_db/:collection",
            get(db_config_get)
                .put(db_config_put)
                .patch(db_config_patch)
                .fallback(method_not_allowed),
        )
        .route(
            "/:collection",
            get(collection_get)
                .post(collection_post)
                .delete(collection_delete)
                .fallback(method_not_allowed),
        )
        .route(
            "/:collection/:id",
            get(document_get)
                .put(document_put)
                .patch(document_patch)
                .delete(document_delete)
                .fallback(method_not_allowed),
        )
        .route(
            "/:collection/:id/history",
            get(document_history).fallback(method_not_allowed),
        )
        .with_state(state)
}

/// Serve the REST API on localhost.
pub async fn serve(engine: Engine, port: u16) -> Result<(), YarDbError> {
    let app = router(engine);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "listening for connections");
    axum::serve(listener, app).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Error taxonomy

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound {
        message: String,
        collection: Option<String>,
        id: Option<i64>,
    },
    MethodNotAllowed(String),
    NotAcceptable,
    PreconditionFailed(String),
    // Reserved for index-config schema violations detected at runtime.
    #[allow(dead_code)]
    Conflict(String),
    Internal(String),
}

impl ApiError {
    fn not_found(collection: &str, id: i64) -> ApiError {
        ApiError::NotFound {
            message: format!("document {id} not found in collection '{collection}'"),
            collection: Some(collection.to_string()),
            id: Some(id),
        }
    }

    fn no_matches(collection: &str) -> ApiError {
        ApiError::NotFound {
            message: format!("no matching documents in collection '{collection}'"),
            collection: Some(collection.to_string()),
            id: None,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            ApiError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "Bad Request",
            ApiError::NotFound { .. } => "Not Found",
            ApiError::MethodNotAllowed(_) => "Method Not Allowed",
            ApiError::NotAcceptable => "Not Acceptable",
            ApiError::PreconditionFailed(_) => "Precondition Failed",
            ApiError::Conflict(_) => "Conflict",
            ApiError::Internal(_) => "Internal Server Error",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(m)
            | ApiError::MethodNotAllowed(m)
            | ApiError::PreconditionFailed(m)
            | ApiError::Conflict(m)
            | ApiError::Internal(m) => m.clone(),
            ApiError::NotFound { message, .. } => message.clone(),
            ApiError::NotAcceptable => "Only application/json is supported".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();
        if status.is_server_error() {
            error!(%status, detail = %message, "request failed");
        } else {
            warn!(%status, detail = %message, "request rejected");
        }

        let mut body = Document::new();
        body.insert("error".to_string(), Value::from(self.reason()));
        body.insert("message".to_string(), Value::from(message));
        if let ApiError::NotFound { collection, id, .. } = &self {
            if let Some(collection) = collection {
                body.insert("collection".to_string(), Value::from(collection.clone()));
            }
            if let Some(id) = id {
                body.insert("id".to_string(), Value::from(*id));
            }
        }
        json_response(status, &Value::Object(body), false)
    }
}

impl From<YarDbError> for ApiError {
    fn from(e: YarDbError) -> ApiError {
        match e {
            YarDbError::DocumentValidation(inner) => ApiError::BadRequest(inner.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<crate::query::QueryError> for ApiError {
    fn from(e: crate::query::QueryError) -> ApiError {
        ApiError::BadRequest(e.to_string())
    }
}

async fn method_not_allowed(method: Method, uri: Uri) -> ApiError {
    ApiError::MethodNotAllowed(format!("{method} is not supported on {}", uri.path()))
}

// ---------------------------------------------------------------------------
// Content negotiation

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetadataMode {
    None,
    Minimal,
    Full,
}

fn negotiate(headers: &HeaderMap) -> Result<MetadataMode, ApiError> {
    let Some(accept) = headers.get(header::ACCEPT) else {
        return Ok(MetadataMode::None);
    };
    let accept = accept.to_str().map_err(|_| ApiError::NotAcceptable)?;
    if accept.trim().is_empty() {
        return Ok(MetadataMode::None);
    }

    for range in accept.split(',') {
        let mut parts = range.trim().split(';');
        let media = parts.next().unwrap_or("").trim();
        let acceptable = media.eq_ignore_ascii_case("application/json")
            || media == "application/*"
            || media == "*/*";
        if !acceptable {
            continue;
        }
        let mut mode = MetadataMode::None;
        for param in parts {
            if let Some((name, value)) = param.trim().split_once('=') {
                if name.trim().eq_ignore_ascii_case("odata") {
                    mode = match value.trim() {
                        "minimalmetadata" => MetadataMode::Minimal,
                        "fullmetadata" => MetadataMode::Full,
                        _ => MetadataMode::None,
                    };
                }
            }
        }
        return Ok(mode);
    }

    warn!(accept, "no acceptable media range");
    Err(ApiError::NotAcceptable)
}

// ---------------------------------------------------------------------------
// Conditional requests

struct ResourceMeta {
    etag: String,
    last_modified_secs: i64,
}

fn resource_meta(
    engine: &Engine,
    collection: &str,
    id: i64,
) -> Result<Option<ResourceMeta>, YarDbError> {
    let selector = selector_for_id(id);
    let Some(position) = engine.metadata_position(&selector)? else {
        return Ok(None);
    };
    let timestamp = engine.metadata_timestamp(&selector)?.unwrap_or_default();
    Ok(Some(ResourceMeta {
        etag: etag_for(collection, id, position),
        last_modified_secs: timestamp / 1000,
    }))
}

/// Stable fingerprint of one live record: it changes on every mutation and
/// is identical across reads that observe the same record.
fn etag_for(collection: &str, id: i64, position: i64) -> String {
    let digest = Sha256::digest(format!("{collection}/{id}@{position}").as_bytes());
    format!("\"{}\"", hex::encode(&digest[..16]))
}

fn http_date(secs: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0)
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn parse_http_date(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.timestamp())
}

fn check_mutating_preconditions(
    headers: &HeaderMap,
    current: Option<&ResourceMeta>,
) -> Result<(), ApiError> {
    if let Some(value) = headers.get(header::IF_MATCH) {
        let value = value
            .to_str()
            .map_err(|_| ApiError::BadRequest("malformed If-Match header".into()))?
            .trim();
        let passes = match current {
            Some(meta) => value == "*" || value == meta.etag,
            None => false,
        };
        if !passes {
            return Err(ApiError::PreconditionFailed(format!(
                "If-Match {value} does not match the current entity tag"
            )));
        }
        return Ok(());
    }

    if let Some(value) = headers.get(header::IF_UNMODIFIED_SINCE) {
        let value = value
            .to_str()
            .map_err(|_| ApiError::BadRequest("malformed If-Unmodified-Since header".into()))?;
        let Some(limit) = parse_http_date(value) else {
            return Err(ApiError::BadRequest(format!(
                "malformed If-Unmodified-Since date '{value}'"
            )));
        };
        let passes = matches!(current, Some(meta) if meta.last_modified_secs <= limit);
        if !passes {
            return Err(ApiError::PreconditionFailed(format!(
                "resource was modified after {value}"
            )));
        }
    }

    Ok(())
}

/// 304 evaluation for GET and HEAD. Returns the response to short-circuit
/// with, if any.
fn not_modified(headers: &HeaderMap, meta: &ResourceMeta) -> Option<Response> {
    if let Some(value) = headers.get(header::IF_NONE_MATCH) {
        let value = value.to_str().ok()?.trim();
        if value == "*" || value == meta.etag {
            return Some(not_modified_response(meta));
        }
        return None;
    }
    if let Some(value) = headers.get(header::IF_MODIFIED_SINCE) {
        let limit = parse_http_date(value.to_str().ok()?)?;
        if meta.last_modified_secs <= limit {
            return Some(not_modified_response(meta));
        }
    }
    None
}

fn not_modified_response(meta: &ResourceMeta) -> Response {
    let mut response = StatusCode::NOT_MODIFIED.into_response();
    set_resource_headers(&mut response, meta);
    response
}

fn set_resource_headers(response: &mut Response, meta: &ResourceMeta) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&meta.etag) {
        headers.insert(ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&http_date(meta.last_modified_secs)) {
        headers.insert(LAST_MODIFIED, value);
    }
}

// ---------------------------------------------------------------------------
// Shared plumbing

fn json_response(status: StatusCode, body: &Value, head: bool) -> Response {
    let payload = if head { String::new() } else { body.to_string() };
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(payload))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("document id must be an integer, got '{raw}'")))
}

fn selector_for_id(id: i64) -> Document {
    let mut selector = Document::new();
    selector.insert("_id".to_string(), Value::from(id));
    selector
}

fn parse_object_body(body: &Bytes) -> Result<Document, ApiError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ApiError::BadRequest(format!(
            "request body must be a JSON object, got {other}"
        ))),
    }
}

fn insert_header(response: &mut Response, name: header::HeaderName, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(name, value);
    }
}

fn decorate(collection: &str, mut doc: Document) -> Document {
    if let Some(id) = doc_id(&doc) {
        let link = format!("/{collection}/{id}");
        doc.insert("@odata.id".to_string(), Value::from(link.clone()));
        doc.insert("@odata.editLink".to_string(), Value::from(link));
    }
    doc
}

fn envelope_collection(mode: MetadataMode, collection: &str, documents: Vec<Document>) -> Value {
    let items: Vec<Value> = match mode {
        MetadataMode::Full => documents
            .into_iter()
            .map(|doc| Value::Object(decorate(collection, doc)))
            .collect(),
        _ => documents.into_iter().map(Value::Object).collect(),
    };
    match mode {
        MetadataMode::None => Value::Array(items),
        MetadataMode::Minimal | MetadataMode::Full => json!({
            "@odata.context": format!("/$metadata#{collection}"),
            "value": items,
        }),
    }
}

fn envelope_entity(mode: MetadataMode, collection: &str, doc: Document) -> Value {
    match mode {
        MetadataMode::None => Value::Object(doc),
        MetadataMode::Minimal | MetadataMode::Full => {
            let mut wrapped = Document::new();
            wrapped.insert(
                "@odata.context".to_string(),
                Value::from(format!("/$metadata#{collection}/$entity")),
            );
            let doc = if mode == MetadataMode::Full {
                decorate(collection, doc)
            } else {
                doc
            };
            for (key, value) in doc {
                wrapped.insert(key, value);
            }
            Value::Object(wrapped)
        }
    }
}

enum Pipeline {
    Count(usize),
    Documents(Vec<Document>),
}

/// The query execution pipeline: index view, match, $filter, sort, window,
/// count or projection.
fn run_pipeline(
    engine: &mut Engine,
    collection: &str,
    mut selector: Document,
    options: &QueryOptions,
) -> Result<Pipeline, ApiError> {
    engine.collection(collection);

    let mut index_sorted = false;
    if let Some((field, direction)) = &options.orderby {
        if field == "_id" {
            index_sorted = true;
            if *direction == Direction::Descending {
                selector.insert("$desc".to_string(), Value::Bool(true));
            }
        } else if engine.index_keys(collection).contains(field) && !selector.contains_key(field) {
            index_sorted = true;
            let mut hint = Document::new();
            if *direction == Direction::Descending {
                hint.insert("$desc".to_string(), Value::Bool(true));
            }
            selector.insert(field.clone(), Value::Object(hint));
        }
    }

    debug!(collection, selector = %serde_json::Value::Object(selector.clone()), "executing query");
    let mut documents = engine.read(&selector)?;

    if let Some(filter) = &options.filter {
        documents.retain(|doc| filter.eval(doc));
    }
    if let Some((field, direction)) = &options.orderby {
        if !index_sorted {
            sort_documents(&mut documents, field, *direction);
        }
    }
    if let Some(skip) = options.skip {
        documents.drain(..skip.min(documents.len()));
    }
    if let Some(top) = options.top {
        documents.truncate(top);
    }
    if options.count {
        return Ok(Pipeline::Count(documents.len()));
    }
    if let Some(fields) = &options.select {
        documents = documents.iter().map(|doc| project(doc, fields)).collect();
    }
    Ok(Pipeline::Documents(documents))
}

// ---------------------------------------------------------------------------
// Handlers

async fn root(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
) -> Result<Response, ApiError> {
    let mode = negotiate(&headers)?;
    let collections = state.engine.lock().collections();
    let body = match mode {
        MetadataMode::None => json!({ "collections": collections }),
        _ => json!({ "@odata.context": "/$metadata", "value": collections }),
    };
    Ok(json_response(StatusCode::OK, &body, method == Method::HEAD))
}

async fn reindex(
    State(state): State<AppState>,
    headers: HeaderMap,
    method: Method,
) -> Result<Response, ApiError> {
    negotiate(&headers)?;
    state.engine.lock().reindex()?;
    info!("reindexed");
    Ok(json_response(
        StatusCode::OK,
        &json!({ "reindexed": true }),
        method == Method::HEAD,
    ))
}

async fn db_config_get(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    method: Method,
) -> Result<Response, ApiError> {
    negotiate(&headers)?;
    let keys = state.engine.lock().stored_index_keys(&collection)?;
    if keys.is_empty() {
        return Err(ApiError::NotFound {
            message: format!("collection '{collection}' has no index configuration"),
            collection: Some(collection),
            id: None,
        });
    }
    Ok(json_response(
        StatusCode::OK,
        &json!({ "collection": collection, "keys": keys }),
        method == Method::HEAD,
    ))
}

async fn db_config_put(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    negotiate(&headers)?;
    let keys = validate_keys_body(&body)?;
    let mut engine = state.engine.lock();
    engine.collection(&collection);
    let keys = engine.set_index_keys(keys)?;
    drop(engine);
    info!(collection = %collection, ?keys, "replaced index configuration");
    Ok(json_response(
        StatusCode::OK,
        &json!({ "collection": collection, "keys": keys }),
        false,
    ))
}

async fn db_config_patch(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    negotiate(&headers)?;
    let keys = validate_keys_body(&body)?;
    let mut engine = state.engine.lock();
    engine.collection(&collection);
    let keys = engine.index(keys)?;
    drop(engine);
    info!(collection = %collection, ?keys, "extended index configuration");
    Ok(json_response(
        StatusCode::OK,
        &json!({ "collection": collection, "keys": keys }),
        false,
    ))
}

const RESERVED_KEYS: [&str; 4] = ["_id", "@odata.context", "@odata.id", "@odata.editLink"];

fn validate_keys_body(body: &Bytes) -> Result<Vec<String>, ApiError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))?;
    let Some(object) = value.as_object() else {
        return Err(ApiError::BadRequest("body must be a JSON object".into()));
    };
    let Some(keys) = object.get("keys") else {
        return Err(ApiError::BadRequest("body is missing 'keys'".into()));
    };
    let Some(items) = keys.as_array() else {
        return Err(ApiError::BadRequest("'keys' must be an array".into()));
    };
    if items.is_empty() {
        return Err(ApiError::BadRequest("'keys' must not be empty".into()));
    }
    let mut names = Vec::with_capacity(items.len());
    for item in items {
        let Some(name) = item.as_str() else {
            return Err(ApiError::BadRequest(format!(
                "index key {item} is not a string"
            )));
        };
        if RESERVED_KEYS.contains(&name) || name.starts_with('$') {
            return Err(ApiError::BadRequest(format!(
                "index key '{name}' is reserved"
            )));
        }
        names.push(name.to_string());
    }
    Ok(names)
}

async fn collection_get(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    method: Method,
) -> Result<Response, ApiError> {
    let mode = negotiate(&headers)?;
    let options = QueryOptions::parse(&params)?;
    let head = method == Method::HEAD;

    let mut engine = state.engine.lock();
    let outcome = run_pipeline(&mut engine, &collection, Document::new(), &options)?;
    drop(engine);

    match outcome {
        Pipeline::Count(count) => Ok(json_response(StatusCode::OK, &Value::from(count), head)),
        Pipeline::Documents(documents) => {
            if documents.is_empty() {
                return Err(ApiError::no_matches(&collection));
            }
            info!(collection = %collection, count = documents.len(), "read documents");
            let body = envelope_collection(mode, &collection, documents);
            Ok(json_response(StatusCode::OK, &body, head))
        }
    }
}

async fn collection_post(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mode = negotiate(&headers)?;
    let mut document = parse_object_body(&body)?;

    let mut engine = state.engine.lock();
    engine.collection(&collection);
    let id = engine.create(&mut document)?;
    let meta = resource_meta(&engine, &collection, id)?
        .ok_or_else(|| ApiError::Internal("created document has no metadata".into()))?;
    drop(engine);

    info!(collection = %collection, id, "created document");
    let body = envelope_entity(mode, &collection, document);
    let mut response = json_response(StatusCode::CREATED, &body, false);
    set_resource_headers(&mut response, &meta);
    insert_header(&mut response, LOCATION, format!("/{collection}/{id}"));
    Ok(response)
}

async fn collection_delete(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    negotiate(&headers)?;
    let options = QueryOptions::parse(&params)?;

    let mut engine = state.engine.lock();
    let outcome = run_pipeline(&mut engine, &collection, Document::new(), &options)?;
    let documents = match outcome {
        Pipeline::Documents(documents) => documents,
        Pipeline::Count(_) => {
            return Err(ApiError::BadRequest("$count is not valid for DELETE".into()))
        }
    };
    if documents.is_empty() {
        return Err(ApiError::no_matches(&collection));
    }
    for document in &documents {
        if let Some(id) = doc_id(document) {
            engine.destroy(&selector_for_id(id))?;
        }
    }
    drop(engine);

    info!(collection = %collection, count = documents.len(), "deleted documents");
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn document_get(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    method: Method,
) -> Result<Response, ApiError> {
    let mode = negotiate(&headers)?;
    let id = parse_id(&id)?;
    let options = QueryOptions::parse(&params)?;
    let head = method == Method::HEAD;

    let mut engine = state.engine.lock();
    engine.collection(&collection);
    let Some(meta) = resource_meta(&engine, &collection, id)? else {
        return Err(ApiError::not_found(&collection, id));
    };
    if let Some(response) = not_modified(&headers, &meta) {
        return Ok(response);
    }
    let documents = engine.read(&selector_for_id(id))?;
    drop(engine);

    let Some(document) = documents.into_iter().next() else {
        return Err(ApiError::not_found(&collection, id));
    };
    let document = match &options.select {
        Some(fields) => project(&document, fields),
        None => document,
    };
    let body = envelope_entity(mode, &collection, document);
    let mut response = json_response(StatusCode::OK, &body, head);
    set_resource_headers(&mut response, &meta);
    Ok(response)
}

async fn document_put(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mode = negotiate(&headers)?;
    let id = parse_id(&id)?;
    let mut document = parse_object_body(&body)?;
    document.insert("_id".to_string(), Value::from(id));

    let mut engine = state.engine.lock();
    engine.collection(&collection);
    let current = resource_meta(&engine, &collection, id)?;
    check_mutating_preconditions(&headers, current.as_ref())?;

    let (status, result) = if current.is_some() {
        let mut replaced = engine.replace(&selector_for_id(id), &document)?;
        match replaced.pop() {
            Some(result) => (StatusCode::OK, result),
            None => return Err(ApiError::Internal("replace produced no document".into())),
        }
    } else {
        engine.create(&mut document)?;
        (StatusCode::CREATED, document)
    };
    let meta = resource_meta(&engine, &collection, id)?
        .ok_or_else(|| ApiError::Internal("stored document has no metadata".into()))?;
    drop(engine);

    info!(collection = %collection, id, %status, "put document");
    let body = envelope_entity(mode, &collection, result);
    let mut response = json_response(status, &body, false);
    set_resource_headers(&mut response, &meta);
    insert_header(&mut response, CONTENT_LOCATION, format!("/{collection}/{id}"));
    if status == StatusCode::CREATED {
        insert_header(&mut response, LOCATION, format!("/{collection}/{id}"));
    }
    Ok(response)
}

async fn document_patch(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mode = negotiate(&headers)?;
    let id = parse_id(&id)?;
    let mut document = parse_object_body(&body)?;
    document.insert("_id".to_string(), Value::from(id));

    let mut engine = state.engine.lock();
    engine.collection(&collection);
    let current = resource_meta(&engine, &collection, id)?;
    check_mutating_preconditions(&headers, current.as_ref())?;

    let (status, result) = if current.is_some() {
        let mut updated = engine.update(&selector_for_id(id), &document)?;
        match updated.pop() {
            Some(result) => (StatusCode::OK, result),
            None => return Err(ApiError::Internal("update produced no document".into())),
        }
    } else {
        engine.create(&mut document)?;
        (StatusCode::CREATED, document)
    };
    let meta = resource_meta(&engine, &collection, id)?
        .ok_or_else(|| ApiError::Internal("stored document has no metadata".into()))?;
    drop(engine);

    info!(collection = %collection, id, %status, "patched document");
    let body = envelope_entity(mode, &collection, result);
    let mut response = json_response(status, &body, false);
    set_resource_headers(&mut response, &meta);
    insert_header(&mut response, CONTENT_LOCATION, format!("/{collection}/{id}"));
    Ok(response)
}

async fn document_delete(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;

    let mut engine = state.engine.lock();
    engine.collection(&collection);
    let current = resource_meta(&engine, &collection, id)?;
    check_mutating_preconditions(&headers, current.as_ref())?;
    if current.is_none() {
        return Err(ApiError::not_found(&collection, id));
    }
    let destroyed = engine.destroy(&selector_for_id(id))?;
    drop(engine);

    if destroyed.is_empty() {
        return Err(ApiError::not_found(&collection, id));
    }
    info!(collection = %collection, id, "deleted document");
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn document_history(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
    method: Method,
) -> Result<Response, ApiError> {
    let mode = negotiate(&headers)?;
    let id = parse_id(&id)?;

    let mut engine = state.engine.lock();
    engine.collection(&collection);
    let versions = engine.history(&selector_for_id(id))?;
    drop(engine);

    if versions.is_empty() {
        return Err(ApiError::not_found(&collection, id));
    }
    info!(collection = %collection, id, count = versions.len(), "read history");
    let body = envelope_collection(mode, &collection, versions);
    Ok(json_response(StatusCode::OK, &body, method == Method::HEAD))
}
