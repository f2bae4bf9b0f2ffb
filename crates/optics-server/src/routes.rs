use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use optics_attach::NewAttachment;
use optics_dataset::{Collection, DatasetMeta, LensSpec};
use optics_lens::NewLens;
use optics_types::{DatasetPath, Hash, HashUrl, Source, StructuredValue};

use crate::error::ApiError;
use crate::state::AppState;

const X_VERSION: HeaderName = HeaderName::from_static("x-version");

/// Build the router over a node.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(info))
        .route("/:source", get(list_users))
        .route("/:source/:user", get(list_names))
        .route(
            "/:source/:user/:name",
            get(read_meta).post(create).delete(delete_dataset),
        )
        .route(
            "/:source/:user/:name/records",
            get(list_records).post(merge_records).put(overwrite_records),
        )
        .route(
            "/:source/:user/:name/records/:id",
            get(read_record).put(put_record).delete(delete_record),
        )
        .route("/:source/:user/:name/as/:format/:id", get(read_record_as))
        .route("/:source/:user/:name/build", post(build_lens))
        .route("/attachments", post(upload_attachment))
        .route("/attachments/:hash", get(download_attachment))
        .with_state(state)
}

fn parse_source(source: &str) -> Result<Source, ApiError> {
    match source {
        "datasets" => Ok(Source::Datasets),
        "lenses" => Ok(Source::Lenses),
        other => Err(ApiError::BadRequest(format!("unknown source: {other}"))),
    }
}

fn collection(state: &AppState, source: Source) -> &Collection {
    match source {
        Source::Lenses => state.node.lenses(),
        _ => state.node.datasets(),
    }
}

/// Record writes land on plain datasets only; lens records are derived.
fn writable(source: Source) -> Result<(), ApiError> {
    if source == Source::Lenses {
        return Err(ApiError::BadRequest(
            "lens records are derived; write to the lens inputs instead".into(),
        ));
    }
    Ok(())
}

fn decode_body(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StructuredValue, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/json");
    let codec = state
        .node
        .codecs()
        .for_query(content_type)
        .ok_or_else(|| ApiError::BadRequest(format!("unsupported content type: {content_type}")))?;
    Ok(codec.decode(body)?)
}

fn body_entries(value: StructuredValue) -> Result<Vec<(String, Option<StructuredValue>)>, ApiError> {
    let StructuredValue::Map(entries) = value else {
        return Err(ApiError::BadRequest(
            "body must be a mapping of record ids to values".into(),
        ));
    };
    Ok(entries
        .into_iter()
        .map(|(id, value)| match value {
            StructuredValue::Null => (id, None),
            other => (id, Some(other)),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// JSON shapes
// ---------------------------------------------------------------------------

fn records_json(meta: &DatasetMeta) -> serde_json::Value {
    let records: serde_json::Map<String, serde_json::Value> = meta
        .records
        .iter()
        .map(|(id, record)| {
            (
                id.clone(),
                json!({
                    "version": record.version,
                    "hash": record.hash.to_hex(),
                    "links": record.links,
                }),
            )
        })
        .collect();
    serde_json::Value::Object(records)
}

fn lens_json(spec: &LensSpec) -> serde_json::Value {
    json!({
        "mapFunction": spec.map_source,
        "inputs": spec.inputs.iter().map(|path| path.to_string()).collect::<Vec<_>>(),
        "dependencies": spec.dependencies.iter().map(|path| path.to_string()).collect::<Vec<_>>(),
        "buildLog": serde_json::to_value(&spec.build_log).unwrap_or_default(),
    })
}

fn meta_json(meta: &DatasetMeta) -> serde_json::Value {
    let mut body = json!({
        "version": meta.version,
        "created": meta.created,
        "updated": meta.updated,
        "config": serde_json::to_value(&meta.config).unwrap_or_default(),
        "records": records_json(meta),
    });
    if let Some(ref lens) = meta.lens {
        body["lens"] = lens_json(lens);
    }
    body
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn info() -> Json<serde_json::Value> {
    Json(json!({
        "name": "pigeon-optics",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_users(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let source = parse_source(&source)?;
    let collection = collection(&state, source);
    let mut listing = BTreeMap::new();
    for user in collection.users()? {
        let names = collection.list(&user)?;
        listing.insert(user, names);
    }
    Ok(Json(serde_json::to_value(listing).unwrap_or_default()))
}

async fn list_names(
    State(state): State<AppState>,
    Path((source, user)): Path<(String, String)>,
) -> Result<Json<Vec<String>>, ApiError> {
    let source = parse_source(&source)?;
    Ok(Json(collection(&state, source).list(&user)?))
}

async fn read_meta(
    State(state): State<AppState>,
    Path((source, user, name)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let source = parse_source(&source)?;
    let meta = collection(&state, source).read_meta(&user, &name)?;
    Ok(Json(meta_json(&meta)))
}

async fn create(
    State(state): State<AppState>,
    Path((source, user, name)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let source = parse_source(&source)?;
    let value = if body.is_empty() {
        StructuredValue::Map(BTreeMap::new())
    } else {
        decode_body(&state, &headers, &body)?
    };
    match source {
        Source::Lenses => {
            let new = parse_new_lens(&value)?;
            let engine = state.node.engine().clone();
            tokio::task::spawn_blocking(move || engine.create(&user, &name, new))
                .await
                .map_err(|err| ApiError::BadRequest(err.to_string()))??;
        }
        _ => {
            let config = match value {
                StructuredValue::Map(map) => map,
                _ => {
                    return Err(ApiError::BadRequest("config must be a mapping".into()));
                }
            };
            state.node.datasets().create(&user, &name, config, None)?;
        }
    }
    Ok(StatusCode::CREATED)
}

fn parse_new_lens(value: &StructuredValue) -> Result<NewLens, ApiError> {
    let code = value
        .get("code")
        .and_then(StructuredValue::as_str)
        .ok_or_else(|| ApiError::BadRequest("lens body needs a \"code\" string".into()))?;
    let parse_paths = |key: &str| -> Result<Vec<DatasetPath>, ApiError> {
        let Some(raw) = value.get(key) else {
            return Ok(Vec::new());
        };
        let Some(items) = raw.as_sequence() else {
            return Err(ApiError::BadRequest(format!("{key} must be a list of paths")));
        };
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .and_then(|path| path.parse().ok())
                    .ok_or_else(|| ApiError::BadRequest(format!("bad path in {key}")))
            })
            .collect()
    };
    let inputs = parse_paths("inputs")?;
    let dependencies = parse_paths("dependencies")?;
    let config = match value.get("config") {
        Some(StructuredValue::Map(map)) => map.clone(),
        _ => BTreeMap::new(),
    };
    Ok(NewLens {
        map_source: code.to_string(),
        inputs,
        dependencies,
        config,
    })
}

async fn delete_dataset(
    State(state): State<AppState>,
    Path((source, user, name)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let source = parse_source(&source)?;
    collection(&state, source).delete(&user, &name)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_records(
    State(state): State<AppState>,
    Path((source, user, name)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let source = parse_source(&source)?;
    let meta = collection(&state, source).read_meta(&user, &name)?;
    Ok((
        [(X_VERSION, meta.version.to_string())],
        Json(records_json(&meta)),
    )
        .into_response())
}

async fn read_record(
    State(state): State<AppState>,
    Path((source, user, name, id)): Path<(String, String, String, String)>,
) -> Result<Response, ApiError> {
    let source = parse_source(&source)?;
    let collection = collection(&state, source);
    let meta = collection.read_meta(&user, &name)?;
    let value = collection.read(&user, &name, &id)?.ok_or_else(|| {
        ApiError::Dataset(optics_dataset::DatasetError::NotFound(
            DatasetPath::record(source, user.clone(), name.clone(), id.clone()).to_string(),
        ))
    })?;
    Ok((
        [
            (X_VERSION, meta.version.to_string()),
            (header::CONTENT_TYPE, "application/json".to_string()),
        ],
        serde_json::to_vec(&value).map_err(|err| ApiError::BadRequest(err.to_string()))?,
    )
        .into_response())
}

async fn read_record_as(
    State(state): State<AppState>,
    Path((source, user, name, format, id)): Path<(String, String, String, String, String)>,
) -> Result<Response, ApiError> {
    let source = parse_source(&source)?;
    let codec = state
        .node
        .codecs()
        .for_query(&format)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown format: {format}")))?;
    let collection = collection(&state, source);
    let meta = collection.read_meta(&user, &name)?;
    let value = collection.read(&user, &name, &id)?.ok_or_else(|| {
        ApiError::Dataset(optics_dataset::DatasetError::NotFound(
            DatasetPath::record(source, user.clone(), name.clone(), id.clone()).to_string(),
        ))
    })?;
    let bytes = codec.encode(&value)?;
    Ok((
        [
            (X_VERSION, meta.version.to_string()),
            (header::CONTENT_TYPE, codec.media_types()[0].to_string()),
        ],
        bytes,
    )
        .into_response())
}

async fn merge_records(
    State(state): State<AppState>,
    Path((source, user, name)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    write_records(state, source, user, name, headers, body, false).await
}

async fn overwrite_records(
    State(state): State<AppState>,
    Path((source, user, name)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    write_records(state, source, user, name, headers, body, true).await
}

async fn write_records(
    state: AppState,
    source: String,
    user: String,
    name: String,
    headers: HeaderMap,
    body: Bytes,
    overwrite: bool,
) -> Result<StatusCode, ApiError> {
    let source = parse_source(&source)?;
    writable(source)?;
    let entries = body_entries(decode_body(&state, &headers, &body)?)?;
    let payloads: Vec<StructuredValue> = entries
        .iter()
        .filter_map(|(_, value)| value.clone())
        .collect();
    state
        .node
        .datasets()
        .write_entries(&user, &name, entries, overwrite)?;
    state.settle_uploads(payloads.iter());
    Ok(StatusCode::NO_CONTENT)
}

async fn put_record(
    State(state): State<AppState>,
    Path((source, user, name, id)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let source = parse_source(&source)?;
    writable(source)?;
    let value = decode_body(&state, &headers, &body)?;
    state.node.datasets().write(&user, &name, &id, value.clone())?;
    state.settle_uploads(std::iter::once(&value));
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_record(
    State(state): State<AppState>,
    Path((source, user, name, id)): Path<(String, String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let source = parse_source(&source)?;
    writable(source)?;
    state.node.datasets().delete_record(&user, &name, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn build_lens(
    State(state): State<AppState>,
    Path((source, user, name)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    if parse_source(&source)? != Source::Lenses {
        return Err(ApiError::BadRequest("only lenses can be built".into()));
    }
    let engine = state.node.engine().clone();
    tokio::task::spawn_blocking(move || engine.build(&user, &name))
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))??;
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_attachment(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (hash, hold) = state
        .node
        .attachments()
        .write(&body, NewAttachment::default())?;
    state.park_upload(hold);
    Ok((
        StatusCode::CREATED,
        Json(json!({ "hash": HashUrl::new(hash).to_string() })),
    )
        .into_response())
}

async fn download_attachment(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Response, ApiError> {
    let hash = Hash::from_hex(hash.trim_start_matches("hash://sha256/"))
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    if !state.node.attachments().has(&hash) {
        return Err(ApiError::Attach(optics_attach::AttachError::NotFound(hash)));
    }
    let media_type = state
        .node
        .attachments()
        .read_meta(&hash)?
        .and_then(|meta| meta.extra.get("type").and_then(|v| v.as_str().map(String::from)))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let bytes = state.node.attachments().read(&hash)?;
    Ok(([(header::CONTENT_TYPE, media_type)], bytes).into_response())
}
