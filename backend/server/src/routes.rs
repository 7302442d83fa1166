use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State as Extract, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::{
    counter::increment_and_get,
    database::Attributes,
    error::AppError,
    records::Records,
    state::State,
};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Visits {
    pub message: &'static str,
    pub visit_count: u64,
}

pub async fn visits_handler(Extract(state): Extract<Arc<State>>) -> Result<Json<Visits>, AppError> {
    let store = state.store()?;
    let visit_count = increment_and_get(store.as_ref(), &state.config.counter_key).await?;

    Ok(Json(Visits {
        message: "Welcome!",
        visit_count,
    }))
}

pub async fn health_handler(Extract(state): Extract<Arc<State>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "phase": state.bootstrap.phase().as_str() })),
    )
}

fn attributes(payload: Result<Json<Attributes>, JsonRejection>) -> Result<Attributes, AppError> {
    payload.map(|Json(attributes)| attributes).map_err(|e| {
        warn!("Rejected record payload: {e}");
        AppError::MalformedPayload
    })
}

fn records(state: &State) -> Result<Records<'_>, AppError> {
    Ok(Records::new(
        state.store()?.as_ref(),
        &state.config.records_collection,
    ))
}

pub async fn create_record_handler(
    Extract(state): Extract<Arc<State>>,
    payload: Result<Json<Attributes>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let records = records(&state)?;
    let id = records.create(attributes(payload)?).await?;

    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

pub async fn read_record_handler(
    Extract(state): Extract<Arc<State>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let record = records(&state)?.read_by_id(&id).await?;

    Ok(Json(json!({ "id": record.id, "attributes": record.attributes })))
}

pub async fn update_record_handler(
    Extract(state): Extract<Arc<State>>,
    Path(id): Path<String>,
    payload: Result<Json<Attributes>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let records = records(&state)?;

    match records.update(&id, attributes(payload)?).await? {
        true => Ok(Json(json!({ "matched": true }))),
        false => Err(AppError::NotFound),
    }
}

pub async fn delete_record_handler(
    Extract(state): Extract<Arc<State>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    match records(&state)?.delete(&id).await? {
        true => Ok(Json(json!({ "deleted": true }))),
        false => Err(AppError::NotFound),
    }
}
