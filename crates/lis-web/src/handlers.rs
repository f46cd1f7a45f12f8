//! HTTP处理器

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Duration, Utc};
use lis_core::{AlertFilter, LisError, QcLevel, QcLot};
use lis_store::{AnalyzerSpec, NewOrder, NewTestMapping};
use lis_workflow::LabService;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub type AppState = Arc<LabService>;
type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// 领域错误到HTTP状态码
fn error_response(e: LisError) -> ApiError {
    let status = match &e {
        LisError::NotFound(_) => StatusCode::NOT_FOUND,
        LisError::Validation(_)
        | LisError::Decode(_)
        | LisError::Protocol(_)
        | LisError::Unsupported(_) => StatusCode::BAD_REQUEST,
        LisError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        LisError::ApprovalIncomplete { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        LisError::Connection(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let body = match &e {
        // 缺结果的项目代码随错误体返回, 前端据此提示
        LisError::ApprovalIncomplete { missing } => json!({
            "error": e.to_string(),
            "missing_items": missing,
        }),
        _ => json!({ "error": e.to_string() }),
    };
    (status, Json(body))
}

/// 健康检查处理器
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

// ---------- 仪器 ----------

#[derive(Debug, Deserialize)]
pub struct ListAnalyzersQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

pub async fn list_analyzers(
    State(service): State<AppState>,
    Query(query): Query<ListAnalyzersQuery>,
) -> ApiResult<Value> {
    let analyzers = service
        .list_analyzers(query.include_inactive)
        .await
        .map_err(error_response)?;
    let total = analyzers.len();
    Ok(Json(json!({ "analyzers": analyzers, "total": total })))
}

pub async fn register_analyzer(
    State(service): State<AppState>,
    Json(spec): Json<AnalyzerSpec>,
) -> ApiResult<Value> {
    let analyzer = service.register_analyzer(spec).await.map_err(error_response)?;
    Ok(Json(json!({ "analyzer": analyzer })))
}

pub async fn get_analyzer(
    State(service): State<AppState>,
    Path(analyzer_id): Path<Uuid>,
) -> ApiResult<Value> {
    let analyzer = service.get_analyzer(analyzer_id).await.map_err(error_response)?;
    Ok(Json(json!({ "analyzer": analyzer })))
}

pub async fn update_analyzer(
    State(service): State<AppState>,
    Path(analyzer_id): Path<Uuid>,
    Json(spec): Json<AnalyzerSpec>,
) -> ApiResult<Value> {
    let analyzer = service
        .update_analyzer(analyzer_id, spec)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "analyzer": analyzer })))
}

pub async fn deactivate_analyzer(
    State(service): State<AppState>,
    Path(analyzer_id): Path<Uuid>,
) -> ApiResult<Value> {
    let analyzer = service
        .deactivate_analyzer(analyzer_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "analyzer": analyzer })))
}

#[derive(Debug, Deserialize)]
pub struct ToggleConnectionRequest {
    pub connect: bool,
}

pub async fn toggle_connection(
    State(service): State<AppState>,
    Path(analyzer_id): Path<Uuid>,
    Json(request): Json<ToggleConnectionRequest>,
) -> ApiResult<Value> {
    let status = service
        .toggle_connection(analyzer_id, request.connect)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "analyzer_id": analyzer_id, "status": status })))
}

pub async fn connection_status(
    State(service): State<AppState>,
    Path(analyzer_id): Path<Uuid>,
) -> ApiResult<Value> {
    let status = service.connection_status(analyzer_id).await;
    Ok(Json(json!({ "analyzer_id": analyzer_id, "status": status })))
}

pub async fn list_mappings(
    State(service): State<AppState>,
    Path(analyzer_id): Path<Uuid>,
) -> ApiResult<Value> {
    let mappings = service
        .list_test_mappings(analyzer_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "mappings": mappings })))
}

pub async fn set_mappings(
    State(service): State<AppState>,
    Path(analyzer_id): Path<Uuid>,
    Json(mappings): Json<Vec<NewTestMapping>>,
) -> ApiResult<Value> {
    let mappings = service
        .set_test_mappings(analyzer_id, mappings)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "mappings": mappings })))
}

#[derive(Debug, Deserialize)]
pub struct TimeRangeQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRangeQuery {
    /// 缺省取最近7天
    fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let to = self.to.unwrap_or_else(Utc::now);
        let from = self.from.unwrap_or_else(|| to - Duration::days(7));
        (from, to)
    }
}

pub async fn list_connection_logs(
    State(service): State<AppState>,
    Path(analyzer_id): Path<Uuid>,
    Query(range): Query<TimeRangeQuery>,
) -> ApiResult<Value> {
    let (from, to) = range.bounds();
    let logs = service
        .list_connection_logs(analyzer_id, from, to)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "logs": logs })))
}

// ---------- 报文与结果 ----------

#[derive(Debug, Deserialize)]
pub struct ProcessFrameRequest {
    pub frame: String,
}

/// 手工补录/回放一帧仪器报文
pub async fn process_frame(
    State(service): State<AppState>,
    Path(analyzer_id): Path<Uuid>,
    Json(request): Json<ProcessFrameRequest>,
) -> ApiResult<Value> {
    let outcome = service
        .process_frame(analyzer_id, &request.frame)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "outcome": outcome })))
}

#[derive(Debug, Deserialize)]
pub struct UnmatchedQuery {
    pub analyzer_id: Option<Uuid>,
}

pub async fn list_unmatched_results(
    State(service): State<AppState>,
    Query(query): Query<UnmatchedQuery>,
) -> ApiResult<Value> {
    let results = service
        .list_unmatched_results(query.analyzer_id)
        .await
        .map_err(error_response)?;
    let total = results.len();
    Ok(Json(json!({ "results": results, "total": total })))
}

#[derive(Debug, Deserialize)]
pub struct MapResultRequest {
    pub item_id: Uuid,
    pub actor: Option<Uuid>,
}

pub async fn map_unmatched_result(
    State(service): State<AppState>,
    Path(raw_result_id): Path<Uuid>,
    Json(request): Json<MapResultRequest>,
) -> ApiResult<Value> {
    let matched = service
        .manually_map_result(raw_result_id, request.item_id, request.actor)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "result": matched })))
}

#[derive(Debug, Deserialize)]
pub struct EnterResultRequest {
    pub value: String,
}

pub async fn enter_result(
    State(service): State<AppState>,
    Path(item_id): Path<Uuid>,
    Json(request): Json<EnterResultRequest>,
) -> ApiResult<Value> {
    let matched = service
        .enter_result(item_id, &request.value)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "result": matched })))
}

#[derive(Debug, Deserialize)]
pub struct ReasonRequest {
    pub reason: String,
}

pub async fn rerun_item(
    State(service): State<AppState>,
    Path(item_id): Path<Uuid>,
    Json(request): Json<ReasonRequest>,
) -> ApiResult<Value> {
    let order = service
        .rerun(item_id, &request.reason)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "order": order })))
}

// ---------- 医嘱 ----------

pub async fn create_order(
    State(service): State<AppState>,
    Json(order): Json<NewOrder>,
) -> ApiResult<Value> {
    let order = service.create_order(order).await.map_err(error_response)?;
    Ok(Json(json!({ "order": order })))
}

pub async fn get_order(
    State(service): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Value> {
    let order = service.get_order(order_id).await.map_err(error_response)?;
    Ok(Json(json!({ "order": order })))
}

pub async fn collect_sample(
    State(service): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Value> {
    let order = service.collect_sample(order_id).await.map_err(error_response)?;
    Ok(Json(json!({ "order": order })))
}

pub async fn cancel_order(
    State(service): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<ReasonRequest>,
) -> ApiResult<Value> {
    let order = service
        .cancel_order(order_id, &request.reason)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "order": order })))
}

#[derive(Debug, Deserialize)]
pub struct NoteRequest {
    pub note: String,
}

pub async fn preliminary_approve(
    State(service): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<NoteRequest>,
) -> ApiResult<Value> {
    let order = service
        .preliminary_approve(order_id, &request.note)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "order": order })))
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub note: String,
    pub actor: Uuid,
}

pub async fn final_approve(
    State(service): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<ApproveRequest>,
) -> ApiResult<Value> {
    let outcome = service
        .final_approve(order_id, &request.note, request.actor)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "approved_items": outcome.approved_items,
        "order_approved": outcome.order_approved,
    })))
}

pub async fn cancel_approval(
    State(service): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<ReasonRequest>,
) -> ApiResult<Value> {
    let order = service
        .cancel_approval(order_id, &request.reason)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "order": order })))
}

pub async fn delta_check(
    State(service): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Value> {
    let report = service.delta_check(order_id).await.map_err(error_response)?;
    Ok(Json(json!({ "report": report })))
}

// ---------- 危急值 ----------

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub acknowledged: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

pub async fn list_alerts(
    State(service): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> ApiResult<Value> {
    let filter = AlertFilter {
        acknowledged: query.acknowledged,
        from: query.from,
        to: query.to,
    };
    let alerts = service
        .list_critical_alerts(&filter)
        .await
        .map_err(error_response)?;
    let total = alerts.len();
    Ok(Json(json!({ "alerts": alerts, "total": total })))
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgeRequest {
    pub actor: Uuid,
}

pub async fn acknowledge_alert(
    State(service): State<AppState>,
    Path(alert_id): Path<Uuid>,
    Json(request): Json<AcknowledgeRequest>,
) -> ApiResult<Value> {
    let alert = service
        .acknowledge_alert(alert_id, request.actor)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "alert": alert })))
}

// ---------- 质控 ----------

#[derive(Debug, Deserialize)]
pub struct CreateLotRequest {
    pub analyzer_id: Uuid,
    pub test_code: String,
    pub level: QcLevel,
    pub lot_number: String,
    pub mean: f64,
    pub sd: f64,
}

pub async fn create_qc_lot(
    State(service): State<AppState>,
    Json(request): Json<CreateLotRequest>,
) -> ApiResult<Value> {
    let lot = service
        .upsert_qc_lot(QcLot {
            id: Uuid::new_v4(),
            analyzer_id: request.analyzer_id,
            test_code: request.test_code,
            level: request.level,
            lot_number: request.lot_number,
            mean: request.mean,
            sd: request.sd,
            is_active: true,
        })
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "lot": lot })))
}

#[derive(Debug, Deserialize)]
pub struct RunQcRequest {
    pub analyzer_id: Uuid,
    pub lot_id: Uuid,
    pub level: QcLevel,
    pub value: f64,
    pub run_at: Option<DateTime<Utc>>,
    pub performed_by: Option<Uuid>,
}

pub async fn run_qc(
    State(service): State<AppState>,
    Json(request): Json<RunQcRequest>,
) -> ApiResult<Value> {
    let run = service
        .run_qc(
            request.analyzer_id,
            request.lot_id,
            request.level,
            request.value,
            request.run_at.unwrap_or_else(Utc::now),
            request.performed_by,
        )
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "run": run })))
}

#[derive(Debug, Deserialize)]
pub struct LeveyJenningsQuery {
    pub test_code: String,
    pub analyzer_id: Uuid,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

pub async fn levey_jennings_chart(
    State(service): State<AppState>,
    Query(query): Query<LeveyJenningsQuery>,
) -> ApiResult<Value> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or_else(|| to - Duration::days(30));
    let chart = service
        .levey_jennings_chart(&query.test_code, query.analyzer_id, from, to)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "chart": chart })))
}

// ---------- 工作列表 ----------

#[derive(Debug, Deserialize)]
pub struct SendWorklistRequest {
    pub order_ids: Vec<Uuid>,
}

pub async fn send_worklist(
    State(service): State<AppState>,
    Path(analyzer_id): Path<Uuid>,
    Json(request): Json<SendWorklistRequest>,
) -> ApiResult<Value> {
    let outcome = service
        .send_worklist(analyzer_id, &request.order_ids)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "outcome": outcome })))
}

pub async fn list_worklist_entries(
    State(service): State<AppState>,
    Path(analyzer_id): Path<Uuid>,
) -> ApiResult<Value> {
    let entries = service
        .list_worklist_entries(analyzer_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "entries": entries })))
}

pub async fn retry_worklist(
    State(service): State<AppState>,
    Path(entry_id): Path<Uuid>,
) -> ApiResult<Value> {
    let entry = service.retry_worklist(entry_id).await.map_err(error_response)?;
    Ok(Json(json!({ "entry": entry })))
}
