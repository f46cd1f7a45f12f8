//! Web服务器

use axum::{
    routing::{get, post},
    Router,
};
use lis_core::{LisError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::handlers::{self, AppState};
use lis_workflow::LabService;

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    pub fn new(addr: SocketAddr, service: Arc<LabService>) -> Self {
        let app = Self::create_app(service);
        Self { addr, app }
    }

    fn create_app(service: AppState) -> Router {
        Router::new()
            // 健康检查
            .route("/health", get(handlers::health))
            // API路由
            .nest("/api/v1", api_routes())
            .with_state(service)
            // 全局中间件
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(
                        CorsLayer::new()
                            .allow_origin(Any)
                            .allow_methods(Any)
                            .allow_headers(Any),
                    ),
            )
    }

    pub async fn run(self) -> Result<()> {
        info!("starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app)
            .await
            .map_err(|e| LisError::Internal(format!("web server failed: {}", e)))?;

        Ok(())
    }
}

/// API v1 路由
fn api_routes() -> Router<AppState> {
    Router::new()
        // 仪器管理
        .route(
            "/analyzers",
            get(handlers::list_analyzers).post(handlers::register_analyzer),
        )
        .route(
            "/analyzers/:id",
            get(handlers::get_analyzer)
                .put(handlers::update_analyzer)
                .delete(handlers::deactivate_analyzer),
        )
        .route(
            "/analyzers/:id/connection",
            get(handlers::connection_status).post(handlers::toggle_connection),
        )
        .route(
            "/analyzers/:id/mappings",
            get(handlers::list_mappings).put(handlers::set_mappings),
        )
        .route("/analyzers/:id/logs", get(handlers::list_connection_logs))
        .route(
            "/analyzers/:id/worklist",
            get(handlers::list_worklist_entries).post(handlers::send_worklist),
        )
        .route("/analyzers/:id/frames", post(handlers::process_frame))
        // 未匹配结果
        .route("/results/unmatched", get(handlers::list_unmatched_results))
        .route(
            "/results/unmatched/:id/map",
            post(handlers::map_unmatched_result),
        )
        // 医嘱与审核
        .route("/orders", post(handlers::create_order))
        .route("/orders/:id", get(handlers::get_order))
        .route("/orders/:id/collect", post(handlers::collect_sample))
        .route("/orders/:id/cancel", post(handlers::cancel_order))
        .route(
            "/orders/:id/preliminary-approve",
            post(handlers::preliminary_approve),
        )
        .route("/orders/:id/approve", post(handlers::final_approve))
        .route(
            "/orders/:id/cancel-approval",
            post(handlers::cancel_approval),
        )
        .route("/orders/:id/delta-check", get(handlers::delta_check))
        // 结果录入
        .route("/items/:id/result", post(handlers::enter_result))
        .route("/items/:id/rerun", post(handlers::rerun_item))
        // 危急值
        .route("/alerts", get(handlers::list_alerts))
        .route("/alerts/:id/acknowledge", post(handlers::acknowledge_alert))
        // 质控
        .route("/qc/lots", post(handlers::create_qc_lot))
        .route("/qc/runs", post(handlers::run_qc))
        .route("/qc/levey-jennings", get(handlers::levey_jennings_chart))
        // 工作列表重发
        .route("/worklist/:id/retry", post(handlers::retry_worklist))
}
