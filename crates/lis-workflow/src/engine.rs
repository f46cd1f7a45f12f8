//! 检验服务
//!
//! 协调连接管理器、结果匹配、审核流程、危急值、差值核查、质控与
//! 工作列表下发的核心服务, 是对外操作接口的唯一入口。
//! 连接事件由单一事件泵消费: 同一通道的帧按到达顺序处理,
//! 不同仪器之间不保证顺序。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lis_core::{
    utils::generate_sample_barcode, AlertFilter, Analyzer, AnalyzerProtocol, BoundaryPolicy,
    ConnectionEventKind, ConnectionLogEntry, ConnectionStatus, CriticalValueAlert, LabOrder,
    LisError, OrderStatus, QcLevel, QcLot, QcRun, RawResult, Result, TestMapping, WorklistEntry,
};
use lis_protocol::{AnalyzerEvent, ConnectionManager};
use lis_store::{
    AlertStore, AnalyzerSpec, AnalyzerStore, FinalApprovalOutcome, MemoryStore, NewOrder,
    NewTestMapping, OrderStore, QcStore, RawResultStore, WorklistStore,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::critical_value::CriticalValueEngine;
use crate::delta_check::{DeltaCheckEngine, DeltaCheckReport, DEFAULT_DELTA_THRESHOLD_PERCENT};
use crate::matcher::{MatchedResult, ProcessOutcome, ResultMatcher};
use crate::notify::ResultNotifier;
use crate::qc::{LeveyJenningsChart, QcEngine};
use crate::state_machine::{OrderAction, OrderStateMachine};
use crate::worklist::{SendWorklistOutcome, WorklistDispatcher};

/// 服务配置
#[derive(Debug, Clone)]
pub struct LabConfig {
    pub boundary_policy: BoundaryPolicy,
    pub delta_threshold_percent: f64,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            boundary_policy: BoundaryPolicy::default(),
            delta_threshold_percent: DEFAULT_DELTA_THRESHOLD_PERCENT,
        }
    }
}

/// 仓储集合
#[derive(Clone)]
pub struct LabStores {
    pub orders: Arc<dyn OrderStore>,
    pub raw_results: Arc<dyn RawResultStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub qc: Arc<dyn QcStore>,
    pub analyzers: Arc<dyn AnalyzerStore>,
    pub worklists: Arc<dyn WorklistStore>,
}

impl LabStores {
    /// 全部仓储共用同一个内存实现
    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            orders: store.clone(),
            raw_results: store.clone(),
            alerts: store.clone(),
            qc: store.clone(),
            analyzers: store.clone(),
            worklists: store,
        }
    }
}

/// 检验服务
pub struct LabService {
    stores: LabStores,
    matcher: ResultMatcher,
    critical: Arc<CriticalValueEngine>,
    delta: Arc<DeltaCheckEngine>,
    qc: QcEngine,
    dispatcher: WorklistDispatcher,
    manager: Arc<ConnectionManager>,
    notifier: Arc<dyn ResultNotifier>,
    state_machine: OrderStateMachine,
}

impl LabService {
    /// 组装检验服务
    pub fn new(
        stores: LabStores,
        manager: Arc<ConnectionManager>,
        notifier: Arc<dyn ResultNotifier>,
        config: LabConfig,
    ) -> Self {
        let critical = Arc::new(CriticalValueEngine::new(stores.alerts.clone()));
        let delta = Arc::new(DeltaCheckEngine::new(
            stores.orders.clone(),
            config.delta_threshold_percent,
        ));
        let matcher = ResultMatcher::new(
            stores.orders.clone(),
            stores.raw_results.clone(),
            stores.analyzers.clone(),
            critical.clone(),
            delta.clone(),
            config.boundary_policy,
        );
        let qc = QcEngine::new(stores.qc.clone());
        let dispatcher = WorklistDispatcher::new(
            stores.orders.clone(),
            stores.analyzers.clone(),
            stores.worklists.clone(),
            manager.clone(),
        );

        Self {
            stores,
            matcher,
            critical,
            delta,
            qc,
            dispatcher,
            manager,
            notifier,
            state_machine: OrderStateMachine::new(),
        }
    }

    // ---------- 仪器管理 ----------

    pub async fn register_analyzer(&self, spec: AnalyzerSpec) -> Result<Analyzer> {
        let analyzer = self.stores.analyzers.create_analyzer(spec).await?;
        info!("registered analyzer {} ({})", analyzer.code, analyzer.id);
        Ok(analyzer)
    }

    pub async fn update_analyzer(&self, analyzer_id: Uuid, spec: AnalyzerSpec) -> Result<Analyzer> {
        self.stores.analyzers.update_analyzer(analyzer_id, spec).await
    }

    /// 停用仪器并关闭其通道 (软删除)
    pub async fn deactivate_analyzer(&self, analyzer_id: Uuid) -> Result<Analyzer> {
        if self.manager.status(analyzer_id).await != ConnectionStatus::Disconnected {
            let _ = self.manager.stop(analyzer_id).await;
        }
        self.stores.analyzers.deactivate_analyzer(analyzer_id).await
    }

    pub async fn list_analyzers(&self, include_inactive: bool) -> Result<Vec<Analyzer>> {
        self.stores.analyzers.list_analyzers(include_inactive).await
    }

    pub async fn get_analyzer(&self, analyzer_id: Uuid) -> Result<Analyzer> {
        self.stores.analyzers.get_analyzer(analyzer_id).await
    }

    pub async fn set_test_mappings(
        &self,
        analyzer_id: Uuid,
        mappings: Vec<NewTestMapping>,
    ) -> Result<Vec<TestMapping>> {
        self.stores.analyzers.set_mappings(analyzer_id, mappings).await
    }

    pub async fn list_test_mappings(&self, analyzer_id: Uuid) -> Result<Vec<TestMapping>> {
        self.stores.analyzers.mappings_for(analyzer_id).await
    }

    /// 打开/关闭仪器通道
    pub async fn toggle_connection(
        &self,
        analyzer_id: Uuid,
        connect: bool,
    ) -> Result<ConnectionStatus> {
        let analyzer = self.stores.analyzers.get_analyzer(analyzer_id).await?;

        if connect {
            if !analyzer.is_active {
                return Err(LisError::Validation(format!(
                    "analyzer {} is deactivated",
                    analyzer.code
                )));
            }
            if analyzer.protocol != AnalyzerProtocol::Hl7V2 {
                return Err(LisError::Unsupported(format!(
                    "no decoder available for protocol {:?}",
                    analyzer.protocol
                )));
            }
            self.manager.start(analyzer_id, &analyzer.connection).await?;
            self.stores.analyzers.touch_connected(analyzer_id).await?;
        } else {
            self.manager.stop(analyzer_id).await?;
        }

        Ok(self.manager.status(analyzer_id).await)
    }

    pub async fn connection_status(&self, analyzer_id: Uuid) -> ConnectionStatus {
        self.manager.status(analyzer_id).await
    }

    pub async fn list_connection_logs(
        &self,
        analyzer_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ConnectionLogEntry>> {
        self.stores
            .analyzers
            .list_connection_logs(analyzer_id, from, to)
            .await
    }

    // ---------- 医嘱与结果 ----------

    pub async fn create_order(&self, order: NewOrder) -> Result<LabOrder> {
        self.stores.orders.create_order(order).await
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<LabOrder> {
        self.stores.orders.get_order(order_id).await
    }

    /// 采样: 生成样本条码并推进医嘱状态
    pub async fn collect_sample(&self, order_id: Uuid) -> Result<LabOrder> {
        let order = self.stores.orders.get_order(order_id).await?;
        self.state_machine
            .transition(order.status, &OrderAction::Collect)?;
        let barcode = generate_sample_barcode(order_id);
        self.stores.orders.mark_collected(order_id, barcode).await
    }

    pub async fn cancel_order(&self, order_id: Uuid, reason: &str) -> Result<LabOrder> {
        let order = self.stores.orders.get_order(order_id).await?;
        self.state_machine
            .transition(order.status, &OrderAction::Cancel)?;
        self.stores.orders.cancel_order(order_id, reason).await
    }

    /// 处理一帧仪器报文 (连接事件泵或手工补录调用)
    pub async fn process_frame(&self, analyzer_id: Uuid, raw_frame: &str) -> Result<ProcessOutcome> {
        let outcome = self.matcher.process_frame(analyzer_id, raw_frame).await?;

        if let Err(e) = self.stores.analyzers.touch_data_received(analyzer_id).await {
            warn!("failed to update last data time for {}: {}", analyzer_id, e);
        }
        let log = ConnectionLogEntry {
            id: Uuid::new_v4(),
            analyzer_id,
            at: Utc::now(),
            kind: ConnectionEventKind::DataReceived,
            detail: Some(format!(
                "{} observations, {} matched, {} unmatched",
                outcome.processed, outcome.matched, outcome.unmatched
            )),
        };
        if let Err(e) = self.stores.analyzers.append_connection_log(log).await {
            warn!("failed to append connection log for {}: {}", analyzer_id, e);
        }

        Ok(outcome)
    }

    /// 手工录入结果
    pub async fn enter_result(&self, item_id: Uuid, value: &str) -> Result<MatchedResult> {
        self.matcher.enter_result(item_id, value).await
    }

    /// 重测: 清空项目结果并回退医嘱状态
    pub async fn rerun(&self, item_id: Uuid, reason: &str) -> Result<LabOrder> {
        self.stores.orders.rerun_item(item_id, reason).await
    }

    // ---------- 审核流程 ----------

    pub async fn preliminary_approve(&self, order_id: Uuid, note: &str) -> Result<LabOrder> {
        let order = self.stores.orders.get_order(order_id).await?;
        self.state_machine
            .transition(order.status, &OrderAction::PreliminaryApprove)?;
        self.stores.orders.preliminary_approve(order_id, note).await
    }

    /// 终审
    ///
    /// 有结果的项目一律置为已审(源系统允许的部分终审状态被保留);
    /// 但只要有项目缺结果, 医嘱不进入终态、不发通知, 并返回
    /// 指明缺失项目的领域错误。
    pub async fn final_approve(
        &self,
        order_id: Uuid,
        note: &str,
        actor: Uuid,
    ) -> Result<FinalApprovalOutcome> {
        let order = self.stores.orders.get_order(order_id).await?;
        // 检验中的医嘱也可发起终审(部分终审路径), 其余状态拒绝
        match order.status {
            OrderStatus::Processing
            | OrderStatus::PendingApproval
            | OrderStatus::PreliminaryApproved => {}
            other => {
                return Err(LisError::InvalidStateTransition {
                    from: format!("{:?}", other),
                    action: "final_approve".to_string(),
                })
            }
        }

        let outcome = self.stores.orders.final_approve(order_id, note, actor).await?;

        if outcome.order_approved {
            // 通知尽力投递: 失败只记日志, 不影响审核本身
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify_result_ready(order_id, actor).await {
                    warn!(
                        "result ready notification for order {} failed: {}",
                        order_id, e
                    );
                }
            });
            info!("order {} fully approved by {}", order_id, actor);
            Ok(outcome)
        } else {
            Err(LisError::ApprovalIncomplete {
                missing: outcome.missing,
            })
        }
    }

    /// 取消审核 (部分终审遗留的已审项目也一并回退, 不走状态机)
    pub async fn cancel_approval(&self, order_id: Uuid, reason: &str) -> Result<LabOrder> {
        self.stores.orders.cancel_approval(order_id, reason).await
    }

    // ---------- 危急值 / 差值核查 ----------

    pub async fn list_critical_alerts(
        &self,
        filter: &AlertFilter,
    ) -> Result<Vec<CriticalValueAlert>> {
        self.critical.list(filter).await
    }

    pub async fn acknowledge_alert(
        &self,
        alert_id: Uuid,
        actor: Uuid,
    ) -> Result<CriticalValueAlert> {
        self.critical.acknowledge(alert_id, actor).await
    }

    pub async fn delta_check(&self, order_id: Uuid) -> Result<DeltaCheckReport> {
        self.delta.check_order(order_id).await
    }

    // ---------- 质控 ----------

    pub async fn upsert_qc_lot(&self, lot: QcLot) -> Result<QcLot> {
        self.stores.qc.upsert_lot(lot).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run_qc(
        &self,
        analyzer_id: Uuid,
        lot_id: Uuid,
        level: QcLevel,
        value: f64,
        run_at: DateTime<Utc>,
        performed_by: Option<Uuid>,
    ) -> Result<QcRun> {
        self.qc
            .run_qc(analyzer_id, lot_id, level, value, run_at, performed_by)
            .await
    }

    pub async fn levey_jennings_chart(
        &self,
        test_code: &str,
        analyzer_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<LeveyJenningsChart> {
        self.qc.levey_jennings(test_code, analyzer_id, from, to).await
    }

    // ---------- 未匹配结果 ----------

    pub async fn list_unmatched_results(
        &self,
        analyzer_id: Option<Uuid>,
    ) -> Result<Vec<RawResult>> {
        self.stores.raw_results.list_unmatched(analyzer_id).await
    }

    pub async fn manually_map_result(
        &self,
        raw_result_id: Uuid,
        item_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<MatchedResult> {
        self.matcher.map_raw_result(raw_result_id, item_id, actor).await
    }

    // ---------- 工作列表 ----------

    pub async fn send_worklist(
        &self,
        analyzer_id: Uuid,
        order_ids: &[Uuid],
    ) -> Result<SendWorklistOutcome> {
        self.dispatcher.send_worklist(analyzer_id, order_ids).await
    }

    pub async fn retry_worklist(&self, entry_id: Uuid) -> Result<WorklistEntry> {
        self.dispatcher.retry(entry_id).await
    }

    pub async fn list_worklist_entries(&self, analyzer_id: Uuid) -> Result<Vec<WorklistEntry>> {
        self.stores.worklists.list_for_analyzer(analyzer_id).await
    }

    // ---------- 事件泵 ----------

    /// 消费连接管理器的事件流
    ///
    /// 单一消费者保证同通道帧按到达顺序进入匹配流水线;
    /// 持久化在这里完成, 不阻塞各通道的读循环。
    pub async fn run_event_pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<AnalyzerEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                AnalyzerEvent::FrameReceived { analyzer_id, frame } => {
                    if let Err(e) = self.process_frame(analyzer_id, &frame).await {
                        error!(
                            "failed to process frame from analyzer {}: {}",
                            analyzer_id, e
                        );
                    }
                }
                AnalyzerEvent::StatusChanged {
                    analyzer_id,
                    status,
                    detail,
                } => {
                    info!(
                        "analyzer {} connection status: {:?} ({})",
                        analyzer_id, status, detail
                    );
                    let kind = match status {
                        ConnectionStatus::Connected => ConnectionEventKind::Connected,
                        ConnectionStatus::Listening => ConnectionEventKind::Listening,
                        ConnectionStatus::Disconnected => ConnectionEventKind::Disconnected,
                        ConnectionStatus::Error => ConnectionEventKind::Error,
                    };
                    if status == ConnectionStatus::Connected {
                        let _ = self.stores.analyzers.touch_connected(analyzer_id).await;
                    }
                    let log = ConnectionLogEntry {
                        id: Uuid::new_v4(),
                        analyzer_id,
                        at: Utc::now(),
                        kind,
                        detail: Some(detail),
                    };
                    if let Err(e) = self.stores.analyzers.append_connection_log(log).await {
                        warn!("failed to append connection log: {}", e);
                    }
                }
                AnalyzerEvent::Error {
                    analyzer_id,
                    operation,
                    message,
                } => {
                    error!(
                        "analyzer {} channel error during {}: {}",
                        analyzer_id, operation, message
                    );
                    let log = ConnectionLogEntry {
                        id: Uuid::new_v4(),
                        analyzer_id,
                        at: Utc::now(),
                        kind: ConnectionEventKind::Error,
                        detail: Some(format!("{}: {}", operation, message)),
                    };
                    if let Err(e) = self.stores.analyzers.append_connection_log(log).await {
                        warn!("failed to append connection log: {}", e);
                    }
                }
            }
        }
    }

    /// 进程退出前关闭全部通道
    pub async fn shutdown(&self) {
        self.manager.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lis_core::{ConnectionConfig, ItemStatus, OrderStatus, ReferenceBounds};
    use lis_store::NewOrderItem;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    struct CountingNotifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResultNotifier for CountingNotifier {
        async fn notify_result_ready(&self, _order_id: Uuid, _triggered_by: Uuid) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn service_with_notifier() -> (Arc<LabService>, Arc<MemoryStore>, Arc<CountingNotifier>) {
        let store = Arc::new(MemoryStore::new());
        let (manager, _events) = ConnectionManager::new();
        let notifier = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
        });
        let service = Arc::new(LabService::new(
            LabStores::from_memory(store.clone()),
            Arc::new(manager),
            notifier.clone(),
            LabConfig::default(),
        ));
        (service, store, notifier)
    }

    fn three_item_order() -> NewOrder {
        NewOrder {
            patient_id: Uuid::new_v4(),
            sample_barcode: Some("BC100".to_string()),
            sample_type: None,
            items: ["GLU", "K", "NA"]
                .iter()
                .map(|code| NewOrderItem {
                    test_code: code.to_string(),
                    test_name: code.to_string(),
                    unit: None,
                    reference_range_text: None,
                    bounds: ReferenceBounds::default(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_partial_final_approve_surfaces_missing_items() {
        let (service, _store, notifier) = service_with_notifier();

        let order = service.create_order(three_item_order()).await.unwrap();
        service
            .enter_result(order.items[0].id, "5.0")
            .await
            .unwrap();
        service
            .enter_result(order.items[1].id, "4.0")
            .await
            .unwrap();

        // 3项中1项无结果: 终审必须报出缺失项目, 不发通知
        let err = service
            .final_approve(order.id, "checked", Uuid::new_v4())
            .await
            .unwrap_err();
        match err {
            LisError::ApprovalIncomplete { missing } => {
                assert_eq!(missing, vec!["NA".to_string()]);
            }
            other => panic!("expected ApprovalIncomplete, got {:?}", other),
        }

        let reloaded = service.get_order(order.id).await.unwrap();
        assert_eq!(reloaded.items[0].status, ItemStatus::Approved);
        assert_eq!(reloaded.items[1].status, ItemStatus::Approved);
        assert_eq!(reloaded.items[2].status, ItemStatus::Pending);
        assert_ne!(reloaded.status, OrderStatus::Approved);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);

        // 缺失项目补上结果后终审完成并触发通知
        service
            .enter_result(order.items[2].id, "140")
            .await
            .unwrap();
        let outcome = service
            .final_approve(order.id, "checked", Uuid::new_v4())
            .await
            .unwrap();
        assert!(outcome.order_approved);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

        let approved = service.get_order(order.id).await.unwrap();
        assert_eq!(approved.status, OrderStatus::Approved);
    }

    #[tokio::test]
    async fn test_final_approve_requires_results_state() {
        let (service, _store, _notifier) = service_with_notifier();
        let order = service.create_order(three_item_order()).await.unwrap();

        // 全部项目都无结果 (Pending状态): 状态机直接拒绝
        assert!(matches!(
            service
                .final_approve(order.id, "x", Uuid::new_v4())
                .await
                .unwrap_err(),
            LisError::InvalidStateTransition { .. }
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_frame_over_tcp_updates_order() {
        let store = Arc::new(MemoryStore::new());
        let (manager, events) = ConnectionManager::new();
        let manager = Arc::new(manager);
        let service = Arc::new(LabService::new(
            LabStores::from_memory(store.clone()),
            manager.clone(),
            Arc::new(crate::notify::LoggingNotifier),
            LabConfig::default(),
        ));
        tokio::spawn(service.clone().run_event_pump(events));

        let analyzer = service
            .register_analyzer(AnalyzerSpec {
                code: "HEMA01".to_string(),
                name: "Hematology Analyzer".to_string(),
                manufacturer: None,
                model: None,
                protocol: AnalyzerProtocol::Hl7V2,
                connection: ConnectionConfig::Listen {
                    bind: "127.0.0.1".to_string(),
                    port: 0,
                },
                is_active: true,
            })
            .await
            .unwrap();

        let order = service
            .create_order(NewOrder {
                patient_id: Uuid::new_v4(),
                sample_barcode: Some("BC900".to_string()),
                sample_type: None,
                items: vec![NewOrderItem {
                    test_code: "WBC".to_string(),
                    test_name: "White Blood Cells".to_string(),
                    unit: Some("10^9/L".to_string()),
                    reference_range_text: None,
                    bounds: ReferenceBounds {
                        normal_min: Some(4.0),
                        normal_max: Some(10.0),
                        critical_low: Some(1.0),
                        critical_high: Some(30.0),
                    },
                }],
            })
            .await
            .unwrap();

        let status = service.toggle_connection(analyzer.id, true).await.unwrap();
        assert_eq!(status, ConnectionStatus::Listening);

        let addr = manager.local_addr(analyzer.id).await.unwrap();
        let mut socket = TcpStream::connect(addr).await.unwrap();
        let frame = "MSH|^~\\&|HEMA|LAB|LIS|HOSP|20260115090000||ORU^R01|M900|P|2.5\r\
OBR|1|O9|BC900|CBC^Blood Count\r\
OBX|1|NM|WBC^White Blood Cells||7.5|10^9/L|4.0-10.0|N|||F|||20260115085900\r";
        socket
            .write_all(lis_protocol::Hl7Parser::wrap_mllp(frame).as_bytes())
            .await
            .unwrap();

        // 等待事件泵完成入库
        let mut settled = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let reloaded = service.get_order(order.id).await.unwrap();
            if reloaded.status == OrderStatus::PendingApproval {
                assert_eq!(reloaded.items[0].numeric_result, Some(7.5));
                assert_eq!(
                    reloaded.items[0].flag,
                    Some(lis_core::ResultFlag::Normal)
                );
                settled = true;
                break;
            }
        }
        assert!(settled, "order never reached PendingApproval");

        service.toggle_connection(analyzer.id, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_toggle_connection_rejects_unsupported_protocol() {
        let (service, _store, _notifier) = service_with_notifier();
        let analyzer = service
            .register_analyzer(AnalyzerSpec {
                code: "OLD01".to_string(),
                name: "Legacy Analyzer".to_string(),
                manufacturer: None,
                model: None,
                protocol: AnalyzerProtocol::Astm1394,
                connection: ConnectionConfig::Listen {
                    bind: "127.0.0.1".to_string(),
                    port: 0,
                },
                is_active: true,
            })
            .await
            .unwrap();

        assert!(matches!(
            service.toggle_connection(analyzer.id, true).await.unwrap_err(),
            LisError::Unsupported(_)
        ));
    }

    #[tokio::test]
    async fn test_deactivated_analyzer_cannot_connect() {
        let (service, _store, _notifier) = service_with_notifier();
        let analyzer = service
            .register_analyzer(AnalyzerSpec {
                code: "CHEM09".to_string(),
                name: "Retired Analyzer".to_string(),
                manufacturer: None,
                model: None,
                protocol: AnalyzerProtocol::Hl7V2,
                connection: ConnectionConfig::Listen {
                    bind: "127.0.0.1".to_string(),
                    port: 0,
                },
                is_active: true,
            })
            .await
            .unwrap();

        service.deactivate_analyzer(analyzer.id).await.unwrap();
        assert!(service.toggle_connection(analyzer.id, true).await.is_err());

        // 软删除: 带停用过滤的列表看不到, 全量列表仍在
        assert!(service.list_analyzers(false).await.unwrap().is_empty());
        assert_eq!(service.list_analyzers(true).await.unwrap().len(), 1);
    }
}
