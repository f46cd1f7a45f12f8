//! 工作列表下发
//!
//! 把待检医嘱组装为ORM^O01报文发给双向仪器, 每单留一条发送记录。
//! 发送以消息控制ID关联ACK, 拒收或超时记为失败, 可人工重试。

use std::sync::Arc;
use std::time::Duration;

use lis_core::{ItemStatus, LisError, Result, WorklistEntry, WorklistStatus};
use lis_protocol::{ConnectionManager, Hl7Parser, WorklistRequest, WorklistTest};
use lis_store::{AnalyzerStore, OrderStore, WorklistStore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// 工作列表下发结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendWorklistOutcome {
    pub sent: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub entries: Vec<WorklistEntry>,
}

/// 工作列表下发器
pub struct WorklistDispatcher {
    orders: Arc<dyn OrderStore>,
    analyzers: Arc<dyn AnalyzerStore>,
    worklists: Arc<dyn WorklistStore>,
    manager: Arc<ConnectionManager>,
    parser: Hl7Parser,
}

impl WorklistDispatcher {
    /// 创建下发器
    pub fn new(
        orders: Arc<dyn OrderStore>,
        analyzers: Arc<dyn AnalyzerStore>,
        worklists: Arc<dyn WorklistStore>,
        manager: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            orders,
            analyzers,
            worklists,
            manager,
            parser: Hl7Parser::new(),
        }
    }

    /// 把若干医嘱下发给指定仪器
    pub async fn send_worklist(
        &self,
        analyzer_id: Uuid,
        order_ids: &[Uuid],
    ) -> Result<SendWorklistOutcome> {
        let analyzer = self.analyzers.get_analyzer(analyzer_id).await?;
        if !analyzer.is_active {
            return Err(LisError::Validation(format!(
                "analyzer {} is deactivated",
                analyzer.code
            )));
        }

        let mut outcome = SendWorklistOutcome::default();
        for &order_id in order_ids {
            match self.send_order(analyzer_id, order_id, 0).await {
                Ok(entry) => {
                    match entry.status {
                        WorklistStatus::Acknowledged | WorklistStatus::Sent => outcome.sent += 1,
                        _ => {
                            outcome.failed += 1;
                            if let Some(error) = &entry.error_message {
                                outcome.errors.push(format!("order {}: {}", order_id, error));
                            }
                        }
                    }
                    outcome.entries.push(entry);
                }
                Err(e) => {
                    outcome.failed += 1;
                    outcome.errors.push(format!("order {}: {}", order_id, e));
                }
            }
        }

        info!(
            "worklist dispatch to analyzer {}: {} sent, {} failed",
            analyzer_id, outcome.sent, outcome.failed
        );
        Ok(outcome)
    }

    /// 重发一条失败的工作列表记录
    pub async fn retry(&self, entry_id: Uuid) -> Result<WorklistEntry> {
        let entry = self.worklists.get_entry(entry_id).await?;
        if entry.status != WorklistStatus::Failed {
            return Err(LisError::Validation(format!(
                "worklist entry {} is not in failed state",
                entry_id
            )));
        }
        self.send_order(entry.analyzer_id, entry.order_id, entry.retry_count + 1)
            .await
    }

    async fn send_order(
        &self,
        analyzer_id: Uuid,
        order_id: Uuid,
        retry_count: i32,
    ) -> Result<WorklistEntry> {
        let order = self.orders.get_order(order_id).await?;
        let barcode = order.sample_barcode.clone().ok_or_else(|| {
            LisError::Validation(format!("order {} has no sample barcode yet", order.order_code))
        })?;

        let tests: Vec<WorklistTest> = order
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Pending)
            .map(|i| WorklistTest {
                test_code: i.test_code.clone(),
                test_name: i.test_name.clone(),
            })
            .collect();
        if tests.is_empty() {
            return Err(LisError::Validation(format!(
                "order {} has no pending tests to dispatch",
                order.order_code
            )));
        }

        let control_id: String = Uuid::new_v4().simple().to_string().chars().take(20).collect();
        let request = WorklistRequest {
            message_control_id: Some(control_id.clone()),
            patient_id: order.patient_id.to_string(),
            sample_id: barcode.clone(),
            placer_order_number: Some(order.order_code.clone()),
            requested_at: Some(order.ordered_at),
            collected_at: order.collected_at,
            tests,
            ..Default::default()
        };
        let message = self.parser.build_worklist_message(&request);

        let entry = WorklistEntry {
            id: Uuid::new_v4(),
            analyzer_id,
            order_id,
            sample_barcode: Some(barcode),
            test_codes: order
                .items
                .iter()
                .filter(|i| i.status == ItemStatus::Pending)
                .map(|i| i.test_code.clone())
                .collect(),
            message_control_id: control_id,
            status: WorklistStatus::Pending,
            sent_at: None,
            retry_count,
            error_message: None,
        };
        self.worklists.save_entry(entry.clone()).await?;

        let (status, error_message) = match self
            .manager
            .send_frame(analyzer_id, message, ACK_TIMEOUT)
            .await
        {
            Ok(ack) => {
                let ack_code = ack
                    .segment("MSA")
                    .and_then(|s| s.field(1))
                    .unwrap_or("")
                    .to_string();
                if ack_code == "AA" {
                    (WorklistStatus::Acknowledged, None)
                } else {
                    warn!(
                        "analyzer {} rejected worklist for order {}: {}",
                        analyzer_id, order_id, ack_code
                    );
                    (
                        WorklistStatus::Failed,
                        Some(format!("analyzer rejected worklist: {}", ack_code)),
                    )
                }
            }
            Err(e) => (WorklistStatus::Failed, Some(e.to_string())),
        };

        self.worklists
            .update_status(entry.id, status, error_message)
            .await?;
        self.worklists.get_entry(entry.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lis_core::{AnalyzerProtocol, ConnectionConfig, ReferenceBounds};
    use lis_store::{AnalyzerSpec, MemoryStore, NewOrder, NewOrderItem};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 模拟仪器端: 对每条收到的报文回AA确认
    async fn spawn_acking_peer() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let parser = Hl7Parser::new();
            let mut buffer = vec![0u8; 8192];
            loop {
                let n = match socket.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let received = String::from_utf8_lossy(&buffer[..n]).to_string();
                if let Ok(message) = parser.parse(&received) {
                    let ack = parser.build_ack(&message, "AA", None);
                    let _ = socket
                        .write_all(Hl7Parser::wrap_mllp(&ack).as_bytes())
                        .await;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_send_worklist_records_acknowledged_entry() {
        let peer_addr = spawn_acking_peer().await;

        let store = Arc::new(MemoryStore::new());
        let analyzer = store
            .create_analyzer(AnalyzerSpec {
                code: "CHEM01".to_string(),
                name: "Chemistry Analyzer".to_string(),
                manufacturer: None,
                model: None,
                protocol: AnalyzerProtocol::Hl7V2,
                connection: ConnectionConfig::Connect {
                    host: peer_addr.ip().to_string(),
                    port: peer_addr.port(),
                },
                is_active: true,
            })
            .await
            .unwrap();

        let order = store
            .create_order(NewOrder {
                patient_id: Uuid::new_v4(),
                sample_barcode: Some("BC777".to_string()),
                sample_type: None,
                items: vec![NewOrderItem {
                    test_code: "GLU".to_string(),
                    test_name: "Glucose".to_string(),
                    unit: None,
                    reference_range_text: None,
                    bounds: ReferenceBounds::default(),
                }],
            })
            .await
            .unwrap();

        let (manager, _events) = ConnectionManager::new();
        let manager = Arc::new(manager);
        manager
            .start(analyzer.id, &analyzer.connection)
            .await
            .unwrap();

        let dispatcher = WorklistDispatcher::new(
            store.clone(),
            store.clone(),
            store.clone(),
            manager.clone(),
        );
        let outcome = dispatcher
            .send_worklist(analyzer.id, &[order.id])
            .await
            .unwrap();

        assert_eq!(outcome.sent, 1);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.entries[0].status, WorklistStatus::Acknowledged);
        assert!(outcome.entries[0].sent_at.is_some());

        let stored = store.list_for_analyzer(analyzer.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].test_codes, vec!["GLU".to_string()]);

        manager.stop(analyzer.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_worklist_without_channel_fails_entry() {
        let store = Arc::new(MemoryStore::new());
        let analyzer = store
            .create_analyzer(AnalyzerSpec {
                code: "CHEM02".to_string(),
                name: "Offline Analyzer".to_string(),
                manufacturer: None,
                model: None,
                protocol: AnalyzerProtocol::Hl7V2,
                connection: ConnectionConfig::Connect {
                    host: "127.0.0.1".to_string(),
                    port: 1,
                },
                is_active: true,
            })
            .await
            .unwrap();

        let order = store
            .create_order(NewOrder {
                patient_id: Uuid::new_v4(),
                sample_barcode: Some("BC778".to_string()),
                sample_type: None,
                items: vec![NewOrderItem {
                    test_code: "K".to_string(),
                    test_name: "Potassium".to_string(),
                    unit: None,
                    reference_range_text: None,
                    bounds: ReferenceBounds::default(),
                }],
            })
            .await
            .unwrap();

        // 通道从未打开
        let (manager, _events) = ConnectionManager::new();
        let dispatcher = WorklistDispatcher::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(manager),
        );

        let outcome = dispatcher
            .send_worklist(analyzer.id, &[order.id])
            .await
            .unwrap();
        assert_eq!(outcome.sent, 0);
        assert_eq!(outcome.failed, 1);

        let stored = store.list_for_analyzer(analyzer.id).await.unwrap();
        assert_eq!(stored[0].status, WorklistStatus::Failed);
        assert!(stored[0].error_message.is_some());
    }
}
