//! PostgreSQL仓储实现
//!
//! 状态枚举以文本落库, 复合结构(连接参数/审计备注)以JSON文本落库。
//! `record_result` 在事务内锁定医嘱行, 以写后读的计数重算汇总状态,
//! 不依赖事务外的缓存计数。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lis_core::{
    AlertFilter, AlertStatus, Analyzer, AnalyzerProtocol, ConnectionEventKind, ConnectionLogEntry,
    CriticalValueAlert, ItemStatus, LabOrder, LabOrderItem, LisError, OrderStatus, QcLevel, QcLot,
    QcRun, RawResult, RawResultStatus, ReferenceBounds, Result, ResultFlag, TestMapping,
    WorklistEntry, WorklistStatus,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::repository::{
    AlertStore, AnalyzerSpec, AnalyzerStore, FinalApprovalOutcome, NewOrder, NewTestMapping,
    OrderStore, PendingItemRef, PriorResult, QcStore, RawResultStore, ResultRecorded,
    ResultUpdate, WorklistStore,
};

/// PostgreSQL仓储
pub struct PgStore {
    pool: PgPool,
}

fn db(e: sqlx::Error) -> LisError {
    LisError::Database(e.to_string())
}

impl PgStore {
    /// 连接数据库
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(db)?;
        Ok(Self { pool })
    }

    /// 建表
    pub async fn create_tables(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS analyzers (
                id UUID PRIMARY KEY,
                code VARCHAR(64) UNIQUE NOT NULL,
                name VARCHAR(255) NOT NULL,
                manufacturer VARCHAR(255),
                model VARCHAR(255),
                protocol VARCHAR(20) NOT NULL,
                connection TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                last_connected_at TIMESTAMP WITH TIME ZONE,
                last_data_received_at TIMESTAMP WITH TIME ZONE,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS test_mappings (
                id UUID PRIMARY KEY,
                analyzer_id UUID NOT NULL REFERENCES analyzers(id),
                analyzer_test_code VARCHAR(64) NOT NULL,
                analyzer_test_name VARCHAR(255),
                his_test_code VARCHAR(64) NOT NULL,
                his_test_name VARCHAR(255) NOT NULL,
                conversion_factor DOUBLE PRECISION,
                is_active BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS lab_orders (
                id UUID PRIMARY KEY,
                order_code VARCHAR(64) UNIQUE NOT NULL,
                patient_id UUID NOT NULL,
                sample_barcode VARCHAR(64),
                sample_type VARCHAR(64),
                status VARCHAR(30) NOT NULL,
                ordered_at TIMESTAMP WITH TIME ZONE NOT NULL,
                collected_at TIMESTAMP WITH TIME ZONE,
                processing_started_at TIMESTAMP WITH TIME ZONE,
                processing_ended_at TIMESTAMP WITH TIME ZONE,
                approved_at TIMESTAMP WITH TIME ZONE,
                approved_by UUID,
                technician_note TEXT,
                doctor_note TEXT,
                audit_notes TEXT NOT NULL DEFAULT '[]'
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS lab_order_items (
                id UUID PRIMARY KEY,
                order_id UUID NOT NULL REFERENCES lab_orders(id),
                test_code VARCHAR(64) NOT NULL,
                test_name VARCHAR(255) NOT NULL,
                unit VARCHAR(32),
                reference_range_text VARCHAR(255),
                normal_min DOUBLE PRECISION,
                normal_max DOUBLE PRECISION,
                critical_low DOUBLE PRECISION,
                critical_high DOUBLE PRECISION,
                result_value TEXT,
                numeric_result DOUBLE PRECISION,
                flag VARCHAR(20),
                status VARCHAR(20) NOT NULL,
                resulted_at TIMESTAMP WITH TIME ZONE,
                audit_notes TEXT NOT NULL DEFAULT '[]'
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS raw_results (
                id UUID PRIMARY KEY,
                analyzer_id UUID NOT NULL,
                sample_id VARCHAR(64),
                patient_id VARCHAR(64),
                test_code VARCHAR(64),
                value TEXT,
                unit VARCHAR(32),
                flag VARCHAR(16),
                observed_at TIMESTAMP WITH TIME ZONE,
                raw_message TEXT NOT NULL,
                status VARCHAR(20) NOT NULL,
                matched_item_id UUID,
                mapped_at TIMESTAMP WITH TIME ZONE,
                mapped_by UUID,
                received_at TIMESTAMP WITH TIME ZONE NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS critical_alerts (
                id UUID PRIMARY KEY,
                item_id UUID NOT NULL,
                order_id UUID NOT NULL,
                patient_id UUID NOT NULL,
                test_code VARCHAR(64) NOT NULL,
                test_name VARCHAR(255) NOT NULL,
                value TEXT NOT NULL,
                numeric_value DOUBLE PRECISION,
                flag VARCHAR(20) NOT NULL,
                alerted_at TIMESTAMP WITH TIME ZONE NOT NULL,
                status VARCHAR(20) NOT NULL,
                acknowledged_at TIMESTAMP WITH TIME ZONE,
                acknowledged_by UUID
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS qc_lots (
                id UUID PRIMARY KEY,
                analyzer_id UUID NOT NULL,
                test_code VARCHAR(64) NOT NULL,
                level VARCHAR(10) NOT NULL,
                lot_number VARCHAR(64) NOT NULL,
                mean DOUBLE PRECISION NOT NULL,
                sd DOUBLE PRECISION NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS qc_runs (
                id UUID PRIMARY KEY,
                lot_id UUID NOT NULL REFERENCES qc_lots(id),
                analyzer_id UUID NOT NULL,
                test_code VARCHAR(64) NOT NULL,
                level VARCHAR(10) NOT NULL,
                value DOUBLE PRECISION NOT NULL,
                z_score DOUBLE PRECISION NOT NULL,
                cv DOUBLE PRECISION NOT NULL,
                accepted BOOLEAN NOT NULL,
                violated_rule VARCHAR(10),
                run_at TIMESTAMP WITH TIME ZONE NOT NULL,
                performed_by UUID
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS connection_logs (
                id UUID PRIMARY KEY,
                analyzer_id UUID NOT NULL,
                at TIMESTAMP WITH TIME ZONE NOT NULL,
                kind VARCHAR(20) NOT NULL,
                detail TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS worklist_entries (
                id UUID PRIMARY KEY,
                analyzer_id UUID NOT NULL,
                order_id UUID NOT NULL,
                sample_barcode VARCHAR(64),
                test_codes TEXT NOT NULL,
                message_control_id VARCHAR(64) NOT NULL,
                status VARCHAR(20) NOT NULL,
                sent_at TIMESTAMP WITH TIME ZONE,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db)?;
        }

        self.create_indexes().await?;
        tracing::info!("database tables created");
        Ok(())
    }

    /// 建索引
    async fn create_indexes(&self) -> Result<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_orders_barcode ON lab_orders(sample_barcode)",
            "CREATE INDEX IF NOT EXISTS idx_orders_patient ON lab_orders(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_items_order ON lab_order_items(order_id)",
            "CREATE INDEX IF NOT EXISTS idx_items_test_code ON lab_order_items(test_code)",
            "CREATE INDEX IF NOT EXISTS idx_raw_results_status ON raw_results(status)",
            "CREATE INDEX IF NOT EXISTS idx_raw_results_analyzer ON raw_results(analyzer_id)",
            "CREATE INDEX IF NOT EXISTS idx_alerts_status ON critical_alerts(status)",
            "CREATE INDEX IF NOT EXISTS idx_alerts_time ON critical_alerts(alerted_at)",
            "CREATE INDEX IF NOT EXISTS idx_qc_runs_window ON qc_runs(analyzer_id, test_code, run_at)",
            "CREATE INDEX IF NOT EXISTS idx_mappings_analyzer ON test_mappings(analyzer_id)",
            "CREATE INDEX IF NOT EXISTS idx_connection_logs_analyzer ON connection_logs(analyzer_id, at)",
            "CREATE INDEX IF NOT EXISTS idx_worklist_analyzer ON worklist_entries(analyzer_id)",
        ];

        for index in indexes {
            sqlx::query(index).execute(&self.pool).await.map_err(db)?;
        }
        Ok(())
    }

    async fn load_items(&self, order_id: Uuid) -> Result<Vec<LabOrderItem>> {
        let rows = sqlx::query(
            "SELECT * FROM lab_order_items WHERE order_id = $1 ORDER BY test_code",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter().map(map_item_row).collect()
    }

    async fn load_order(&self, order_id: Uuid) -> Result<LabOrder> {
        let row = sqlx::query("SELECT * FROM lab_orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or_else(|| LisError::NotFound(format!("order {} not found", order_id)))?;

        let mut order = map_order_row(&row)?;
        order.items = self.load_items(order_id).await?;
        Ok(order)
    }
}

// ---------- 枚举 <-> 文本 ----------

fn order_status_str(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "Pending",
        OrderStatus::Collected => "Collected",
        OrderStatus::Processing => "Processing",
        OrderStatus::PendingApproval => "PendingApproval",
        OrderStatus::PreliminaryApproved => "PreliminaryApproved",
        OrderStatus::Approved => "Approved",
        OrderStatus::Cancelled => "Cancelled",
    }
}

fn parse_order_status(raw: &str) -> Result<OrderStatus> {
    match raw {
        "Pending" => Ok(OrderStatus::Pending),
        "Collected" => Ok(OrderStatus::Collected),
        "Processing" => Ok(OrderStatus::Processing),
        "PendingApproval" => Ok(OrderStatus::PendingApproval),
        "PreliminaryApproved" => Ok(OrderStatus::PreliminaryApproved),
        "Approved" => Ok(OrderStatus::Approved),
        "Cancelled" => Ok(OrderStatus::Cancelled),
        other => Err(LisError::Database(format!("unknown order status {}", other))),
    }
}

fn item_status_str(status: ItemStatus) -> &'static str {
    match status {
        ItemStatus::Pending => "Pending",
        ItemStatus::HasResult => "HasResult",
        ItemStatus::Approved => "Approved",
    }
}

fn parse_item_status(raw: &str) -> Result<ItemStatus> {
    match raw {
        "Pending" => Ok(ItemStatus::Pending),
        "HasResult" => Ok(ItemStatus::HasResult),
        "Approved" => Ok(ItemStatus::Approved),
        other => Err(LisError::Database(format!("unknown item status {}", other))),
    }
}

fn flag_str(flag: ResultFlag) -> &'static str {
    match flag {
        ResultFlag::Normal => "Normal",
        ResultFlag::Low => "Low",
        ResultFlag::High => "High",
        ResultFlag::CriticalLow => "CriticalLow",
        ResultFlag::CriticalHigh => "CriticalHigh",
    }
}

fn parse_flag(raw: &str) -> Result<ResultFlag> {
    match raw {
        "Normal" => Ok(ResultFlag::Normal),
        "Low" => Ok(ResultFlag::Low),
        "High" => Ok(ResultFlag::High),
        "CriticalLow" => Ok(ResultFlag::CriticalLow),
        "CriticalHigh" => Ok(ResultFlag::CriticalHigh),
        other => Err(LisError::Database(format!("unknown result flag {}", other))),
    }
}

fn raw_status_str(status: RawResultStatus) -> &'static str {
    match status {
        RawResultStatus::Pending => "Pending",
        RawResultStatus::Matched => "Matched",
        RawResultStatus::ManuallyMapped => "ManuallyMapped",
        RawResultStatus::Ignored => "Ignored",
    }
}

fn parse_raw_status(raw: &str) -> Result<RawResultStatus> {
    match raw {
        "Pending" => Ok(RawResultStatus::Pending),
        "Matched" => Ok(RawResultStatus::Matched),
        "ManuallyMapped" => Ok(RawResultStatus::ManuallyMapped),
        "Ignored" => Ok(RawResultStatus::Ignored),
        other => Err(LisError::Database(format!(
            "unknown raw result status {}",
            other
        ))),
    }
}

fn alert_status_str(status: AlertStatus) -> &'static str {
    match status {
        AlertStatus::New => "New",
        AlertStatus::Acknowledged => "Acknowledged",
    }
}

fn parse_alert_status(raw: &str) -> Result<AlertStatus> {
    match raw {
        "New" => Ok(AlertStatus::New),
        "Acknowledged" => Ok(AlertStatus::Acknowledged),
        other => Err(LisError::Database(format!("unknown alert status {}", other))),
    }
}

fn qc_level_str(level: QcLevel) -> &'static str {
    match level {
        QcLevel::Level1 => "Level1",
        QcLevel::Level2 => "Level2",
        QcLevel::Level3 => "Level3",
    }
}

fn parse_qc_level(raw: &str) -> Result<QcLevel> {
    match raw {
        "Level1" => Ok(QcLevel::Level1),
        "Level2" => Ok(QcLevel::Level2),
        "Level3" => Ok(QcLevel::Level3),
        other => Err(LisError::Database(format!("unknown QC level {}", other))),
    }
}

fn protocol_str(protocol: AnalyzerProtocol) -> &'static str {
    match protocol {
        AnalyzerProtocol::Hl7V2 => "Hl7V2",
        AnalyzerProtocol::Astm1394 => "Astm1394",
    }
}

fn parse_protocol(raw: &str) -> Result<AnalyzerProtocol> {
    match raw {
        "Hl7V2" => Ok(AnalyzerProtocol::Hl7V2),
        "Astm1394" => Ok(AnalyzerProtocol::Astm1394),
        other => Err(LisError::Database(format!("unknown protocol {}", other))),
    }
}

fn worklist_status_str(status: WorklistStatus) -> &'static str {
    match status {
        WorklistStatus::Pending => "Pending",
        WorklistStatus::Sent => "Sent",
        WorklistStatus::Acknowledged => "Acknowledged",
        WorklistStatus::Failed => "Failed",
    }
}

fn parse_worklist_status(raw: &str) -> Result<WorklistStatus> {
    match raw {
        "Pending" => Ok(WorklistStatus::Pending),
        "Sent" => Ok(WorklistStatus::Sent),
        "Acknowledged" => Ok(WorklistStatus::Acknowledged),
        "Failed" => Ok(WorklistStatus::Failed),
        other => Err(LisError::Database(format!(
            "unknown worklist status {}",
            other
        ))),
    }
}

fn event_kind_str(kind: ConnectionEventKind) -> &'static str {
    match kind {
        ConnectionEventKind::Connected => "Connected",
        ConnectionEventKind::Disconnected => "Disconnected",
        ConnectionEventKind::Listening => "Listening",
        ConnectionEventKind::DataReceived => "DataReceived",
        ConnectionEventKind::DataSent => "DataSent",
        ConnectionEventKind::Error => "Error",
    }
}

fn parse_event_kind(raw: &str) -> Result<ConnectionEventKind> {
    match raw {
        "Connected" => Ok(ConnectionEventKind::Connected),
        "Disconnected" => Ok(ConnectionEventKind::Disconnected),
        "Listening" => Ok(ConnectionEventKind::Listening),
        "DataReceived" => Ok(ConnectionEventKind::DataReceived),
        "DataSent" => Ok(ConnectionEventKind::DataSent),
        "Error" => Ok(ConnectionEventKind::Error),
        other => Err(LisError::Database(format!("unknown event kind {}", other))),
    }
}

// ---------- 行映射 ----------

fn map_order_row(row: &PgRow) -> Result<LabOrder> {
    let audit_json: String = row.try_get("audit_notes").map_err(db)?;
    Ok(LabOrder {
        id: row.try_get("id").map_err(db)?,
        order_code: row.try_get("order_code").map_err(db)?,
        patient_id: row.try_get("patient_id").map_err(db)?,
        sample_barcode: row.try_get("sample_barcode").map_err(db)?,
        sample_type: row.try_get("sample_type").map_err(db)?,
        status: parse_order_status(row.try_get::<String, _>("status").map_err(db)?.as_str())?,
        ordered_at: row.try_get("ordered_at").map_err(db)?,
        collected_at: row.try_get("collected_at").map_err(db)?,
        processing_started_at: row.try_get("processing_started_at").map_err(db)?,
        processing_ended_at: row.try_get("processing_ended_at").map_err(db)?,
        approved_at: row.try_get("approved_at").map_err(db)?,
        approved_by: row.try_get("approved_by").map_err(db)?,
        technician_note: row.try_get("technician_note").map_err(db)?,
        doctor_note: row.try_get("doctor_note").map_err(db)?,
        audit_notes: serde_json::from_str(&audit_json).unwrap_or_default(),
        items: Vec::new(),
    })
}

fn map_item_row(row: &PgRow) -> Result<LabOrderItem> {
    let audit_json: String = row.try_get("audit_notes").map_err(db)?;
    let flag: Option<String> = row.try_get("flag").map_err(db)?;
    Ok(LabOrderItem {
        id: row.try_get("id").map_err(db)?,
        order_id: row.try_get("order_id").map_err(db)?,
        test_code: row.try_get("test_code").map_err(db)?,
        test_name: row.try_get("test_name").map_err(db)?,
        unit: row.try_get("unit").map_err(db)?,
        reference_range_text: row.try_get("reference_range_text").map_err(db)?,
        bounds: ReferenceBounds {
            normal_min: row.try_get("normal_min").map_err(db)?,
            normal_max: row.try_get("normal_max").map_err(db)?,
            critical_low: row.try_get("critical_low").map_err(db)?,
            critical_high: row.try_get("critical_high").map_err(db)?,
        },
        result_value: row.try_get("result_value").map_err(db)?,
        numeric_result: row.try_get("numeric_result").map_err(db)?,
        flag: flag.as_deref().map(parse_flag).transpose()?,
        status: parse_item_status(row.try_get::<String, _>("status").map_err(db)?.as_str())?,
        resulted_at: row.try_get("resulted_at").map_err(db)?,
        audit_notes: serde_json::from_str(&audit_json).unwrap_or_default(),
    })
}

fn map_analyzer_row(row: &PgRow) -> Result<Analyzer> {
    let connection_json: String = row.try_get("connection").map_err(db)?;
    Ok(Analyzer {
        id: row.try_get("id").map_err(db)?,
        code: row.try_get("code").map_err(db)?,
        name: row.try_get("name").map_err(db)?,
        manufacturer: row.try_get("manufacturer").map_err(db)?,
        model: row.try_get("model").map_err(db)?,
        protocol: parse_protocol(row.try_get::<String, _>("protocol").map_err(db)?.as_str())?,
        connection: serde_json::from_str(&connection_json)?,
        is_active: row.try_get("is_active").map_err(db)?,
        last_connected_at: row.try_get("last_connected_at").map_err(db)?,
        last_data_received_at: row.try_get("last_data_received_at").map_err(db)?,
        created_at: row.try_get("created_at").map_err(db)?,
        updated_at: row.try_get("updated_at").map_err(db)?,
    })
}

fn map_raw_row(row: &PgRow) -> Result<RawResult> {
    Ok(RawResult {
        id: row.try_get("id").map_err(db)?,
        analyzer_id: row.try_get("analyzer_id").map_err(db)?,
        sample_id: row.try_get("sample_id").map_err(db)?,
        patient_id: row.try_get("patient_id").map_err(db)?,
        test_code: row.try_get("test_code").map_err(db)?,
        value: row.try_get("value").map_err(db)?,
        unit: row.try_get("unit").map_err(db)?,
        flag: row.try_get("flag").map_err(db)?,
        observed_at: row.try_get("observed_at").map_err(db)?,
        raw_message: row.try_get("raw_message").map_err(db)?,
        status: parse_raw_status(row.try_get::<String, _>("status").map_err(db)?.as_str())?,
        matched_item_id: row.try_get("matched_item_id").map_err(db)?,
        mapped_at: row.try_get("mapped_at").map_err(db)?,
        mapped_by: row.try_get("mapped_by").map_err(db)?,
        received_at: row.try_get("received_at").map_err(db)?,
    })
}

fn map_alert_row(row: &PgRow) -> Result<CriticalValueAlert> {
    Ok(CriticalValueAlert {
        id: row.try_get("id").map_err(db)?,
        item_id: row.try_get("item_id").map_err(db)?,
        order_id: row.try_get("order_id").map_err(db)?,
        patient_id: row.try_get("patient_id").map_err(db)?,
        test_code: row.try_get("test_code").map_err(db)?,
        test_name: row.try_get("test_name").map_err(db)?,
        value: row.try_get("value").map_err(db)?,
        numeric_value: row.try_get("numeric_value").map_err(db)?,
        flag: parse_flag(row.try_get::<String, _>("flag").map_err(db)?.as_str())?,
        alerted_at: row.try_get("alerted_at").map_err(db)?,
        status: parse_alert_status(row.try_get::<String, _>("status").map_err(db)?.as_str())?,
        acknowledged_at: row.try_get("acknowledged_at").map_err(db)?,
        acknowledged_by: row.try_get("acknowledged_by").map_err(db)?,
    })
}

fn map_qc_lot_row(row: &PgRow) -> Result<QcLot> {
    Ok(QcLot {
        id: row.try_get("id").map_err(db)?,
        analyzer_id: row.try_get("analyzer_id").map_err(db)?,
        test_code: row.try_get("test_code").map_err(db)?,
        level: parse_qc_level(row.try_get::<String, _>("level").map_err(db)?.as_str())?,
        lot_number: row.try_get("lot_number").map_err(db)?,
        mean: row.try_get("mean").map_err(db)?,
        sd: row.try_get("sd").map_err(db)?,
        is_active: row.try_get("is_active").map_err(db)?,
    })
}

fn map_qc_run_row(row: &PgRow) -> Result<QcRun> {
    Ok(QcRun {
        id: row.try_get("id").map_err(db)?,
        lot_id: row.try_get("lot_id").map_err(db)?,
        analyzer_id: row.try_get("analyzer_id").map_err(db)?,
        test_code: row.try_get("test_code").map_err(db)?,
        level: parse_qc_level(row.try_get::<String, _>("level").map_err(db)?.as_str())?,
        value: row.try_get("value").map_err(db)?,
        z_score: row.try_get("z_score").map_err(db)?,
        cv: row.try_get("cv").map_err(db)?,
        accepted: row.try_get("accepted").map_err(db)?,
        violated_rule: row.try_get("violated_rule").map_err(db)?,
        run_at: row.try_get("run_at").map_err(db)?,
        performed_by: row.try_get("performed_by").map_err(db)?,
    })
}

fn map_worklist_row(row: &PgRow) -> Result<WorklistEntry> {
    let codes_json: String = row.try_get("test_codes").map_err(db)?;
    Ok(WorklistEntry {
        id: row.try_get("id").map_err(db)?,
        analyzer_id: row.try_get("analyzer_id").map_err(db)?,
        order_id: row.try_get("order_id").map_err(db)?,
        sample_barcode: row.try_get("sample_barcode").map_err(db)?,
        test_codes: serde_json::from_str(&codes_json).unwrap_or_default(),
        message_control_id: row.try_get("message_control_id").map_err(db)?,
        status: parse_worklist_status(row.try_get::<String, _>("status").map_err(db)?.as_str())?,
        sent_at: row.try_get("sent_at").map_err(db)?,
        retry_count: row.try_get("retry_count").map_err(db)?,
        error_message: row.try_get("error_message").map_err(db)?,
    })
}

#[async_trait]
impl OrderStore for PgStore {
    async fn create_order(&self, order: NewOrder) -> Result<LabOrder> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order_code = format!("LAB{}", &order_id.simple().to_string()[..8].to_uppercase());

        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query(
            r#"
            INSERT INTO lab_orders
                (id, order_code, patient_id, sample_barcode, sample_type, status, ordered_at, audit_notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, '[]')
            "#,
        )
        .bind(order_id)
        .bind(&order_code)
        .bind(order.patient_id)
        .bind(&order.sample_barcode)
        .bind(&order.sample_type)
        .bind(order_status_str(OrderStatus::Pending))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        for item in &order.items {
            sqlx::query(
                r#"
                INSERT INTO lab_order_items
                    (id, order_id, test_code, test_name, unit, reference_range_text,
                     normal_min, normal_max, critical_low, critical_high, status, audit_notes)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, '[]')
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(order_id)
            .bind(&item.test_code)
            .bind(&item.test_name)
            .bind(&item.unit)
            .bind(&item.reference_range_text)
            .bind(item.bounds.normal_min)
            .bind(item.bounds.normal_max)
            .bind(item.bounds.critical_low)
            .bind(item.bounds.critical_high)
            .bind(item_status_str(ItemStatus::Pending))
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        tx.commit().await.map_err(db)?;
        self.load_order(order_id).await
    }

    async fn get_order(&self, order_id: Uuid) -> Result<LabOrder> {
        self.load_order(order_id).await
    }

    async fn find_pending_item(
        &self,
        barcode: &str,
        test_code: &str,
    ) -> Result<Option<PendingItemRef>> {
        let row = sqlx::query(
            r#"
            SELECT i.id AS item_id, i.order_id, o.patient_id, i.test_code, i.test_name,
                   i.normal_min, i.normal_max, i.critical_low, i.critical_high, i.status
            FROM lab_order_items i
            INNER JOIN lab_orders o ON o.id = i.order_id
            WHERE o.sample_barcode = $1
              AND i.test_code = $2
              AND i.status <> 'Approved'
              AND o.status <> 'Cancelled'
            LIMIT 1
            "#,
        )
        .bind(barcode)
        .bind(test_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        Ok(Some(PendingItemRef {
            order_id: row.try_get("order_id").map_err(db)?,
            item_id: row.try_get("item_id").map_err(db)?,
            patient_id: row.try_get("patient_id").map_err(db)?,
            test_code: row.try_get("test_code").map_err(db)?,
            test_name: row.try_get("test_name").map_err(db)?,
            bounds: ReferenceBounds {
                normal_min: row.try_get("normal_min").map_err(db)?,
                normal_max: row.try_get("normal_max").map_err(db)?,
                critical_low: row.try_get("critical_low").map_err(db)?,
                critical_high: row.try_get("critical_high").map_err(db)?,
            },
            status: parse_item_status(row.try_get::<String, _>("status").map_err(db)?.as_str())?,
        }))
    }

    async fn find_item(&self, item_id: Uuid) -> Result<PendingItemRef> {
        let row = sqlx::query(
            r#"
            SELECT i.id AS item_id, i.order_id, o.patient_id, i.test_code, i.test_name,
                   i.normal_min, i.normal_max, i.critical_low, i.critical_high, i.status
            FROM lab_order_items i
            INNER JOIN lab_orders o ON o.id = i.order_id
            WHERE i.id = $1
            "#,
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?
        .ok_or_else(|| LisError::NotFound(format!("order item {} not found", item_id)))?;

        Ok(PendingItemRef {
            order_id: row.try_get("order_id").map_err(db)?,
            item_id: row.try_get("item_id").map_err(db)?,
            patient_id: row.try_get("patient_id").map_err(db)?,
            test_code: row.try_get("test_code").map_err(db)?,
            test_name: row.try_get("test_name").map_err(db)?,
            bounds: ReferenceBounds {
                normal_min: row.try_get("normal_min").map_err(db)?,
                normal_max: row.try_get("normal_max").map_err(db)?,
                critical_low: row.try_get("critical_low").map_err(db)?,
                critical_high: row.try_get("critical_high").map_err(db)?,
            },
            status: parse_item_status(row.try_get::<String, _>("status").map_err(db)?.as_str())?,
        })
    }

    async fn record_result(&self, item_id: Uuid, update: ResultUpdate) -> Result<ResultRecorded> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        // 锁定所属医嘱行, 串行化同医嘱的并发结果写入
        let row = sqlx::query(
            r#"
            SELECT i.order_id, i.status AS item_status, o.patient_id, o.status AS order_status
            FROM lab_order_items i
            INNER JOIN lab_orders o ON o.id = i.order_id
            WHERE i.id = $1
            FOR UPDATE OF o
            "#,
        )
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?
        .ok_or_else(|| LisError::NotFound(format!("order item {} not found", item_id)))?;

        let order_id: Uuid = row.try_get("order_id").map_err(db)?;
        let patient_id: Uuid = row.try_get("patient_id").map_err(db)?;
        let order_status =
            parse_order_status(row.try_get::<String, _>("order_status").map_err(db)?.as_str())?;
        let item_status =
            parse_item_status(row.try_get::<String, _>("item_status").map_err(db)?.as_str())?;

        if order_status == OrderStatus::Cancelled {
            return Err(LisError::InvalidStateTransition {
                from: "Cancelled".to_string(),
                action: "record_result".to_string(),
            });
        }
        if item_status == ItemStatus::Approved {
            return Err(LisError::Validation(format!(
                "item {} is already approved and cannot receive results",
                item_id
            )));
        }

        sqlx::query(
            r#"
            UPDATE lab_order_items
            SET result_value = $2,
                numeric_result = $3,
                flag = $4,
                status = 'HasResult',
                resulted_at = $5,
                unit = COALESCE($6, unit),
                reference_range_text = COALESCE($7, reference_range_text)
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(&update.value)
        .bind(update.numeric)
        .bind(update.flag.map(flag_str))
        .bind(update.resulted_at)
        .bind(&update.unit)
        .bind(&update.reference_range_text)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        // 写后读: 以当前事务内的真实计数重算汇总状态
        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM lab_order_items WHERE order_id = $1 AND status = 'Pending'",
        )
        .bind(order_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db)?;

        let new_status = if matches!(
            order_status,
            OrderStatus::Pending
                | OrderStatus::Collected
                | OrderStatus::Processing
                | OrderStatus::PendingApproval
        ) {
            if pending == 0 {
                OrderStatus::PendingApproval
            } else {
                OrderStatus::Processing
            }
        } else {
            order_status
        };

        sqlx::query(
            r#"
            UPDATE lab_orders
            SET status = $2,
                processing_started_at = COALESCE(processing_started_at, NOW()),
                processing_ended_at = CASE
                    WHEN $2 = 'PendingApproval' AND processing_ended_at IS NULL THEN NOW()
                    ELSE processing_ended_at
                END
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(order_status_str(new_status))
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let item_row = sqlx::query("SELECT * FROM lab_order_items WHERE id = $1")
            .bind(item_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db)?;
        let item = map_item_row(&item_row)?;

        tx.commit().await.map_err(db)?;

        Ok(ResultRecorded {
            order_id,
            patient_id,
            order_status: new_status,
            item,
        })
    }

    async fn preliminary_approve(&self, order_id: Uuid, note: &str) -> Result<LabOrder> {
        let updated = sqlx::query(
            r#"
            UPDATE lab_orders
            SET status = 'PreliminaryApproved', technician_note = $2
            WHERE id = $1 AND status IN ('PendingApproval', 'PreliminaryApproved')
            "#,
        )
        .bind(order_id)
        .bind(note)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if updated.rows_affected() == 0 {
            let order = self.load_order(order_id).await?;
            return Err(LisError::InvalidStateTransition {
                from: format!("{:?}", order.status),
                action: "preliminary_approve".to_string(),
            });
        }
        self.load_order(order_id).await
    }

    async fn final_approve(
        &self,
        order_id: Uuid,
        note: &str,
        actor: Uuid,
    ) -> Result<FinalApprovalOutcome> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let row = sqlx::query("SELECT status FROM lab_orders WHERE id = $1 FOR UPDATE")
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?
            .ok_or_else(|| LisError::NotFound(format!("order {} not found", order_id)))?;
        let status = parse_order_status(row.try_get::<String, _>("status").map_err(db)?.as_str())?;

        if matches!(
            status,
            OrderStatus::Cancelled | OrderStatus::Approved | OrderStatus::Pending
        ) {
            return Err(LisError::InvalidStateTransition {
                from: format!("{:?}", status),
                action: "final_approve".to_string(),
            });
        }

        let approved = sqlx::query(
            "UPDATE lab_order_items SET status = 'Approved' WHERE order_id = $1 AND status = 'HasResult'",
        )
        .bind(order_id)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let missing: Vec<String> = sqlx::query_scalar(
            "SELECT test_code FROM lab_order_items WHERE order_id = $1 AND status = 'Pending'",
        )
        .bind(order_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;

        let order_approved = missing.is_empty();
        if order_approved {
            sqlx::query(
                r#"
                UPDATE lab_orders
                SET status = 'Approved', approved_at = NOW(), approved_by = $2, doctor_note = $3
                WHERE id = $1
                "#,
            )
            .bind(order_id)
            .bind(actor)
            .bind(note)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        tx.commit().await.map_err(db)?;

        Ok(FinalApprovalOutcome {
            approved_items: approved.rows_affected() as usize,
            missing,
            order_approved,
        })
    }

    async fn cancel_approval(&self, order_id: Uuid, reason: &str) -> Result<LabOrder> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query(
            "UPDATE lab_order_items SET status = 'HasResult' WHERE order_id = $1 AND status = 'Approved'",
        )
        .bind(order_id)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let note = serde_json::to_string(&format!("cancel approval: {}", reason))?;
        let updated = sqlx::query(
            r#"
            UPDATE lab_orders
            SET status = 'PendingApproval',
                approved_at = NULL,
                approved_by = NULL,
                audit_notes = LEFT(audit_notes, LENGTH(audit_notes) - 1)
                    || CASE WHEN audit_notes = '[]' THEN '' ELSE ',' END
                    || $2 || ']'
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(&note)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        if updated.rows_affected() == 0 {
            return Err(LisError::NotFound(format!("order {} not found", order_id)));
        }

        tx.commit().await.map_err(db)?;
        self.load_order(order_id).await
    }

    async fn rerun_item(&self, item_id: Uuid, reason: &str) -> Result<LabOrder> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let row = sqlx::query("SELECT order_id, status FROM lab_order_items WHERE id = $1")
            .bind(item_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?
            .ok_or_else(|| LisError::NotFound(format!("order item {} not found", item_id)))?;
        let order_id: Uuid = row.try_get("order_id").map_err(db)?;
        let item_status =
            parse_item_status(row.try_get::<String, _>("status").map_err(db)?.as_str())?;
        if item_status == ItemStatus::Pending {
            return Err(LisError::Validation(format!(
                "item {} has no result to rerun",
                item_id
            )));
        }

        let note = serde_json::to_string(&format!("rerun: {}", reason))?;
        sqlx::query(
            r#"
            UPDATE lab_order_items
            SET result_value = NULL,
                numeric_result = NULL,
                flag = NULL,
                resulted_at = NULL,
                status = 'Pending',
                audit_notes = LEFT(audit_notes, LENGTH(audit_notes) - 1)
                    || CASE WHEN audit_notes = '[]' THEN '' ELSE ',' END
                    || $2 || ']'
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(&note)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        sqlx::query(
            r#"
            UPDATE lab_orders
            SET status = 'Processing',
                processing_ended_at = NULL,
                approved_at = NULL,
                approved_by = NULL
            WHERE id = $1
              AND status IN ('PendingApproval', 'PreliminaryApproved', 'Approved')
            "#,
        )
        .bind(order_id)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;
        self.load_order(order_id).await
    }

    async fn mark_collected(&self, order_id: Uuid, barcode: String) -> Result<LabOrder> {
        let updated = sqlx::query(
            r#"
            UPDATE lab_orders
            SET sample_barcode = $2, collected_at = NOW(), status = 'Collected'
            WHERE id = $1 AND status = 'Pending'
            "#,
        )
        .bind(order_id)
        .bind(&barcode)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if updated.rows_affected() == 0 {
            let order = self.load_order(order_id).await?;
            return Err(LisError::InvalidStateTransition {
                from: format!("{:?}", order.status),
                action: "mark_collected".to_string(),
            });
        }
        self.load_order(order_id).await
    }

    async fn cancel_order(&self, order_id: Uuid, reason: &str) -> Result<LabOrder> {
        let note = serde_json::to_string(&format!("cancelled: {}", reason))?;
        let updated = sqlx::query(
            r#"
            UPDATE lab_orders
            SET status = 'Cancelled',
                audit_notes = LEFT(audit_notes, LENGTH(audit_notes) - 1)
                    || CASE WHEN audit_notes = '[]' THEN '' ELSE ',' END
                    || $2 || ']'
            WHERE id = $1 AND status NOT IN ('Approved', 'Cancelled')
            "#,
        )
        .bind(order_id)
        .bind(&note)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if updated.rows_affected() == 0 {
            let order = self.load_order(order_id).await?;
            return Err(LisError::InvalidStateTransition {
                from: format!("{:?}", order.status),
                action: "cancel_order".to_string(),
            });
        }
        self.load_order(order_id).await
    }

    async fn prior_numeric_result(
        &self,
        patient_id: Uuid,
        test_code: &str,
        exclude_order: Uuid,
    ) -> Result<Option<PriorResult>> {
        let row = sqlx::query(
            r#"
            SELECT i.order_id, i.numeric_result, i.resulted_at
            FROM lab_order_items i
            INNER JOIN lab_orders o ON o.id = i.order_id
            WHERE o.patient_id = $1
              AND i.test_code = $2
              AND i.order_id <> $3
              AND i.numeric_result IS NOT NULL
              AND i.resulted_at IS NOT NULL
              AND o.status <> 'Cancelled'
            ORDER BY i.resulted_at DESC
            LIMIT 1
            "#,
        )
        .bind(patient_id)
        .bind(test_code)
        .bind(exclude_order)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        match row {
            Some(row) => Ok(Some(PriorResult {
                order_id: row.try_get("order_id").map_err(db)?,
                value: row.try_get("numeric_result").map_err(db)?,
                resulted_at: row.try_get("resulted_at").map_err(db)?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RawResultStore for PgStore {
    async fn save_raw(&self, raw: RawResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO raw_results
                (id, analyzer_id, sample_id, patient_id, test_code, value, unit, flag,
                 observed_at, raw_message, status, matched_item_id, mapped_at, mapped_by, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(raw.id)
        .bind(raw.analyzer_id)
        .bind(&raw.sample_id)
        .bind(&raw.patient_id)
        .bind(&raw.test_code)
        .bind(&raw.value)
        .bind(&raw.unit)
        .bind(&raw.flag)
        .bind(raw.observed_at)
        .bind(&raw.raw_message)
        .bind(raw_status_str(raw.status))
        .bind(raw.matched_item_id)
        .bind(raw.mapped_at)
        .bind(raw.mapped_by)
        .bind(raw.received_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn get_raw(&self, raw_id: Uuid) -> Result<RawResult> {
        let row = sqlx::query("SELECT * FROM raw_results WHERE id = $1")
            .bind(raw_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or_else(|| LisError::NotFound(format!("raw result {} not found", raw_id)))?;
        map_raw_row(&row)
    }

    async fn list_unmatched(&self, analyzer_id: Option<Uuid>) -> Result<Vec<RawResult>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM raw_results
            WHERE status = 'Pending' AND ($1::uuid IS NULL OR analyzer_id = $1)
            ORDER BY received_at DESC
            LIMIT 500
            "#,
        )
        .bind(analyzer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter().map(map_raw_row).collect()
    }

    async fn mark_mapped(
        &self,
        raw_id: Uuid,
        item_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<RawResult> {
        let updated = sqlx::query(
            r#"
            UPDATE raw_results
            SET status = 'ManuallyMapped', matched_item_id = $2, mapped_at = NOW(), mapped_by = $3
            WHERE id = $1
            "#,
        )
        .bind(raw_id)
        .bind(item_id)
        .bind(actor)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if updated.rows_affected() == 0 {
            return Err(LisError::NotFound(format!("raw result {} not found", raw_id)));
        }
        self.get_raw(raw_id).await
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn create_alert(&self, alert: CriticalValueAlert) -> Result<CriticalValueAlert> {
        sqlx::query(
            r#"
            INSERT INTO critical_alerts
                (id, item_id, order_id, patient_id, test_code, test_name, value,
                 numeric_value, flag, alerted_at, status, acknowledged_at, acknowledged_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(alert.id)
        .bind(alert.item_id)
        .bind(alert.order_id)
        .bind(alert.patient_id)
        .bind(&alert.test_code)
        .bind(&alert.test_name)
        .bind(&alert.value)
        .bind(alert.numeric_value)
        .bind(flag_str(alert.flag))
        .bind(alert.alerted_at)
        .bind(alert_status_str(alert.status))
        .bind(alert.acknowledged_at)
        .bind(alert.acknowledged_by)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(alert)
    }

    async fn get_alert(&self, alert_id: Uuid) -> Result<CriticalValueAlert> {
        let row = sqlx::query("SELECT * FROM critical_alerts WHERE id = $1")
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or_else(|| LisError::NotFound(format!("alert {} not found", alert_id)))?;
        map_alert_row(&row)
    }

    async fn acknowledge(&self, alert_id: Uuid, actor: Uuid) -> Result<CriticalValueAlert> {
        // 只更新未确认的警报, 重复确认自然成为无操作
        sqlx::query(
            r#"
            UPDATE critical_alerts
            SET status = 'Acknowledged', acknowledged_at = NOW(), acknowledged_by = $2
            WHERE id = $1 AND status = 'New'
            "#,
        )
        .bind(alert_id)
        .bind(actor)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        self.get_alert(alert_id).await
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<CriticalValueAlert>> {
        let status = filter.acknowledged.map(|acked| {
            if acked {
                "Acknowledged"
            } else {
                "New"
            }
        });
        let rows = sqlx::query(
            r#"
            SELECT * FROM critical_alerts
            WHERE ($1::varchar IS NULL OR status = $1)
              AND ($2::timestamptz IS NULL OR alerted_at >= $2)
              AND ($3::timestamptz IS NULL OR alerted_at <= $3)
            ORDER BY alerted_at DESC
            LIMIT 500
            "#,
        )
        .bind(status)
        .bind(filter.from)
        .bind(filter.to)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter().map(map_alert_row).collect()
    }
}

#[async_trait]
impl QcStore for PgStore {
    async fn upsert_lot(&self, lot: QcLot) -> Result<QcLot> {
        sqlx::query(
            r#"
            INSERT INTO qc_lots (id, analyzer_id, test_code, level, lot_number, mean, sd, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET lot_number = $5, mean = $6, sd = $7, is_active = $8
            "#,
        )
        .bind(lot.id)
        .bind(lot.analyzer_id)
        .bind(&lot.test_code)
        .bind(qc_level_str(lot.level))
        .bind(&lot.lot_number)
        .bind(lot.mean)
        .bind(lot.sd)
        .bind(lot.is_active)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(lot)
    }

    async fn get_lot(&self, lot_id: Uuid) -> Result<QcLot> {
        let row = sqlx::query("SELECT * FROM qc_lots WHERE id = $1")
            .bind(lot_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or_else(|| LisError::NotFound(format!("QC lot {} not found", lot_id)))?;
        map_qc_lot_row(&row)
    }

    async fn find_lot(
        &self,
        analyzer_id: Uuid,
        test_code: &str,
        level: QcLevel,
    ) -> Result<Option<QcLot>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM qc_lots
            WHERE analyzer_id = $1 AND test_code = $2 AND level = $3 AND is_active
            LIMIT 1
            "#,
        )
        .bind(analyzer_id)
        .bind(test_code)
        .bind(qc_level_str(level))
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        row.as_ref().map(map_qc_lot_row).transpose()
    }

    async fn save_run(&self, run: QcRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO qc_runs
                (id, lot_id, analyzer_id, test_code, level, value, z_score, cv,
                 accepted, violated_rule, run_at, performed_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(run.id)
        .bind(run.lot_id)
        .bind(run.analyzer_id)
        .bind(&run.test_code)
        .bind(qc_level_str(run.level))
        .bind(run.value)
        .bind(run.z_score)
        .bind(run.cv)
        .bind(run.accepted)
        .bind(&run.violated_rule)
        .bind(run.run_at)
        .bind(run.performed_by)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn list_runs(
        &self,
        test_code: &str,
        analyzer_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<QcRun>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM qc_runs
            WHERE test_code = $1 AND analyzer_id = $2 AND run_at BETWEEN $3 AND $4
            ORDER BY run_at ASC
            "#,
        )
        .bind(test_code)
        .bind(analyzer_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter().map(map_qc_run_row).collect()
    }
}

#[async_trait]
impl AnalyzerStore for PgStore {
    async fn create_analyzer(&self, spec: AnalyzerSpec) -> Result<Analyzer> {
        let id = Uuid::new_v4();
        let connection = serde_json::to_string(&spec.connection)?;
        sqlx::query(
            r#"
            INSERT INTO analyzers (id, code, name, manufacturer, model, protocol, connection, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(&spec.code)
        .bind(&spec.name)
        .bind(&spec.manufacturer)
        .bind(&spec.model)
        .bind(protocol_str(spec.protocol))
        .bind(&connection)
        .bind(spec.is_active)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        self.get_analyzer(id).await
    }

    async fn update_analyzer(&self, analyzer_id: Uuid, spec: AnalyzerSpec) -> Result<Analyzer> {
        let connection = serde_json::to_string(&spec.connection)?;
        let updated = sqlx::query(
            r#"
            UPDATE analyzers
            SET code = $2, name = $3, manufacturer = $4, model = $5,
                protocol = $6, connection = $7, is_active = $8, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(analyzer_id)
        .bind(&spec.code)
        .bind(&spec.name)
        .bind(&spec.manufacturer)
        .bind(&spec.model)
        .bind(protocol_str(spec.protocol))
        .bind(&connection)
        .bind(spec.is_active)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if updated.rows_affected() == 0 {
            return Err(LisError::NotFound(format!(
                "analyzer {} not found",
                analyzer_id
            )));
        }
        self.get_analyzer(analyzer_id).await
    }

    async fn deactivate_analyzer(&self, analyzer_id: Uuid) -> Result<Analyzer> {
        let updated =
            sqlx::query("UPDATE analyzers SET is_active = FALSE, updated_at = NOW() WHERE id = $1")
                .bind(analyzer_id)
                .execute(&self.pool)
                .await
                .map_err(db)?;

        if updated.rows_affected() == 0 {
            return Err(LisError::NotFound(format!(
                "analyzer {} not found",
                analyzer_id
            )));
        }
        self.get_analyzer(analyzer_id).await
    }

    async fn get_analyzer(&self, analyzer_id: Uuid) -> Result<Analyzer> {
        let row = sqlx::query("SELECT * FROM analyzers WHERE id = $1")
            .bind(analyzer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or_else(|| LisError::NotFound(format!("analyzer {} not found", analyzer_id)))?;
        map_analyzer_row(&row)
    }

    async fn list_analyzers(&self, include_inactive: bool) -> Result<Vec<Analyzer>> {
        let rows = sqlx::query(
            "SELECT * FROM analyzers WHERE ($1 OR is_active) ORDER BY name",
        )
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter().map(map_analyzer_row).collect()
    }

    async fn set_mappings(
        &self,
        analyzer_id: Uuid,
        mappings: Vec<NewTestMapping>,
    ) -> Result<Vec<TestMapping>> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query("DELETE FROM test_mappings WHERE analyzer_id = $1")
            .bind(analyzer_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

        for mapping in &mappings {
            sqlx::query(
                r#"
                INSERT INTO test_mappings
                    (id, analyzer_id, analyzer_test_code, analyzer_test_name,
                     his_test_code, his_test_name, conversion_factor, is_active)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(analyzer_id)
            .bind(&mapping.analyzer_test_code)
            .bind(&mapping.analyzer_test_name)
            .bind(&mapping.his_test_code)
            .bind(&mapping.his_test_name)
            .bind(mapping.conversion_factor)
            .bind(mapping.is_active)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        tx.commit().await.map_err(db)?;
        self.mappings_for(analyzer_id).await
    }

    async fn mappings_for(&self, analyzer_id: Uuid) -> Result<Vec<TestMapping>> {
        let rows = sqlx::query("SELECT * FROM test_mappings WHERE analyzer_id = $1")
            .bind(analyzer_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;

        rows.iter()
            .map(|row| {
                Ok(TestMapping {
                    id: row.try_get("id").map_err(db)?,
                    analyzer_id: row.try_get("analyzer_id").map_err(db)?,
                    analyzer_test_code: row.try_get("analyzer_test_code").map_err(db)?,
                    analyzer_test_name: row.try_get("analyzer_test_name").map_err(db)?,
                    his_test_code: row.try_get("his_test_code").map_err(db)?,
                    his_test_name: row.try_get("his_test_name").map_err(db)?,
                    conversion_factor: row.try_get("conversion_factor").map_err(db)?,
                    is_active: row.try_get("is_active").map_err(db)?,
                })
            })
            .collect()
    }

    async fn touch_connected(&self, analyzer_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE analyzers SET last_connected_at = NOW() WHERE id = $1")
            .bind(analyzer_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn touch_data_received(&self, analyzer_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE analyzers SET last_data_received_at = NOW() WHERE id = $1")
            .bind(analyzer_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn append_connection_log(&self, entry: ConnectionLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO connection_logs (id, analyzer_id, at, kind, detail) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entry.id)
        .bind(entry.analyzer_id)
        .bind(entry.at)
        .bind(event_kind_str(entry.kind))
        .bind(&entry.detail)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn list_connection_logs(
        &self,
        analyzer_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ConnectionLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM connection_logs
            WHERE analyzer_id = $1 AND at BETWEEN $2 AND $3
            ORDER BY at DESC
            LIMIT 500
            "#,
        )
        .bind(analyzer_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter()
            .map(|row| {
                Ok(ConnectionLogEntry {
                    id: row.try_get("id").map_err(db)?,
                    analyzer_id: row.try_get("analyzer_id").map_err(db)?,
                    at: row.try_get("at").map_err(db)?,
                    kind: parse_event_kind(row.try_get::<String, _>("kind").map_err(db)?.as_str())?,
                    detail: row.try_get("detail").map_err(db)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl WorklistStore for PgStore {
    async fn save_entry(&self, entry: WorklistEntry) -> Result<()> {
        let codes = serde_json::to_string(&entry.test_codes)?;
        sqlx::query(
            r#"
            INSERT INTO worklist_entries
                (id, analyzer_id, order_id, sample_barcode, test_codes,
                 message_control_id, status, sent_at, retry_count, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE
            SET status = $7, sent_at = $8, retry_count = $9, error_message = $10
            "#,
        )
        .bind(entry.id)
        .bind(entry.analyzer_id)
        .bind(entry.order_id)
        .bind(&entry.sample_barcode)
        .bind(&codes)
        .bind(&entry.message_control_id)
        .bind(worklist_status_str(entry.status))
        .bind(entry.sent_at)
        .bind(entry.retry_count)
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn get_entry(&self, entry_id: Uuid) -> Result<WorklistEntry> {
        let row = sqlx::query("SELECT * FROM worklist_entries WHERE id = $1")
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or_else(|| LisError::NotFound(format!("worklist entry {} not found", entry_id)))?;
        map_worklist_row(&row)
    }

    async fn update_status(
        &self,
        entry_id: Uuid,
        status: WorklistStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE worklist_entries
            SET status = $2,
                error_message = $3,
                sent_at = CASE
                    WHEN $2 IN ('Sent', 'Acknowledged') AND sent_at IS NULL THEN NOW()
                    ELSE sent_at
                END
            WHERE id = $1
            "#,
        )
        .bind(entry_id)
        .bind(worklist_status_str(status))
        .bind(&error_message)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if updated.rows_affected() == 0 {
            return Err(LisError::NotFound(format!(
                "worklist entry {} not found",
                entry_id
            )));
        }
        Ok(())
    }

    async fn list_for_analyzer(&self, analyzer_id: Uuid) -> Result<Vec<WorklistEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM worklist_entries WHERE analyzer_id = $1 ORDER BY sent_at DESC NULLS LAST",
        )
        .bind(analyzer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter().map(map_worklist_row).collect()
    }
}
