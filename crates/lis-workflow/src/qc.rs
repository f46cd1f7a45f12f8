//! 质控引擎 (Westgard规则 / Levey-Jennings图)
//!
//! 质控流水线独立于患者结果流水线, 由人工提交的质控测定驱动。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lis_core::{LisError, QcLevel, QcRun, Result};
use lis_store::QcStore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Levey-Jennings控制图数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeveyJenningsChart {
    pub test_code: String,
    pub analyzer_id: Uuid,
    pub mean: f64,
    pub sd: f64,
    pub plus_1sd: f64,
    pub plus_2sd: f64,
    pub plus_3sd: f64,
    pub minus_1sd: f64,
    pub minus_2sd: f64,
    pub minus_3sd: f64,
    pub points: Vec<QcPoint>,
}

/// 控制图上的单个质控点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcPoint {
    pub run_at: DateTime<Utc>,
    pub value: f64,
    pub level: QcLevel,
    pub accepted: bool,
    pub violated_rule: Option<String>,
}

/// 质控引擎
pub struct QcEngine {
    qc: Arc<dyn QcStore>,
}

impl QcEngine {
    /// 创建质控引擎
    pub fn new(qc: Arc<dyn QcStore>) -> Self {
        Self { qc }
    }

    /// 提交一次质控测定并执行接受/拒绝判定
    ///
    /// 规则优先级: |z| > 3 → 拒绝("1-3s"); |z| > 2 → 接受但警告("1-2s");
    /// 其余干净接受。
    pub async fn run_qc(
        &self,
        analyzer_id: Uuid,
        lot_id: Uuid,
        level: QcLevel,
        value: f64,
        run_at: DateTime<Utc>,
        performed_by: Option<Uuid>,
    ) -> Result<QcRun> {
        let lot = self.qc.get_lot(lot_id).await?;

        if lot.analyzer_id != analyzer_id {
            return Err(LisError::Validation(format!(
                "QC lot {} does not belong to analyzer {}",
                lot_id, analyzer_id
            )));
        }
        if lot.level != level {
            return Err(LisError::Validation(format!(
                "QC lot {} is {:?}, got {:?}",
                lot_id, lot.level, level
            )));
        }
        if lot.sd <= 0.0 {
            return Err(LisError::Validation(format!(
                "QC lot {} has non-positive SD",
                lot_id
            )));
        }

        let z_score = (value - lot.mean) / lot.sd;
        let (accepted, violated_rule) = if z_score.abs() > 3.0 {
            (false, Some("1-3s".to_string()))
        } else if z_score.abs() > 2.0 {
            (true, Some("1-2s".to_string()))
        } else {
            (true, None)
        };

        let run = QcRun {
            id: Uuid::new_v4(),
            lot_id,
            analyzer_id,
            test_code: lot.test_code.clone(),
            level,
            value,
            z_score,
            cv: (lot.sd / lot.mean) * 100.0,
            accepted,
            violated_rule: violated_rule.clone(),
            run_at,
            performed_by,
        };

        self.qc.save_run(run.clone()).await?;

        match (&violated_rule, accepted) {
            (Some(rule), false) => tracing::warn!(
                "QC run rejected for {} on analyzer {}: value={}, z={:.2}, rule={}",
                lot.test_code,
                analyzer_id,
                value,
                z_score,
                rule
            ),
            (Some(rule), true) => tracing::warn!(
                "QC run accepted with warning for {} on analyzer {}: z={:.2}, rule={}",
                lot.test_code,
                analyzer_id,
                z_score,
                rule
            ),
            _ => tracing::info!(
                "QC run accepted for {} on analyzer {}: z={:.2}",
                lot.test_code,
                analyzer_id,
                z_score
            ),
        }

        Ok(run)
    }

    /// 生成Levey-Jennings控制图
    pub async fn levey_jennings(
        &self,
        test_code: &str,
        analyzer_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<LeveyJenningsChart> {
        let lot = self.find_active_lot(analyzer_id, test_code).await?;

        let runs = self.qc.list_runs(test_code, analyzer_id, from, to).await?;
        let points = runs
            .into_iter()
            .map(|run| QcPoint {
                run_at: run.run_at,
                value: run.value,
                level: run.level,
                accepted: run.accepted,
                violated_rule: run.violated_rule,
            })
            .collect();

        Ok(LeveyJenningsChart {
            test_code: test_code.to_string(),
            analyzer_id,
            mean: lot.mean,
            sd: lot.sd,
            plus_1sd: lot.mean + lot.sd,
            plus_2sd: lot.mean + 2.0 * lot.sd,
            plus_3sd: lot.mean + 3.0 * lot.sd,
            minus_1sd: lot.mean - lot.sd,
            minus_2sd: lot.mean - 2.0 * lot.sd,
            minus_3sd: lot.mean - 3.0 * lot.sd,
            points,
        })
    }

    async fn find_active_lot(
        &self,
        analyzer_id: Uuid,
        test_code: &str,
    ) -> Result<lis_core::QcLot> {
        for level in [QcLevel::Level1, QcLevel::Level2, QcLevel::Level3] {
            if let Some(lot) = self.qc.find_lot(analyzer_id, test_code, level).await? {
                return Ok(lot);
            }
        }
        Err(LisError::NotFound(format!(
            "no active QC lot for test {} on analyzer {}",
            test_code, analyzer_id
        )))
    }
}
