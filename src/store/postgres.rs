//! Postgres-backed [`StateStore`] implementation.
//!
//! Schema (§6 "Outbound: state store schema"):
//!
//! ```sql
//! alert_issues(id PK, level, title, labels json, alert_since ts, resolved_at ts?,
//!              alert_state enum, state enum)
//! alert_issue_comments(issue_id, create_at ts, content text)
//! service_states(service, version, report_at ts?, resolved_at ts?, health_state enum,
//!                alert_issue_ids array)  -- primary key (service, version)
//! alert_rules(name PK, description, expr, op, severity, watch_time)
//! alert_rule_metas(alert_name, labels jsonb, threshold numeric, watch_time interval?,
//!                  updated_at ts)  -- primary key (alert_name, labels)
//! alert_meta_change_logs(id PK, change_type, change_time ts, alert_name, labels,
//!                        old_threshold?, new_threshold?, old_watch?, new_watch?)
//! heal_actions(id PK, desc, type, rules json)
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, PgPool};

use crate::config::PostgresStoreConfig;
use crate::model::{
    parse_labels_tolerant, AlertIssue, AlertLevel, AlertRule, AlertRuleMeta, AlertState,
    AlertStatus, ChangeLog, ChangeType, ComparisonOp, HealAction, Labels, ServiceState,
};
use crate::{ControlPlaneError, Result};

use super::StateStore;

#[derive(Debug, Clone, FromRow)]
struct AlertIssueRow {
    id: String,
    level: String,
    title: String,
    labels: SqlJson<serde_json::Value>,
    alert_since: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    alert_state: String,
    state: String,
}

impl TryFrom<AlertIssueRow> for AlertIssue {
    type Error = ControlPlaneError;

    fn try_from(row: AlertIssueRow) -> Result<Self> {
        Ok(AlertIssue {
            id: row.id,
            level: parse_level(&row.level)?,
            title: row.title,
            labels: parse_labels_tolerant(&row.labels.0),
            alert_since: row.alert_since,
            resolved_at: row.resolved_at,
            alert_state: parse_alert_state(&row.alert_state)?,
            state: parse_alert_status(&row.state)?,
        })
    }
}

fn parse_level(s: &str) -> Result<AlertLevel> {
    match s {
        "P0" => Ok(AlertLevel::P0),
        "P1" => Ok(AlertLevel::P1),
        "P2" => Ok(AlertLevel::P2),
        other => Err(ControlPlaneError::Invalid(format!("unknown alert level: {other}"))),
    }
}

fn parse_alert_state(s: &str) -> Result<AlertState> {
    match s {
        "Pending" => Ok(AlertState::Pending),
        "InProcessing" => Ok(AlertState::InProcessing),
        "Restored" => Ok(AlertState::Restored),
        other => Err(ControlPlaneError::Invalid(format!("unknown alert state: {other}"))),
    }
}

fn parse_alert_status(s: &str) -> Result<AlertStatus> {
    match s {
        "Open" => Ok(AlertStatus::Open),
        "Closed" => Ok(AlertStatus::Closed),
        other => Err(ControlPlaneError::Invalid(format!("unknown alert status: {other}"))),
    }
}

fn level_str(level: AlertLevel) -> &'static str {
    match level {
        AlertLevel::P0 => "P0",
        AlertLevel::P1 => "P1",
        AlertLevel::P2 => "P2",
    }
}

fn alert_state_str(state: AlertState) -> &'static str {
    match state {
        AlertState::Pending => "Pending",
        AlertState::InProcessing => "InProcessing",
        AlertState::Restored => "Restored",
    }
}

fn alert_status_str(status: AlertStatus) -> &'static str {
    match status {
        AlertStatus::Open => "Open",
        AlertStatus::Closed => "Closed",
    }
}

fn op_str(op: ComparisonOp) -> &'static str {
    match op {
        ComparisonOp::Gt => ">",
        ComparisonOp::Lt => "<",
        ComparisonOp::Eq => "=",
        ComparisonOp::Ne => "!=",
    }
}

fn parse_op(s: &str) -> Result<ComparisonOp> {
    match s {
        ">" => Ok(ComparisonOp::Gt),
        "<" => Ok(ComparisonOp::Lt),
        "=" => Ok(ComparisonOp::Eq),
        "!=" => Ok(ComparisonOp::Ne),
        other => Err(ControlPlaneError::Invalid(format!("unknown comparison op: {other}"))),
    }
}

#[derive(Debug, Clone, FromRow)]
struct AlertRuleRow {
    name: String,
    description: String,
    expr: String,
    op: String,
    severity: String,
    watch_time_secs: i64,
}

#[derive(Debug, Clone, FromRow)]
struct AlertRuleMetaRow {
    alert_name: String,
    labels: SqlJson<Labels>,
    threshold: f64,
    watch_time_secs: Option<i64>,
    updated_at: DateTime<Utc>,
}

impl From<AlertRuleMetaRow> for AlertRuleMeta {
    fn from(row: AlertRuleMetaRow) -> Self {
        AlertRuleMeta {
            alert_name: row.alert_name,
            labels: row.labels.0,
            threshold: row.threshold,
            watch_time: row.watch_time_secs.map(|s| std::time::Duration::from_secs(s.max(0) as u64)),
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct ServiceStateRow {
    service: String,
    version: String,
    report_at: Option<DateTime<Utc>>,
    resolved_at: Option<DateTime<Utc>>,
    health_state: String,
    alert_issue_ids: Vec<String>,
}

fn health_state_str(h: crate::model::HealthState) -> &'static str {
    match h {
        crate::model::HealthState::Normal => "Normal",
        crate::model::HealthState::Warning => "Warning",
        crate::model::HealthState::Error => "Error",
    }
}

fn parse_health_state(s: &str) -> Result<crate::model::HealthState> {
    match s {
        "Normal" => Ok(crate::model::HealthState::Normal),
        "Warning" => Ok(crate::model::HealthState::Warning),
        "Error" => Ok(crate::model::HealthState::Error),
        other => Err(ControlPlaneError::Invalid(format!("unknown health state: {other}"))),
    }
}

impl TryFrom<ServiceStateRow> for ServiceState {
    type Error = ControlPlaneError;

    fn try_from(row: ServiceStateRow) -> Result<Self> {
        Ok(ServiceState {
            service: row.service,
            version: row.version,
            health_state: parse_health_state(&row.health_state)?,
            report_at: row.report_at,
            resolved_at: row.resolved_at,
            alert_issue_ids: row.alert_issue_ids,
        })
    }
}

fn change_type_str(t: ChangeType) -> &'static str {
    match t {
        ChangeType::Create => "Create",
        ChangeType::Update => "Update",
        ChangeType::Delete => "Delete",
        ChangeType::Rollback => "Rollback",
    }
}

/// Postgres-backed implementation of [`StateStore`].
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(config: &PostgresStoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.connection_string())
            .await
            .map_err(|e| ControlPlaneError::Unavailable(format!("postgres connect: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PostgresStore {
    async fn fetch_pending_alerts(&self, batch: usize) -> Result<Vec<AlertIssue>> {
        let rows: Vec<AlertIssueRow> = sqlx::query_as(
            "SELECT id, level, title, labels, alert_since, resolved_at, alert_state, state
             FROM alert_issues
             WHERE alert_state = 'Pending'
             ORDER BY alert_since ASC
             LIMIT $1",
        )
        .bind(batch as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AlertIssue::try_from).collect()
    }

    async fn fetch_non_terminal_alerts(&self) -> Result<Vec<AlertIssue>> {
        let rows: Vec<AlertIssueRow> = sqlx::query_as(
            "SELECT id, level, title, labels, alert_since, resolved_at, alert_state, state
             FROM alert_issues
             WHERE alert_state IN ('InProcessing', 'Pending')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AlertIssue::try_from).collect()
    }

    async fn get_alert(&self, id: &str) -> Result<AlertIssue> {
        let row: AlertIssueRow = sqlx::query_as(
            "SELECT id, level, title, labels, alert_since, resolved_at, alert_state, state
             FROM alert_issues WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ControlPlaneError::NotFound(format!("alert_issues id={id}")))?;
        row.try_into()
    }

    async fn upsert_alert(&self, alert: &AlertIssue) -> Result<()> {
        sqlx::query(
            "INSERT INTO alert_issues (id, level, title, labels, alert_since, resolved_at, alert_state, state)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO UPDATE SET
                level = EXCLUDED.level, title = EXCLUDED.title, labels = EXCLUDED.labels,
                alert_since = EXCLUDED.alert_since, resolved_at = EXCLUDED.resolved_at,
                alert_state = EXCLUDED.alert_state, state = EXCLUDED.state",
        )
        .bind(&alert.id)
        .bind(level_str(alert.level))
        .bind(&alert.title)
        .bind(SqlJson(&alert.labels))
        .bind(alert.alert_since)
        .bind(alert.resolved_at)
        .bind(alert_state_str(alert.alert_state))
        .bind(alert_status_str(alert.state))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_comment(&self, issue_id: &str, content: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO alert_issue_comments (issue_id, create_at, content)
             SELECT $1, now(), $2
             WHERE NOT EXISTS (
                SELECT 1 FROM alert_issue_comments WHERE issue_id = $1 AND content = $2
             )",
        )
        .bind(issue_id)
        .bind(content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_service_state(&self, state: &ServiceState) -> Result<()> {
        sqlx::query(
            "INSERT INTO service_states (service, version, report_at, resolved_at, health_state, alert_issue_ids)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (service, version) DO UPDATE SET
                report_at = EXCLUDED.report_at, resolved_at = EXCLUDED.resolved_at,
                health_state = EXCLUDED.health_state, alert_issue_ids = EXCLUDED.alert_issue_ids",
        )
        .bind(&state.service)
        .bind(&state.version)
        .bind(state.report_at)
        .bind(state.resolved_at)
        .bind(health_state_str(state.health_state))
        .bind(&state.alert_issue_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_service_state(&self, service: &str, version: &str) -> Result<ServiceState> {
        let row: ServiceStateRow = sqlx::query_as(
            "SELECT service, version, report_at, resolved_at, health_state, alert_issue_ids
             FROM service_states WHERE service = $1 AND version = $2",
        )
        .bind(service)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ControlPlaneError::NotFound(format!("service_states {service}:{version}")))?;
        row.try_into()
    }

    async fn fetch_all_rules(&self) -> Result<Vec<AlertRule>> {
        let rows: Vec<AlertRuleRow> = sqlx::query_as(
            "SELECT name, description, expr, op, severity, watch_time_secs FROM alert_rules",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(AlertRule {
                    name: r.name,
                    description: r.description,
                    expr: r.expr,
                    op: parse_op(&r.op)?,
                    severity: parse_level(&r.severity)?,
                    watch_time: std::time::Duration::from_secs(r.watch_time_secs.max(0) as u64),
                })
            })
            .collect()
    }

    async fn create_rule(&self, rule: &AlertRule) -> Result<()> {
        sqlx::query(
            "INSERT INTO alert_rules (name, description, expr, op, severity, watch_time_secs)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (name) DO UPDATE SET
                description = EXCLUDED.description, expr = EXCLUDED.expr, op = EXCLUDED.op,
                severity = EXCLUDED.severity, watch_time_secs = EXCLUDED.watch_time_secs",
        )
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(&rule.expr)
        .bind(op_str(rule.op))
        .bind(level_str(rule.severity))
        .bind(rule.watch_time.as_secs() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_rule(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM alert_rules WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_all_metas(&self) -> Result<Vec<AlertRuleMeta>> {
        let rows: Vec<AlertRuleMetaRow> = sqlx::query_as(
            "SELECT alert_name, labels, threshold, watch_time_secs, updated_at FROM alert_rule_metas",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn fetch_metas_by_service(&self, service: &str) -> Result<Vec<AlertRuleMeta>> {
        let containment = serde_json::json!({ "service": service });
        let rows: Vec<AlertRuleMetaRow> = sqlx::query_as(
            "SELECT alert_name, labels, threshold, watch_time_secs, updated_at
             FROM alert_rule_metas WHERE labels @> $1",
        )
        .bind(containment)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn fetch_meta_exact(&self, alert_name: &str, canonical_labels: &str) -> Result<AlertRuleMeta> {
        self.fetch_meta_opt(alert_name, canonical_labels)
            .await?
            .ok_or_else(|| {
                ControlPlaneError::NotFound(format!("alert_rule_metas {alert_name}/{canonical_labels}"))
            })
    }

    async fn fetch_meta_opt(
        &self,
        alert_name: &str,
        canonical_labels: &str,
    ) -> Result<Option<AlertRuleMeta>> {
        let row: Option<AlertRuleMetaRow> = sqlx::query_as(
            "SELECT alert_name, labels, threshold, watch_time_secs, updated_at
             FROM alert_rule_metas
             WHERE alert_name = $1 AND canonical_labels = $2",
        )
        .bind(alert_name)
        .bind(canonical_labels)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn upsert_meta_and_log(
        &self,
        meta: &AlertRuleMeta,
        canonical_labels: &str,
        log: ChangeLog,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO alert_rule_metas (alert_name, labels, canonical_labels, threshold, watch_time_secs, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (alert_name, canonical_labels) DO UPDATE SET
                labels = EXCLUDED.labels, threshold = EXCLUDED.threshold,
                watch_time_secs = EXCLUDED.watch_time_secs, updated_at = EXCLUDED.updated_at",
        )
        .bind(&meta.alert_name)
        .bind(SqlJson(&meta.labels))
        .bind(canonical_labels)
        .bind(meta.threshold)
        .bind(meta.watch_time.map(|d| d.as_secs() as i64))
        .bind(meta.updated_at)
        .execute(&mut *tx)
        .await?;

        insert_change_log_tx(&mut tx, &log).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_change_log(&self, log: ChangeLog) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_change_log_tx(&mut tx, &log).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_heal_action(&self, fault_domain: &str) -> Result<HealAction> {
        #[derive(FromRow)]
        struct Row {
            id: String,
            #[sqlx(rename = "type")]
            fault_domain: String,
            desc: String,
            rules: serde_json::Value,
        }
        let row: Row = sqlx::query_as(
            "SELECT id, type, desc, rules FROM heal_actions WHERE type = $1 LIMIT 1",
        )
        .bind(fault_domain)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ControlPlaneError::NotFound(format!("heal_actions type={fault_domain}")))?;
        Ok(HealAction {
            id: row.id,
            fault_domain: row.fault_domain,
            desc: row.desc,
            rules: row.rules,
        })
    }

    async fn insert_rule_if_absent(&self, rule: &AlertRule) -> Result<()> {
        sqlx::query(
            "INSERT INTO alert_rules (name, description, expr, op, severity, watch_time_secs)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(&rule.expr)
        .bind(op_str(rule.op))
        .bind(level_str(rule.severity))
        .bind(rule.watch_time.as_secs() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn insert_change_log_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    log: &ChangeLog,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO alert_meta_change_logs
            (id, change_type, change_time, alert_name, labels, old_threshold, new_threshold, old_watch_secs, new_watch_secs)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(&log.id)
    .bind(change_type_str(log.change_type))
    .bind(log.change_time)
    .bind(&log.alert_name)
    .bind(SqlJson(&log.labels))
    .bind(log.old_threshold)
    .bind(log.new_threshold)
    .bind(log.old_watch.map(|d| d.as_secs() as i64))
    .bind(log.new_watch.map(|d| d.as_secs() as i64))
    .execute(&mut **tx)
    .await?;
    Ok(())
}
