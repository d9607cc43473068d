//! Plan and action persistence.
//!
//! A plan is the only authorization for filesystem mutation: the planner
//! writes it with all of its actions in one transaction, the executor
//! transitions action and plan status as it goes. Terminal plan states are
//! sticky. Deleting a plan cascades to its actions.

use rusqlite::{OptionalExtension, params};

use super::{Catalog, now_ts};
use crate::error::{HashallError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::InProgress => "in_progress",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" => PlanStatus::InProgress,
            "completed" => PlanStatus::Completed,
            "failed" => PlanStatus::Failed,
            "cancelled" => PlanStatus::Cancelled,
            _ => PlanStatus::Pending,
        }
    }

    /// Terminal states refuse re-execution.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Hardlink,
    Noop,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Hardlink => "HARDLINK",
            ActionType::Noop => "NOOP",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "NOOP" => ActionType::Noop,
            _ => ActionType::Hardlink,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Executed,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Executed => "executed",
            ActionStatus::Failed => "failed",
            ActionStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "executed" => ActionStatus::Executed,
            "failed" => ActionStatus::Failed,
            "skipped" => ActionStatus::Skipped,
            _ => ActionStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub plan_id: i64,
    pub name: String,
    pub device_id: u64,
    pub status: PlanStatus,
    pub opportunities: u64,
    pub total_bytes_saveable: u64,
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub bytes_saved: u64,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct LinkAction {
    pub action_id: i64,
    pub plan_id: i64,
    pub action_type: ActionType,
    pub sha256: String,
    pub source_path: String,
    pub target_path: String,
    pub bytes_saveable: u64,
    pub status: ActionStatus,
    pub error_message: Option<String>,
}

/// Planner output before persistence.
#[derive(Debug, Clone)]
pub struct NewAction {
    pub action_type: ActionType,
    pub sha256: String,
    pub source_path: String,
    pub target_path: String,
    pub bytes_saveable: u64,
}

const PLAN_COLS: &str = "plan_id, name, device_id, status, opportunities, total_bytes_saveable, \
                         executed, failed, skipped, bytes_saved, created_at, updated_at";
const ACTION_COLS: &str = "action_id, plan_id, action_type, sha256, source_path, target_path, \
                           bytes_saveable, status, error_message";

fn plan_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Plan> {
    Ok(Plan {
        plan_id: row.get(0)?,
        name: row.get(1)?,
        device_id: row.get::<_, i64>(2)? as u64,
        status: PlanStatus::parse(&row.get::<_, String>(3)?),
        opportunities: row.get::<_, i64>(4)? as u64,
        total_bytes_saveable: row.get::<_, i64>(5)? as u64,
        executed: row.get::<_, i64>(6)? as u64,
        failed: row.get::<_, i64>(7)? as u64,
        skipped: row.get::<_, i64>(8)? as u64,
        bytes_saved: row.get::<_, i64>(9)? as u64,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn action_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LinkAction> {
    Ok(LinkAction {
        action_id: row.get(0)?,
        plan_id: row.get(1)?,
        action_type: ActionType::parse(&row.get::<_, String>(2)?),
        sha256: row.get(3)?,
        source_path: row.get(4)?,
        target_path: row.get(5)?,
        bytes_saveable: row.get::<_, i64>(6)? as u64,
        status: ActionStatus::parse(&row.get::<_, String>(7)?),
        error_message: row.get(8)?,
    })
}

impl Catalog {
    /// Persist a plan and every action in one transaction, status `pending`.
    pub fn create_plan(
        &mut self,
        name: &str,
        device_id: u64,
        actions: &[NewAction],
    ) -> Result<i64> {
        let opportunities = actions
            .iter()
            .filter(|a| a.action_type == ActionType::Hardlink)
            .count() as i64;
        let total_bytes: i64 = actions
            .iter()
            .filter(|a| a.action_type == ActionType::Hardlink)
            .map(|a| a.bytes_saveable as i64)
            .sum();

        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO plans
                 (name, device_id, status, opportunities, total_bytes_saveable,
                  created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?5)",
            params![name, device_id as i64, opportunities, total_bytes, now_ts()],
        )?;
        let plan_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO actions
                     (plan_id, action_type, sha256, source_path, target_path,
                      bytes_saveable, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
            )?;
            for action in actions {
                stmt.execute(params![
                    plan_id,
                    action.action_type.as_str(),
                    action.sha256,
                    action.source_path,
                    action.target_path,
                    action.bytes_saveable as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(plan_id)
    }

    pub fn get_plan(&self, plan_id: i64) -> Result<Plan> {
        self.conn()
            .query_row(
                &format!("SELECT {PLAN_COLS} FROM plans WHERE plan_id = ?1"),
                params![plan_id],
                plan_from_row,
            )
            .optional()?
            .ok_or_else(|| HashallError::NotFound(format!("plan {plan_id}")))
    }

    pub fn list_plans(&self) -> Result<Vec<Plan>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {PLAN_COLS} FROM plans ORDER BY plan_id"))?;
        let rows = stmt.query_map([], plan_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Actions of a plan in stored order.
    pub fn plan_actions(&self, plan_id: i64) -> Result<Vec<LinkAction>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {ACTION_COLS} FROM actions WHERE plan_id = ?1 ORDER BY action_id"
        ))?;
        let rows = stmt.query_map(params![plan_id], action_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn set_plan_status(&self, plan_id: i64, status: PlanStatus) -> Result<()> {
        self.conn().execute(
            "UPDATE plans SET status = ?1, updated_at = ?2 WHERE plan_id = ?3",
            params![status.as_str(), now_ts(), plan_id],
        )?;
        Ok(())
    }

    pub fn set_action_result(
        &self,
        action_id: i64,
        status: ActionStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE actions SET status = ?1, error_message = ?2 WHERE action_id = ?3",
            params![status.as_str(), error_message, action_id],
        )?;
        Ok(())
    }

    /// Recompute plan counters from the action rows. Idempotent, so a
    /// resumed execution converges on the same numbers.
    pub fn refresh_plan_counters(&self, plan_id: i64) -> Result<Plan> {
        self.conn().execute(
            "UPDATE plans SET
                 executed = (SELECT COUNT(*) FROM actions
                             WHERE plan_id = ?1 AND status = 'executed'),
                 failed = (SELECT COUNT(*) FROM actions
                           WHERE plan_id = ?1 AND status = 'failed'),
                 skipped = (SELECT COUNT(*) FROM actions
                            WHERE plan_id = ?1 AND status = 'skipped'),
                 bytes_saved = (SELECT COALESCE(SUM(bytes_saveable), 0) FROM actions
                                WHERE plan_id = ?1 AND status = 'executed'
                                  AND action_type = 'HARDLINK'),
                 updated_at = ?2
             WHERE plan_id = ?1",
            params![plan_id, now_ts()],
        )?;
        self.get_plan(plan_id)
    }

    /// Cancel a plan that has not reached a terminal state.
    pub fn cancel_plan(&self, plan_id: i64) -> Result<()> {
        let plan = self.get_plan(plan_id)?;
        if plan.status.is_terminal() {
            return Err(HashallError::PlanTerminal(plan_id));
        }
        self.set_plan_status(plan_id, PlanStatus::Cancelled)
    }

    /// Remove a plan; its actions go with it.
    pub fn delete_plan(&self, plan_id: i64) -> Result<()> {
        let n = self
            .conn()
            .execute("DELETE FROM plans WHERE plan_id = ?1", params![plan_id])?;
        if n == 0 {
            return Err(HashallError::NotFound(format!("plan {plan_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let catalog = Catalog::open(&dir.path().join("catalog.db")).expect("open catalog");
        (dir, catalog)
    }

    fn hardlink_action(source: &str, target: &str, bytes: u64) -> NewAction {
        NewAction {
            action_type: ActionType::Hardlink,
            sha256: "aa".repeat(32),
            source_path: source.to_string(),
            target_path: target.to_string(),
            bytes_saveable: bytes,
        }
    }

    #[test]
    fn plan_persists_with_counters() {
        let (_dir, mut catalog) = temp_catalog();
        let plan_id = catalog
            .create_plan(
                "nightly",
                7,
                &[
                    hardlink_action("/m/a", "/m/b", 100),
                    hardlink_action("/m/a", "/m/c", 100),
                    NewAction {
                        action_type: ActionType::Noop,
                        sha256: "bb".repeat(32),
                        source_path: "/m/x".to_string(),
                        target_path: "/m/y".to_string(),
                        bytes_saveable: 0,
                    },
                ],
            )
            .unwrap();

        let plan = catalog.get_plan(plan_id).unwrap();
        assert_eq!(plan.status, PlanStatus::Pending);
        assert_eq!(plan.opportunities, 2);
        assert_eq!(plan.total_bytes_saveable, 200);
        assert_eq!(catalog.plan_actions(plan_id).unwrap().len(), 3);
    }

    #[test]
    fn counters_follow_action_results() {
        let (_dir, mut catalog) = temp_catalog();
        let plan_id = catalog
            .create_plan(
                "p",
                7,
                &[
                    hardlink_action("/m/a", "/m/b", 100),
                    hardlink_action("/m/a", "/m/c", 50),
                ],
            )
            .unwrap();
        let actions = catalog.plan_actions(plan_id).unwrap();
        catalog
            .set_action_result(actions[0].action_id, ActionStatus::Executed, None)
            .unwrap();
        catalog
            .set_action_result(actions[1].action_id, ActionStatus::Failed, Some("boom"))
            .unwrap();

        let plan = catalog.refresh_plan_counters(plan_id).unwrap();
        assert_eq!(plan.executed, 1);
        assert_eq!(plan.failed, 1);
        assert_eq!(plan.bytes_saved, 100);
        assert!(plan.bytes_saved <= plan.total_bytes_saveable);
    }

    #[test]
    fn cancel_is_refused_on_terminal_plans() {
        let (_dir, mut catalog) = temp_catalog();
        let plan_id = catalog
            .create_plan("p", 7, &[hardlink_action("/m/a", "/m/b", 1)])
            .unwrap();
        catalog
            .set_plan_status(plan_id, PlanStatus::Completed)
            .unwrap();
        assert!(matches!(
            catalog.cancel_plan(plan_id),
            Err(HashallError::PlanTerminal(_))
        ));
    }

    #[test]
    fn deleting_a_plan_cascades_to_actions() {
        let (_dir, mut catalog) = temp_catalog();
        let plan_id = catalog
            .create_plan("p", 7, &[hardlink_action("/m/a", "/m/b", 1)])
            .unwrap();
        catalog.delete_plan(plan_id).unwrap();
        let orphans: i64 = catalog
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM actions WHERE plan_id = ?1",
                params![plan_id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);
    }
}
