//! Trigger-time computation for workflows and jobs.
//!
//! Accepts standard 5-field Unix cron expressions (minute, hour,
//! day-of-month, month, day-of-week) and converts them to the 6-field form
//! the `cron` crate expects.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{FlowmeshError, Result};
use crate::model::TriggerSpec;

fn normalize_cron_expr(cron_expr: &str) -> String {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    if fields.len() == 5 {
        // Standard 5-field cron: prepend "0" for seconds
        format!("0 {}", cron_expr)
    } else {
        cron_expr.to_string()
    }
}

/// Validate a cron expression without computing the next occurrence.
pub fn validate_cron(cron_expr: &str) -> Result<()> {
    let normalized = normalize_cron_expr(cron_expr);
    Schedule::from_str(&normalized)
        .map(|_| ())
        .map_err(|e| FlowmeshError::InvalidTrigger(format!("invalid cron '{cron_expr}': {e}")))
}

/// Next occurrence of a cron expression strictly after `after`.
pub fn next_cron_after(cron_expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let normalized = normalize_cron_expr(cron_expr);
    let schedule = Schedule::from_str(&normalized)
        .map_err(|e| FlowmeshError::InvalidTrigger(format!("invalid cron '{cron_expr}': {e}")))?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| FlowmeshError::InvalidTrigger(format!("cron '{cron_expr}' never fires")))
}

/// Compute when a workflow fires for a lifecycle trigger observed at `now`.
///
/// Manual and API triggers fire immediately; cron picks the next matching
/// instant; a fixed interval fires one interval from now.
pub fn workflow_trigger_time(trigger: &TriggerSpec, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match trigger {
        TriggerSpec::Cron(expr) => next_cron_after(expr, now),
        TriggerSpec::FixedInterval(secs) => Ok(now + chrono::Duration::seconds(*secs as i64)),
        TriggerSpec::Manual | TriggerSpec::Api => Ok(now),
    }
}

/// Compute a job's trigger time within one workflow run.
///
/// A job-level trigger spec is evaluated against the workflow's trigger
/// time. Without one, a job with upstream dependencies is deferred (None)
/// until every parent completes; a root job inherits the workflow's
/// trigger time.
pub fn job_trigger_time(
    job_trigger: Option<&TriggerSpec>,
    workflow_trigger_time: DateTime<Utc>,
    has_dependencies: bool,
) -> Result<Option<DateTime<Utc>>> {
    if let Some(trigger) = job_trigger {
        let t = match trigger {
            TriggerSpec::Cron(expr) => next_cron_after(expr, workflow_trigger_time)?,
            TriggerSpec::FixedInterval(secs) => {
                workflow_trigger_time + chrono::Duration::seconds(*secs as i64)
            }
            TriggerSpec::Manual | TriggerSpec::Api => workflow_trigger_time,
        };
        return Ok(Some(t));
    }
    if has_dependencies {
        Ok(None)
    } else {
        Ok(Some(workflow_trigger_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn normalize_prepends_seconds_to_five_fields() {
        assert_eq!(normalize_cron_expr("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_cron_expr("0 0 * * * *"), "0 0 * * * *");
    }

    #[test]
    fn validate_cron_accepts_unix_expressions() {
        assert!(validate_cron("0 * * * *").is_ok());
        assert!(validate_cron("*/5 2 * * 1-5").is_ok());
        assert!(validate_cron("not a cron").is_err());
        assert!(validate_cron("").is_err());
    }

    #[test]
    fn next_cron_after_is_strictly_later() {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 11, 59, 30).unwrap();
        let next = next_cron_after("0 12 * * *", base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());

        let at_noon = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let next = next_cron_after("0 12 * * *", at_noon).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap());
    }

    #[test]
    fn workflow_trigger_time_by_spec() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(
            workflow_trigger_time(&TriggerSpec::Manual, now).unwrap(),
            now
        );
        assert_eq!(
            workflow_trigger_time(&TriggerSpec::FixedInterval(60), now).unwrap(),
            now + chrono::Duration::seconds(60)
        );
        let cron_next =
            workflow_trigger_time(&TriggerSpec::Cron("30 6 * * *".to_string()), now).unwrap();
        assert_eq!(cron_next, Utc.with_ymd_and_hms(2026, 3, 1, 6, 30, 0).unwrap());
    }

    #[test]
    fn job_without_trigger_and_with_parents_is_deferred() {
        let wf_time = Utc::now();
        assert_eq!(job_trigger_time(None, wf_time, true).unwrap(), None);
    }

    #[test]
    fn job_without_trigger_inherits_workflow_time() {
        let wf_time = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(
            job_trigger_time(None, wf_time, false).unwrap(),
            Some(wf_time)
        );
    }

    #[test]
    fn job_level_trigger_overrides_even_with_parents() {
        let wf_time = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let t = job_trigger_time(Some(&TriggerSpec::FixedInterval(120)), wf_time, true)
            .unwrap()
            .unwrap();
        assert_eq!(t, wf_time + chrono::Duration::seconds(120));
    }
}
