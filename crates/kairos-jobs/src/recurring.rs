//! Recurring schedules and cron evaluation.
//!
//! All evaluation is in UTC. Classic 5-field expressions are accepted and
//! run at second 0.

use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Rule that periodically spawns job records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringSchedule {
    /// Caller-chosen idempotency key.
    pub id: String,

    pub cron_expression: String,

    pub job_type: String,

    /// Payload copied into every spawned record.
    pub payload_template: serde_json::Value,

    pub next_fire_at: DateTime<Utc>,

    /// Spawn even if the previous instance has not finished.
    #[serde(default)]
    pub allow_overlap: bool,

    /// Most recently spawned instance.
    #[serde(default)]
    pub last_job_id: Option<JobId>,

    #[serde(default)]
    pub version: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl RecurringSchedule {
    /// Creates a schedule whose first window is the first occurrence after `now`.
    pub fn new(
        id: impl Into<String>,
        cron_expression: &str,
        job_type: impl Into<String>,
        payload_template: serde_json::Value,
        now: DateTime<Utc>,
    ) -> JobResult<Self> {
        let next_fire_at = next_occurrence(cron_expression, now)?;

        Ok(Self {
            id: id.into(),
            cron_expression: cron_expression.trim().to_string(),
            job_type: job_type.into(),
            payload_template,
            next_fire_at,
            allow_overlap: false,
            last_job_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Sets whether overlapping instances are allowed.
    pub fn with_allow_overlap(mut self, allow_overlap: bool) -> Self {
        self.allow_overlap = allow_overlap;
        self
    }

    /// Applies a re-registration.
    ///
    /// A changed expression recomputes `next_fire_at` from `now`; an
    /// unchanged one keeps the pending window.
    pub fn update_from(&mut self, registration: RecurringSchedule, now: DateTime<Utc>) {
        if registration.cron_expression != self.cron_expression {
            self.cron_expression = registration.cron_expression;
            self.next_fire_at = registration.next_fire_at;
        }
        self.job_type = registration.job_type;
        self.payload_template = registration.payload_template;
        self.allow_overlap = registration.allow_overlap;
        self.updated_at = now;
    }

    /// True once the pending window has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire_at <= now
    }

    /// Next window after a fire at `now`.
    ///
    /// The result lies on the cron grid, strictly after both the current
    /// window and `now`, so a paused scheduler fires a missed window once
    /// and then skips ahead.
    pub fn following_fire_at(&self, now: DateTime<Utc>) -> JobResult<DateTime<Utc>> {
        let from = if now > self.next_fire_at {
            now
        } else {
            self.next_fire_at
        };
        next_occurrence(&self.cron_expression, from)
    }

    /// Copy of this schedule advanced past `now`.
    pub fn advanced(&self, now: DateTime<Utc>, spawned: Option<JobId>) -> JobResult<Self> {
        let mut next = self.clone();
        next.next_fire_at = self.following_fire_at(now)?;
        if spawned.is_some() {
            next.last_job_id = spawned;
        }
        next.updated_at = now;
        Ok(next)
    }

    /// Builds the record for the current window.
    pub fn spawn_instance(&self, max_attempts: u32, now: DateTime<Utc>) -> JobRecord {
        let mut record = JobRecord::enqueued(
            self.job_type.clone(),
            self.payload_template.clone(),
            max_attempts,
            now,
        )
        .with_recurring_id(self.id.clone());
        record.scheduled_at = self.next_fire_at.min(now);
        record
    }
}

/// Parses a cron expression, accepting 5, 6 or 7 fields.
pub fn parse_cron(expression: &str) -> JobResult<Schedule> {
    let trimmed = expression.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {}", trimmed),
        6 | 7 => trimmed.to_string(),
        n => {
            return Err(JobError::InvalidCron {
                expression: expression.to_string(),
                message: format!("expected 5, 6 or 7 fields, got {}", n),
            })
        }
    };

    Schedule::from_str(&normalized).map_err(|e| JobError::InvalidCron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// First occurrence strictly after `after`.
pub fn next_occurrence(expression: &str, after: DateTime<Utc>) -> JobResult<DateTime<Utc>> {
    parse_cron(expression)?
        .after(&after)
        .next()
        .ok_or_else(|| JobError::InvalidCron {
            expression: expression.to_string(),
            message: "expression has no upcoming occurrence".to_string(),
        })
}
