use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SessionError;
use crate::training_plan::TrainingPlan;

/// Outcome of one scheduled trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Waiting for the athlete to start
    Pending,
    Started,
    /// The start window closed first
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledAttempt {
    pub fired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: AttemptStatus,
}

/// Public view of a registered schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledSession {
    pub id: String,
    pub plan_name: String,
    pub expression: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_attempt: Option<ScheduledAttempt>,
}

/// Something that happened while polling the book
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleUpdate {
    Fired { id: String, plan_name: String },
    Skipped { id: String, plan_name: String },
}

struct Entry {
    info: ScheduledSession,
    schedule: Schedule,
}

/// Calendar of future workouts.
///
/// The book never starts a session itself: a fired trigger waits for an
/// explicit start and is skipped once the start window closes.
pub struct ScheduleBook {
    entries: Vec<Entry>,
    start_window: Duration,
}

impl ScheduleBook {
    pub fn new(start_window: Duration) -> Self {
        Self {
            entries: Vec::new(),
            start_window,
        }
    }

    /// Parse a cron expression (6 or 7 fields, seconds first)
    pub fn parse(expression: &str) -> Result<Schedule, SessionError> {
        Schedule::from_str(expression).map_err(|e| SessionError::InvalidSchedule {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
    }

    /// Register a plan and return the schedule id
    pub fn add(
        &mut self,
        plan: &TrainingPlan,
        expression: &str,
        now: DateTime<Utc>,
    ) -> Result<String, SessionError> {
        let schedule = Self::parse(expression)?;
        let next_fire = schedule.after(&now).next().ok_or_else(|| SessionError::InvalidSchedule {
            expression: expression.to_string(),
            reason: "never fires".to_string(),
        })?;

        let id = Uuid::new_v4().to_string();
        info!(id = %id, plan = %plan.name, next_fire = %next_fire, "Session scheduled");

        self.entries.push(Entry {
            info: ScheduledSession {
                id: id.clone(),
                plan_name: plan.name.clone(),
                expression: expression.to_string(),
                next_fire: Some(next_fire),
                last_attempt: None,
            },
            schedule,
        });
        Ok(id)
    }

    pub fn remove(&mut self, id: &str) -> Result<(), SessionError> {
        let before = self.entries.len();
        self.entries.retain(|e| e.info.id != id);
        if self.entries.len() == before {
            return Err(SessionError::ScheduleNotFound(id.to_string()));
        }
        info!(id, "Schedule cancelled");
        Ok(())
    }

    pub fn list(&self) -> Vec<ScheduledSession> {
        self.entries.iter().map(|e| e.info.clone()).collect()
    }

    /// Earliest moment something is due
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .flat_map(|e| {
                let expiry = e
                    .info
                    .last_attempt
                    .as_ref()
                    .filter(|a| a.status == AttemptStatus::Pending)
                    .map(|a| a.expires_at);
                e.info.next_fire.into_iter().chain(expiry)
            })
            .min()
    }

    /// Expire start windows and fire due triggers
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<ScheduleUpdate> {
        let mut updates = Vec::new();

        for entry in &mut self.entries {
            let info = &mut entry.info;

            if let Some(attempt) = info.last_attempt.as_mut() {
                if attempt.status == AttemptStatus::Pending && attempt.expires_at <= now {
                    attempt.status = AttemptStatus::Skipped;
                    updates.push(ScheduleUpdate::Skipped {
                        id: info.id.clone(),
                        plan_name: info.plan_name.clone(),
                    });
                }
            }

            let due = info.next_fire.is_some_and(|at| at <= now);
            if !due {
                continue;
            }

            // A new trigger replaces an attempt nobody claimed
            if let Some(attempt) = info.last_attempt.as_mut() {
                if attempt.status == AttemptStatus::Pending {
                    attempt.status = AttemptStatus::Skipped;
                    updates.push(ScheduleUpdate::Skipped {
                        id: info.id.clone(),
                        plan_name: info.plan_name.clone(),
                    });
                }
            }

            info.last_attempt = Some(ScheduledAttempt {
                fired_at: now,
                expires_at: now + self.start_window,
                status: AttemptStatus::Pending,
            });
            info.next_fire = entry.schedule.after(&now).next();
            debug!(id = %info.id, next_fire = ?info.next_fire, "Schedule fired");

            updates.push(ScheduleUpdate::Fired {
                id: info.id.clone(),
                plan_name: info.plan_name.clone(),
            });
        }

        updates
    }

    /// Mark the pending attempt for `plan_name` as started
    pub fn claim(&mut self, plan_name: &str, now: DateTime<Utc>) -> Option<String> {
        let attempt = self
            .entries
            .iter_mut()
            .filter(|e| e.info.plan_name == plan_name)
            .find_map(|e| {
                let id = &e.info.id;
                e.info
                    .last_attempt
                    .as_mut()
                    .filter(|a| a.status == AttemptStatus::Pending && a.expires_at > now)
                    .map(|a| (id.clone(), a))
            });

        let (id, attempt) = attempt?;
        attempt.status = AttemptStatus::Started;
        info!(id = %id, plan = plan_name, "Scheduled session started");
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training_plan::PlanTemplates;
    use chrono::TimeZone;

    const HOURLY: &str = "0 0 * * * *";

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    fn book() -> ScheduleBook {
        ScheduleBook::new(Duration::minutes(10))
    }

    #[test]
    fn test_invalid_expression() {
        let err = book()
            .add(&PlanTemplates::tempo_run(180), "every tuesday", at(8, 0, 0))
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidSchedule { .. }));
    }

    #[test]
    fn test_next_fire() {
        let mut book = book();
        book.add(&PlanTemplates::tempo_run(180), HOURLY, at(8, 20, 0)).unwrap();
        assert_eq!(book.next_deadline(), Some(at(9, 0, 0)));
        assert!(book.poll(at(8, 59, 59)).is_empty());
    }

    #[test]
    fn test_fire_then_skip_after_window() {
        let mut book = book();
        let id = book.add(&PlanTemplates::tempo_run(180), HOURLY, at(8, 20, 0)).unwrap();

        let updates = book.poll(at(9, 0, 0));
        assert_eq!(
            updates,
            vec![ScheduleUpdate::Fired {
                id: id.clone(),
                plan_name: "Tempo Run".to_string()
            }]
        );
        assert_eq!(book.next_deadline(), Some(at(9, 10, 0)));

        let updates = book.poll(at(9, 10, 0));
        assert!(matches!(updates.as_slice(), [ScheduleUpdate::Skipped { .. }]));
        assert_eq!(
            book.list()[0].last_attempt.as_ref().unwrap().status,
            AttemptStatus::Skipped
        );
        assert_eq!(book.next_deadline(), Some(at(10, 0, 0)));
    }

    #[test]
    fn test_claim_within_window() {
        let mut book = book();
        let id = book.add(&PlanTemplates::tempo_run(180), HOURLY, at(8, 20, 0)).unwrap();
        book.poll(at(9, 0, 0));

        assert_eq!(book.claim("Other", at(9, 5, 0)), None);
        assert_eq!(book.claim("Tempo Run", at(9, 5, 0)), Some(id));
        // Started attempts are not skipped
        assert!(book.poll(at(9, 10, 0)).is_empty());
        assert_eq!(book.claim("Tempo Run", at(9, 6, 0)), None);
    }

    #[test]
    fn test_claim_after_window_fails() {
        let mut book = book();
        book.add(&PlanTemplates::tempo_run(180), HOURLY, at(8, 20, 0)).unwrap();
        book.poll(at(9, 0, 0));
        assert_eq!(book.claim("Tempo Run", at(9, 10, 0)), None);
    }

    #[test]
    fn test_remove() {
        let mut book = book();
        let id = book.add(&PlanTemplates::tempo_run(180), HOURLY, at(8, 20, 0)).unwrap();
        assert_eq!(book.list()[0].plan_name, "Tempo Run");
        book.remove(&id).unwrap();
        assert!(book.list().is_empty());
        assert!(matches!(book.remove(&id), Err(SessionError::ScheduleNotFound(_))));
    }
}
