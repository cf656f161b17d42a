//! Habit reminder dispatch
//!
//! Each tick sends one SMS per habit whose time has come today. A habit
//! fires at most once per local day; sends that fail are retried on the
//! next tick until the catch-up window closes.

use super::local_date;
use crate::models::{Habit, User};
use crate::notify::{to_e164, Notifier};
use crate::store::Store;
use crate::Result;
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shortest window a reminder stays eligible, one minute of clock time
const MIN_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReminderReport {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Default)]
struct FiredToday {
    day: Option<NaiveDate>,
    habits: HashSet<Uuid>,
}

pub fn reminder_message(user: &User, habit: &Habit) -> String {
    format!(
        "Hi {}! It's time for your {} habit. Skip it and save the money instead? Reply YES if you did.",
        user.first_name, habit.habit_name
    )
}

pub struct ReminderDispatcher {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    tz: Tz,
    catch_up: Duration,
    fired: Mutex<FiredToday>,
}

impl ReminderDispatcher {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, tz: Tz, catch_up: Duration) -> Self {
        Self {
            store,
            notifier,
            tz,
            catch_up,
            fired: Mutex::new(FiredToday::default()),
        }
    }

    /// Send every reminder that is due at `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<ReminderReport> {
        let today = local_date(now, self.tz);
        let local = now.with_timezone(&self.tz);
        let now_secs = local.num_seconds_from_midnight() as i64;
        let window = (self.catch_up.as_secs() as i64).max(MIN_WINDOW_SECS);

        let mut fired = self.fired.lock().await;
        if fired.day != Some(today) {
            fired.day = Some(today);
            fired.habits.clear();
        }

        let habits = self.store.list_habits().await?;
        let users: HashMap<Uuid, User> = self
            .store
            .list_users()
            .await?
            .into_iter()
            .map(|u| (u.user_id, u))
            .collect();

        let mut report = ReminderReport::default();
        for habit in habits {
            if fired.habits.contains(&habit.habit_id)
                || !habit.time_day_of_week.contains(local.weekday())
            {
                continue;
            }
            let scheduled_secs = habit.time_hour as i64 * 3600 + habit.time_minute as i64 * 60;
            let elapsed = now_secs - scheduled_secs;
            if !(0..window).contains(&elapsed) {
                continue;
            }

            let user = match users.get(&habit.user_id) {
                Some(user) if user.is_active() => user,
                Some(_) => {
                    debug!(habit_id = %habit.habit_id, "Skipping reminder for inactive user");
                    fired.habits.insert(habit.habit_id);
                    report.skipped += 1;
                    continue;
                }
                None => {
                    warn!(habit_id = %habit.habit_id, user_id = %habit.user_id, "Habit has no user");
                    fired.habits.insert(habit.habit_id);
                    report.skipped += 1;
                    continue;
                }
            };

            match self
                .notifier
                .send_sms(&to_e164(&user.phone), &reminder_message(user, &habit))
                .await
            {
                Ok(()) => {
                    fired.habits.insert(habit.habit_id);
                    report.sent += 1;
                }
                Err(e) => {
                    warn!(habit_id = %habit.habit_id, "Reminder failed, will retry: {}", e);
                    report.failed += 1;
                }
            }
        }

        if report != ReminderReport::default() {
            info!(
                sent = report.sent,
                failed = report.failed,
                skipped = report.skipped,
                day = %today,
                "Reminder tick"
            );
        }
        Ok(report)
    }
}
