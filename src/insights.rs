use crate::models::{OverallStats, Priority, Task, TodayStats, WorkloadAdvice};
use chrono::{DateTime, Datelike, Local, NaiveDate, Utc, Weekday};

pub fn local_day(instant: DateTime<Utc>) -> NaiveDate {
    instant.with_timezone(&Local).date_naive()
}

pub fn tasks_due_on(tasks: &[Task], day: NaiveDate) -> Vec<Task> {
    tasks
        .iter()
        .filter(|task| task.deadline.map(local_day) == Some(day))
        .cloned()
        .collect()
}

// Highest priority first, earlier deadline breaking ties; full ties keep
// their snapshot order.
pub fn todays_schedule(tasks: &[Task], now: DateTime<Utc>) -> Vec<Task> {
    let today = local_day(now);
    let mut due: Vec<Task> = tasks
        .iter()
        .filter(|task| !task.is_done() && task.deadline.map(local_day) == Some(today))
        .cloned()
        .collect();
    due.sort_by(|a, b| {
        b.priority
            .rank()
            .cmp(&a.priority.rank())
            .then_with(|| a.deadline.cmp(&b.deadline))
    });
    due
}

pub fn today_stats(tasks: &[Task], now: DateTime<Utc>) -> TodayStats {
    let due = tasks_due_on(tasks, local_day(now));
    let total = due.len();
    let completed = due.iter().filter(|task| task.is_done()).count();
    let high_priority = due
        .iter()
        .filter(|task| task.priority == Priority::High)
        .count();
    let completion_percentage = if total == 0 {
        0.0
    } else {
        completed as f64 / total as f64 * 100.0
    };

    TodayStats {
        total,
        completed,
        pending: total - completed,
        high_priority,
        completion_percentage,
    }
}

pub fn overall_stats(tasks: &[Task], now: DateTime<Utc>) -> OverallStats {
    let total_count = tasks.len();
    let completed_count = tasks.iter().filter(|task| task.is_done()).count();
    let high_priority_open_count = tasks
        .iter()
        .filter(|task| task.priority == Priority::High && !task.is_done())
        .count();
    let overdue_count = tasks.iter().filter(|task| is_overdue(task, now)).count();
    let completion_rate = if total_count == 0 {
        0.0
    } else {
        completed_count as f64 / total_count as f64 * 100.0
    };

    OverallStats {
        completion_rate,
        completed_count,
        total_count,
        high_priority_open_count,
        overdue_count,
    }
}

pub fn is_overdue(task: &Task, now: DateTime<Utc>) -> bool {
    match task.deadline {
        Some(deadline) => !task.is_done() && deadline < now,
        None => false,
    }
}

// Counts every task, done included, whose deadline lands Monday through
// Friday of the reference instant's ISO week.
pub fn weekday_workload(tasks: &[Task], reference: DateTime<Utc>) -> usize {
    let week = local_day(reference).iso_week();
    tasks
        .iter()
        .filter(|task| {
            let Some(deadline) = task.deadline else {
                return false;
            };
            let day = local_day(deadline);
            day.iso_week() == week && is_weekday(day.weekday())
        })
        .count()
}

pub fn workload_advice(
    tasks: &[Task],
    proposed_deadline: DateTime<Utc>,
    soft_limit: u32,
) -> WorkloadAdvice {
    let weekday_count = weekday_workload(tasks, proposed_deadline);
    let needs_confirmation =
        is_weekday(local_day(proposed_deadline).weekday()) && weekday_count >= soft_limit as usize;

    WorkloadAdvice {
        weekday_count,
        needs_confirmation,
    }
}

fn is_weekday(day: Weekday) -> bool {
    !matches!(day, Weekday::Sat | Weekday::Sun)
}
