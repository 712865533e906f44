use chrono::{DateTime, Duration, Utc};
use indicatif::{ProgressBar, ProgressStyle, style::TemplateError};
use ledger::{Order, OrderStatus};
use server::payments::IntentStatus;

use crate::models::Action;

pub fn progress_bar(len: usize) -> Result<ProgressBar, TemplateError> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )?
        .progress_chars("=> "),
    );

    Ok(pb)
}

pub fn minutes_ago(now: DateTime<Utc>, minutes: u32) -> DateTime<Utc> {
    now - Duration::minutes(minutes as i64)
}

pub fn hours_ago(now: DateTime<Utc>, hours: u32) -> DateTime<Utc> {
    now - Duration::hours(hours as i64)
}

/// Maps a PaymentIntent's state to what its orders should become.
pub fn intent_action(status: IntentStatus) -> Action {
    match status {
        IntentStatus::Succeeded => Action::Settle(OrderStatus::Confirmed),
        IntentStatus::Canceled => Action::Settle(OrderStatus::Error),
        // a declined card can still be retried on the same intent
        _ => Action::Skip,
    }
}

/// Groups rows that move together, keeping the order they came in.
pub fn group_by<K, F>(orders: Vec<Order>, key: F) -> Vec<(K, Vec<Order>)>
where
    K: PartialEq,
    F: Fn(&Order) -> K,
{
    let mut groups: Vec<(K, Vec<Order>)> = Vec::new();

    for order in orders {
        let k = key(&order);
        match groups.iter_mut().find(|(existing, _)| *existing == k) {
            Some((_, group)) => group.push(order),
            None => groups.push((k, vec![order])),
        }
    }

    groups
}
