//! Subscription policy evaluation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::Subscriber;

pub const DEACTIVATED_MESSAGE: &str = "Your subscription has expired or traffic limit reached.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationReason {
    Expired,
    TrafficExhausted,
}

impl DeactivationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeactivationReason::Expired => "expired",
            DeactivationReason::TrafficExhausted => "traffic_exhausted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deactivate(DeactivationReason),
    Warn { days_left: i64 },
    Compliant,
}

/// Judge a subscriber against its expiry and traffic limit at `now`.
///
/// Expiry wins over traffic when both apply. `days_left` counts whole days.
pub fn evaluate(sub: &Subscriber, now: DateTime<Utc>, warning_days: i64) -> Verdict {
    if sub.is_expired_at(now) {
        return Verdict::Deactivate(DeactivationReason::Expired);
    }
    if sub.is_traffic_exhausted() {
        return Verdict::Deactivate(DeactivationReason::TrafficExhausted);
    }
    match sub.expiry {
        Some(expiry) => {
            let days_left = (expiry - now).num_days();
            if days_left <= warning_days {
                Verdict::Warn { days_left }
            } else {
                Verdict::Compliant
            }
        }
        None => Verdict::Compliant,
    }
}

pub fn warning_message(days_left: i64) -> String {
    format!("Your subscription expires in {days_left} days.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Role;
    use chrono::Duration;

    fn sub(limit: u64, used: u64, expiry: Option<DateTime<Utc>>) -> Subscriber {
        Subscriber {
            id: 1,
            username: "alice".into(),
            credential: "abc".into(),
            role: Role::Subscriber,
            traffic_limit_gb: limit,
            traffic_used_gb: used,
            expiry,
            is_active: true,
            is_online: false,
            node_id: Some(1),
        }
    }

    #[test]
    fn test_past_expiry_deactivates() {
        let now = Utc::now();
        let verdict = evaluate(&sub(0, 0, Some(now - Duration::hours(1))), now, 3);
        assert_eq!(verdict, Verdict::Deactivate(DeactivationReason::Expired));
    }

    #[test]
    fn test_exhausted_limit_deactivates_with_future_expiry() {
        let now = Utc::now();
        let verdict = evaluate(&sub(10, 10, Some(now + Duration::days(20))), now, 3);
        assert_eq!(verdict, Verdict::Deactivate(DeactivationReason::TrafficExhausted));
    }

    #[test]
    fn test_warning_window_uses_whole_days() {
        let now = Utc::now();
        let soon = sub(0, 0, Some(now + Duration::days(2) + Duration::hours(5)));
        assert_eq!(evaluate(&soon, now, 3), Verdict::Warn { days_left: 2 });

        let edge = sub(0, 0, Some(now + Duration::days(3) + Duration::hours(23)));
        assert_eq!(evaluate(&edge, now, 3), Verdict::Warn { days_left: 3 });

        let later = sub(0, 0, Some(now + Duration::days(4)));
        assert_eq!(evaluate(&later, now, 3), Verdict::Compliant);
    }

    #[test]
    fn test_no_expiry_no_limit_is_compliant() {
        assert_eq!(evaluate(&sub(0, 500, None), Utc::now(), 3), Verdict::Compliant);
    }

    #[test]
    fn test_messages() {
        assert_eq!(warning_message(2), "Your subscription expires in 2 days.");
        assert_eq!(DeactivationReason::TrafficExhausted.as_str(), "traffic_exhausted");
    }
}
