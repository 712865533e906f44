use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    PendingPayment,
    Confirmed,
    Error,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 4] = [
        OrderStatus::Draft,
        OrderStatus::PendingPayment,
        OrderStatus::Confirmed,
        OrderStatus::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Draft => "draft",
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Confirmed | OrderStatus::Error)
    }

    /// Draft may skip straight to confirmed, that is the free order shortcut.
    pub fn can_transition(self, to: OrderStatus) -> bool {
        use OrderStatus::*;

        matches!(
            (self, to),
            (Draft, PendingPayment)
                | (Draft, Confirmed)
                | (Draft, Error)
                | (PendingPayment, Confirmed)
                | (PendingPayment, Error)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| LedgerError::UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::OrderStatus::{self, *};

    #[test]
    fn test_lifecycle() {
        assert!(Draft.can_transition(PendingPayment));
        assert!(Draft.can_transition(Confirmed));
        assert!(PendingPayment.can_transition(Confirmed));
        assert!(PendingPayment.can_transition(Error));
    }

    #[test]
    fn test_terminal_states_stay_put() {
        for to in OrderStatus::ALL {
            assert!(!Confirmed.can_transition(to));
            assert!(!Error.can_transition(to));
        }
    }

    #[test]
    fn test_no_going_back() {
        assert!(!PendingPayment.can_transition(Draft));
        assert!(!Draft.can_transition(Draft));
    }

    #[test]
    fn test_parse() {
        assert_eq!("pending_payment".parse::<OrderStatus>(), Ok(PendingPayment));
        assert_eq!("confirmed".parse::<OrderStatus>(), Ok(Confirmed));
        assert!("shipped".parse::<OrderStatus>().is_err());
        assert!("Draft".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_serde_matches_display() {
        let json = serde_json::to_string(&PendingPayment).unwrap();

        assert_eq!(json, format!("\"{PendingPayment}\""));
    }
}
