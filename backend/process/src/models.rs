use std::fmt;

use ledger::OrderStatus;

/// What a sweep decided for one payment reference (a whole batch shares one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Settle(OrderStatus),
    Expire,
    Report,
    Skip,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    pub scanned: usize,
    pub confirmed: usize,
    pub errored: usize,
    pub reported: usize,
    pub untouched: usize,
    pub failed: usize,
    pub dry_run: bool,
}

impl Summary {
    pub fn record(&mut self, action: &Action, orders: usize) {
        match action {
            Action::Settle(OrderStatus::Confirmed) => self.confirmed += orders,
            Action::Settle(_) | Action::Expire => self.errored += orders,
            Action::Report => self.reported += orders,
            Action::Skip => self.untouched += orders,
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dry_run {
            writeln!(f, "Dry run, nothing was written")?;
        }

        writeln!(f, "Scanned: {}", self.scanned)?;
        writeln!(f, "Confirmed: {}", self.confirmed)?;
        writeln!(f, "Errored: {}", self.errored)?;
        writeln!(f, "Needs manual check: {}", self.reported)?;
        writeln!(f, "Untouched: {}", self.untouched)?;
        write!(f, "Failed: {}", self.failed)
    }
}
