// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Tick countdown supervising the relay.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Pending(u32),
    Expired,
}

/// Counts timer ticks, not wall-clock time. A budget of N expires on the N-th tick.
#[derive(Debug, Clone, Copy)]
pub struct Countdown {
    remaining: u32,
}

impl Countdown {
    pub fn new(ticks: u32) -> Self {
        Countdown { remaining: ticks }
    }

    pub fn reset(&mut self, ticks: u32) {
        self.remaining = ticks;
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn tick(&mut self) -> TickOutcome {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            TickOutcome::Expired
        } else {
            TickOutcome::Pending(self.remaining)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expires_on_last_tick() {
        let mut countdown = Countdown::new(3);
        assert_eq!(countdown.tick(), TickOutcome::Pending(2));
        assert_eq!(countdown.tick(), TickOutcome::Pending(1));
        assert_eq!(countdown.tick(), TickOutcome::Expired);
    }

    #[test]
    fn test_zero_budget_expires_immediately() {
        let mut countdown = Countdown::new(0);
        assert_eq!(countdown.tick(), TickOutcome::Expired);
        assert_eq!(countdown.tick(), TickOutcome::Expired);
    }

    #[test]
    fn test_reset_extends_budget() {
        let mut countdown = Countdown::new(2);
        countdown.tick();
        countdown.reset(5);
        assert_eq!(countdown.remaining(), 5);
        assert_eq!(countdown.tick(), TickOutcome::Pending(4));
    }
}
