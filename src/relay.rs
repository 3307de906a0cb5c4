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

use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, info, warn};
use crate::ack::{AckError, ResponseBuffer, Scan};
use crate::protocol::*;
use crate::source::LineReader;
use crate::timeout::{Countdown, TickOutcome};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("expecting file")]
    MissingFile,
    #[error("cannot open {path}")]
    Open { path: String, source: std::io::Error },
    #[error("relay already in progress")]
    Busy,
    #[error("cannot read source: {0}")]
    Read(std::io::Error),
    #[error("serial write failed: {0}")]
    Serial(std::io::Error),
    #[error(transparent)]
    Ack(#[from] AckError),
}

// ============================================================================
// Configuration, Effects & Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub tick_period: Duration,
    pub initial_ticks: u32,
    pub steady_ticks: u32,
    pub max_line_len: usize,
    pub response_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            tick_period: TICK_PERIOD,
            initial_ticks: INITIAL_TIMEOUT_TICKS,
            steady_ticks: STEADY_TIMEOUT_TICKS,
            max_line_len: MAX_LINE_LENGTH,
            response_capacity: RESPONSE_CAPACITY,
        }
    }
}

/// How a relay session ended. Reported exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Ok,
    Timeout,
    Failed(String),
}

/// Side effects requested by a transition, executed in order by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Write the bytes to the controller and flush
    Transmit(Vec<u8>),
    ArmTimer,
    CancelTimer,
    EnableReceive,
    DisableReceive,
    Report(RelayOutcome),
}

// ============================================================================
// States
// ============================================================================

pub struct Idle;
pub struct AwaitingFirstAck;
pub struct AwaitingNextAck;
pub struct Completed;
pub struct TimedOut;
pub struct Failed;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct RelayFsm<State> {
    state: PhantomData<State>,
    source: Option<LineReader>,
    response: ResponseBuffer,
    countdown: Countdown,
    config: RelayConfig,
}

/// Result of feeding one event to the machine.
pub struct Step {
    pub state: Box<dyn RelayState>,
    pub effects: Vec<Effect>,
}

// ============================================================================
// Trait
// ============================================================================

pub trait RelayState: Send {
    fn on_tick(self: Box<Self>) -> Step;

    fn on_receive(self: Box<Self>, data: &[u8]) -> Step;

    fn is_terminal(&self) -> bool;

    fn name(&self) -> &'static str;
}

// ============================================================================
// Helpers shared by all states
// ============================================================================

impl<S: 'static> RelayFsm<S> {
    fn transition<T>(self) -> Box<RelayFsm<T>> {
        Box::new(RelayFsm {
            state: PhantomData,
            source: self.source,
            response: self.response,
            countdown: self.countdown,
            config: self.config,
        })
    }

    fn state_name() -> &'static str {
        let type_name = std::any::type_name::<S>();
        type_name.split("::").last().unwrap_or(type_name)
    }

    /// Terminal transition: drops the source and stops timer and receive.
    fn finish<T: 'static>(mut self, outcome: RelayOutcome) -> Step
    where
        RelayFsm<T>: RelayState,
    {
        self.source = None;
        if !self.response.is_empty() {
            debug!("Discarding {} unacknowledged bytes", self.response.len());
        }
        self.response.reset();
        Step {
            state: self.transition::<T>(),
            effects: vec![Effect::Report(outcome), Effect::CancelTimer, Effect::DisableReceive],
        }
    }

    fn fail(self, error: RelayError) -> Step {
        warn!("Relay failed in state {}: {}", Self::state_name(), error);
        self.finish::<Failed>(RelayOutcome::Failed(error.to_string()))
    }

    fn lines_sent(&self) -> usize {
        self.source.as_ref().map_or(0, LineReader::line_no)
    }
}

impl<S: 'static> RelayFsm<S>
where
    RelayFsm<S>: RelayState,
{
    fn stay(self) -> Step {
        Step { state: Box::new(self), effects: Vec::new() }
    }

    fn supervise(mut self) -> Step {
        match self.countdown.tick() {
            TickOutcome::Pending(_) => self.stay(),
            TickOutcome::Expired => {
                warn!(
                    "No acknowledgment from controller after line {} (state: {})",
                    self.lines_sent(),
                    Self::state_name()
                );
                self.finish::<TimedOut>(RelayOutcome::Timeout)
            }
        }
    }

    fn accumulate(mut self, data: &[u8]) -> Step {
        match self.response.append(data) {
            Ok(Scan::Pending) => {
                debug!(
                    "Received {} bytes, {} buffered, {} ticks left",
                    data.len(),
                    self.response.len(),
                    self.countdown.remaining()
                );
                self.stay()
            }
            Ok(Scan::Matched) => self.advance(),
            Err(e) => self.fail(e.into()),
        }
    }

    fn advance(mut self) -> Step {
        self.response.reset();

        let next = match self.source.as_mut() {
            Some(source) => source.next_line(),
            None => Ok(None),
        };

        match next {
            Ok(Some(line)) => {
                debug!("Sending line {}: {:?}", self.lines_sent(), String::from_utf8_lossy(&line));
                self.countdown.reset(self.config.steady_ticks);
                Step {
                    state: self.transition::<AwaitingNextAck>(),
                    effects: vec![Effect::Transmit(line)],
                }
            }
            Ok(None) => {
                info!("Controller acknowledged all {} lines", self.lines_sent());
                self.finish::<Completed>(RelayOutcome::Ok)
            }
            Err(e) => self.fail(RelayError::Read(e)),
        }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl RelayState for RelayFsm<AwaitingFirstAck> {
    fn on_tick(self: Box<Self>) -> Step {
        (*self).supervise()
    }

    fn on_receive(self: Box<Self>, data: &[u8]) -> Step {
        (*self).accumulate(data)
    }

    fn is_terminal(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        Self::state_name()
    }
}

impl RelayState for RelayFsm<AwaitingNextAck> {
    fn on_tick(self: Box<Self>) -> Step {
        (*self).supervise()
    }

    fn on_receive(self: Box<Self>, data: &[u8]) -> Step {
        (*self).accumulate(data)
    }

    fn is_terminal(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        Self::state_name()
    }
}

// Terminal states swallow late events.

impl RelayState for RelayFsm<Completed> {
    fn on_tick(self: Box<Self>) -> Step {
        (*self).stay()
    }

    fn on_receive(self: Box<Self>, _data: &[u8]) -> Step {
        (*self).stay()
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        Self::state_name()
    }
}

impl RelayState for RelayFsm<TimedOut> {
    fn on_tick(self: Box<Self>) -> Step {
        (*self).stay()
    }

    fn on_receive(self: Box<Self>, _data: &[u8]) -> Step {
        (*self).stay()
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        Self::state_name()
    }
}

impl RelayState for RelayFsm<Failed> {
    fn on_tick(self: Box<Self>) -> Step {
        (*self).stay()
    }

    fn on_receive(self: Box<Self>, _data: &[u8]) -> Step {
        (*self).stay()
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        Self::state_name()
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl RelayFsm<Idle> {
    /// Sends the first line, then arms the timer and enables receive.
    ///
    /// An empty source sends nothing and still waits for an acknowledgment.
    pub fn start(mut source: LineReader, config: RelayConfig) -> Step {
        let first = source.next_line();

        let fsm = RelayFsm {
            state: PhantomData::<Idle>,
            source: Some(source),
            response: ResponseBuffer::with_capacity(config.response_capacity),
            countdown: Countdown::new(config.initial_ticks),
            config,
        };

        let mut effects = Vec::new();
        match first {
            Ok(Some(line)) => {
                debug!("Sending line 1: {:?}", String::from_utf8_lossy(&line));
                effects.push(Effect::Transmit(line));
            }
            Ok(None) => warn!("Source is empty, waiting for controller anyway"),
            Err(e) => return fsm.fail(RelayError::Read(e)),
        }
        effects.push(Effect::ArmTimer);
        effects.push(Effect::EnableReceive);

        Step {
            state: fsm.transition::<AwaitingFirstAck>(),
            effects,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor, Read};

    const OK: &[u8] = b"OK\r\n";

    fn config(initial_ticks: u32, steady_ticks: u32) -> RelayConfig {
        RelayConfig {
            initial_ticks,
            steady_ticks,
            response_capacity: 32,
            ..RelayConfig::default()
        }
    }

    fn start(text: &'static str, config: RelayConfig) -> (Box<dyn RelayState>, Vec<Effect>) {
        let step = RelayFsm::start(LineReader::new(Cursor::new(text.as_bytes()), config.max_line_len), config);
        (step.state, step.effects)
    }

    fn terminal_effects(outcome: RelayOutcome) -> Vec<Effect> {
        vec![Effect::Report(outcome), Effect::CancelTimer, Effect::DisableReceive]
    }

    fn transmitted(effects: &[Effect]) -> Vec<u8> {
        effects.iter().flat_map(|e| match e {
            Effect::Transmit(bytes) => bytes.clone(),
            _ => Vec::new(),
        }).collect()
    }

    #[test]
    fn test_start_sends_first_line_and_arms() {
        let (state, effects) = start("G28\nG1 X10\n", config(50, 10));
        assert_eq!(effects, vec![
            Effect::Transmit(b"G28\r\n".to_vec()),
            Effect::ArmTimer,
            Effect::EnableReceive,
        ]);
        assert_eq!(state.name(), "AwaitingFirstAck");
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_full_relay_round_trip() {
        let program = "G28\nG1 X10 Y10\r\n\nM84\n";
        let (mut state, mut log) = start(program, config(50, 10));

        let mut reports = Vec::new();
        for _ in 0..4 {
            let step = state.on_receive(OK);
            state = step.state;
            reports.extend(step.effects.iter().filter(|e| matches!(e, Effect::Report(_))).cloned());
            log.extend(step.effects);
        }

        assert_eq!(transmitted(&log), b"G28\r\nG1 X10 Y10\r\n\r\nM84\r\n".to_vec());
        assert_eq!(reports, vec![Effect::Report(RelayOutcome::Ok)]);
        assert_eq!(&log[log.len() - 3..], terminal_effects(RelayOutcome::Ok).as_slice());
        assert_eq!(state.name(), "Completed");
        assert!(state.is_terminal());
    }

    #[test]
    fn test_ok_only_after_last_line_acknowledged() {
        let (state, _) = start("G28\nM84\n", config(50, 10));

        let step = state.on_receive(OK);
        assert_eq!(step.effects, vec![Effect::Transmit(b"M84\r\n".to_vec())]);
        assert_eq!(step.state.name(), "AwaitingNextAck");

        let step = step.state.on_receive(OK);
        assert_eq!(step.effects, terminal_effects(RelayOutcome::Ok));
    }

    #[test]
    fn test_split_token_matches_once() {
        let (state, _) = start("G28\nM84\nM2\n", config(50, 10));

        let step = state.on_receive(b"O");
        assert!(step.effects.is_empty());
        let step = step.state.on_receive(b"K\r\n");
        assert_eq!(step.effects, vec![Effect::Transmit(b"M84\r\n".to_vec())]);

        // Nothing stale left to match again
        let step = step.state.on_receive(b"\r\n");
        assert!(step.effects.is_empty());
        assert_eq!(step.state.name(), "AwaitingNextAck");
    }

    #[test]
    fn test_noise_before_token_is_ignored() {
        let (state, _) = start("G28\nM84\n", config(50, 10));
        let step = state.on_receive(b"echo:busy processing\r\n");
        assert!(step.effects.is_empty());
        let step = step.state.on_receive(OK);
        assert_eq!(step.effects, vec![Effect::Transmit(b"M84\r\n".to_vec())]);
    }

    #[test]
    fn test_timeout_without_acknowledgment() {
        let (mut state, _) = start("G28\n", config(5, 2));

        for _ in 0..4 {
            let step = state.on_tick();
            assert!(step.effects.is_empty());
            state = step.state;
        }

        let step = state.on_tick();
        assert_eq!(step.effects, terminal_effects(RelayOutcome::Timeout));
        assert_eq!(step.state.name(), "TimedOut");

        // No OK can follow a timeout
        let step = step.state.on_receive(OK);
        assert!(step.effects.is_empty());
        let step = step.state.on_tick();
        assert!(step.effects.is_empty());
        assert!(step.state.is_terminal());
    }

    #[test]
    fn test_acknowledgment_switches_to_steady_budget() {
        let (mut state, _) = start("G28\nM84\n", config(10, 3));

        for _ in 0..9 {
            state = state.on_tick().state;
        }
        let step = state.on_receive(OK);
        assert_eq!(step.effects, vec![Effect::Transmit(b"M84\r\n".to_vec())]);

        let step = step.state.on_tick();
        assert!(step.effects.is_empty());
        assert_eq!(step.state.name(), "AwaitingNextAck");
    }

    #[test]
    fn test_steady_budget_expires() {
        let (state, _) = start("G28\nM84\n", config(10, 3));
        let mut state = state.on_receive(OK).state;

        state = state.on_tick().state;
        state = state.on_tick().state;
        let step = state.on_tick();
        assert_eq!(step.effects, terminal_effects(RelayOutcome::Timeout));
    }

    #[test]
    fn test_empty_source_waits_then_times_out() {
        let (state, effects) = start("", config(2, 1));
        assert_eq!(effects, vec![Effect::ArmTimer, Effect::EnableReceive]);

        let state = state.on_tick().state;
        let step = state.on_tick();
        assert_eq!(step.effects, terminal_effects(RelayOutcome::Timeout));
    }

    #[test]
    fn test_empty_source_completes_on_acknowledgment() {
        let (state, _) = start("", config(2, 1));
        let step = state.on_receive(OK);
        assert_eq!(step.effects, terminal_effects(RelayOutcome::Ok));
    }

    #[test]
    fn test_long_line_truncated_on_wire() {
        let cfg = RelayConfig { max_line_len: 5, ..config(10, 5) };
        let (_, effects) = start("G1 X100 Y100\n", cfg);
        assert_eq!(effects[0], Effect::Transmit(b"G1 X1\r\n".to_vec()));
    }

    #[test]
    fn test_response_overflow_fails_relay() {
        let cfg = RelayConfig { response_capacity: 8, ..config(10, 5) };
        let (state, _) = start("G28\n", cfg);

        let step = state.on_receive(b"error: unknown");
        assert_eq!(step.effects.len(), 3);
        assert!(matches!(
            &step.effects[0],
            Effect::Report(RelayOutcome::Failed(msg)) if msg.contains("overflow")
        ));
        assert_eq!(step.state.name(), "Failed");
        assert!(step.state.on_receive(OK).effects.is_empty());
    }

    #[test]
    fn test_read_error_fails_relay() {
        struct BadDisk;
        impl Read for BadDisk {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "bad sector"))
            }
        }

        let cfg = config(10, 5);
        let step = RelayFsm::start(LineReader::new(BufReader::new(BadDisk), cfg.max_line_len), cfg);
        assert!(matches!(
            &step.effects[0],
            Effect::Report(RelayOutcome::Failed(msg)) if msg.contains("bad sector")
        ));
        assert!(step.state.is_terminal());
    }
}
