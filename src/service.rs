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

//! Single-threaded event loop tying requests, serial input and timer ticks
//! to the fetch and relay engines.

use std::path::Path;
use std::time::Duration;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};
use crate::fetch;
use crate::protocol::{INTERNAL_ERROR, STATUS_OK, STATUS_TIMEOUT};
use crate::relay::{Effect, RelayConfig, RelayError, RelayFsm, RelayOutcome, RelayState, Step};
use crate::rpc::{Incoming, RelayArgs, ReplyHandle, Request, RpcError};
use crate::serial::SerialPort;
use crate::source::LineReader;

/// The one relay allowed at a time.
struct ActiveRelay {
    state: Box<dyn RelayState>,
    reply: ReplyHandle,
    path: String,
}

pub struct Service<P: SerialPort> {
    serial: P,
    http: reqwest::Client,
    config: RelayConfig,
    relay: Option<ActiveRelay>,
    ticker: Option<Interval>,
    receive_enabled: bool,
}

impl<P: SerialPort> Service<P> {
    pub fn new(serial: P, http: reqwest::Client, config: RelayConfig) -> Self {
        Service {
            serial,
            http,
            config,
            relay: None,
            ticker: None,
            receive_enabled: false,
        }
    }

    /// Runs until the request channel closes and no relay is in flight.
    ///
    /// Fetches already started keep running on their own tasks.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<Incoming>,
        mut serial_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let mut accepting = true;
        loop {
            if !accepting && self.relay.is_none() {
                break;
            }

            tokio::select! {
                biased;

                incoming = requests.recv(), if accepting => match incoming {
                    Some(incoming) => self.dispatch(incoming),
                    None => accepting = false,
                },
                Some(data) = serial_rx.recv() => self.on_serial(data),
                _ = next_tick(&mut self.ticker) => self.on_tick(),
                else => break,
            }
        }
        debug!("Service stopped");
    }

    fn dispatch(&mut self, incoming: Incoming) {
        let Incoming { request, reply } = incoming;
        match request {
            Request::Fetch(args) => {
                fetch::start_fetch(&self.http, args, reply);
            }
            Request::Relay(args) => self.start_relay(args, reply),
        }
    }

    // ========================================================================
    // Relay
    // ========================================================================

    fn start_relay(&mut self, args: RelayArgs, reply: ReplyHandle) {
        match self.open_relay(args) {
            Ok((path, step)) => {
                info!("Downloading {} to SAM3X", path);
                self.relay = Some(ActiveRelay { state: step.state, reply, path });
                self.apply(step.effects);
            }
            Err(e) => {
                error!("Relay rejected: {}", e);
                reply.error(RpcError::new(INTERNAL_ERROR, e.to_string()));
            }
        }
    }

    fn open_relay(&self, args: RelayArgs) -> Result<(String, Step), RelayError> {
        if self.relay.is_some() {
            return Err(RelayError::Busy);
        }

        let path = args.file.ok_or(RelayError::MissingFile)?;
        let source = LineReader::open(Path::new(&path), self.config.max_line_len)
            .map_err(|source| RelayError::Open { path: path.clone(), source })?;

        Ok((path, RelayFsm::start(source, self.config)))
    }

    fn on_serial(&mut self, data: Vec<u8>) {
        if !self.receive_enabled {
            debug!("Receive disabled, discarding {} bytes", data.len());
            return;
        }
        self.step_relay(|state| state.on_receive(&data));
    }

    fn on_tick(&mut self) {
        self.step_relay(|state| state.on_tick());
    }

    fn step_relay(&mut self, event: impl FnOnce(Box<dyn RelayState>) -> Step) {
        let Some(mut active) = self.relay.take() else {
            return;
        };

        let step = event(active.state);
        active.state = step.state;
        self.relay = Some(active);
        self.apply(step.effects);
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Transmit(line) => {
                    if let Err(e) = self.transmit(&line) {
                        self.abort_relay(RelayError::Serial(e));
                        return;
                    }
                }
                Effect::ArmTimer => self.ticker = Some(tick_timer(self.config.tick_period)),
                Effect::CancelTimer => self.ticker = None,
                Effect::EnableReceive => self.receive_enabled = true,
                Effect::DisableReceive => self.receive_enabled = false,
                Effect::Report(outcome) => self.report(outcome),
            }
        }
    }

    fn transmit(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.serial.write_all(line)?;
        self.serial.flush()
    }

    fn report(&mut self, outcome: RelayOutcome) {
        let Some(active) = self.relay.take() else {
            return;
        };

        debug_assert!(active.state.is_terminal(), "report from state {}", active.state.name());
        info!("Relay of {} ended in state {}: {:?}", active.path, active.state.name(), outcome);
        match outcome {
            RelayOutcome::Ok => active.reply.ok(json!({ "Status": STATUS_OK })),
            RelayOutcome::Timeout => active.reply.ok(json!({ "Status": STATUS_TIMEOUT })),
            RelayOutcome::Failed(message) => active.reply.error(RpcError::new(INTERNAL_ERROR, message)),
        }
    }

    fn abort_relay(&mut self, e: RelayError) {
        self.ticker = None;
        self.receive_enabled = false;
        if let Some(active) = self.relay.take() {
            error!("Relay of {} aborted: {}", active.path, e);
            active.reply.error(RpcError::new(INTERNAL_ERROR, e.to_string()));
        }
    }
}

/// First tick one period from now; late ticks are not bunched up.
fn tick_timer(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================
