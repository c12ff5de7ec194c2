//! Scripted in-memory bus for tests and bench rigs.
//!
//! Monitor points answer from a static value, a FIFO script, or a closure;
//! commands are recorded and, by default, echoed back on the matching
//! monitor address so the write-then-read-back handshake works without any
//! extra scripting. With `randomize_analog` set, float points get a small
//! multiplicative jitter, mimicking real analog monitor noise.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::bus::{now_ticks, BusInterface, BusReply, BusRequest, BusStatus, TransactionMode};
use crate::codec::{Payload, WireType};
use crate::rca::Rca;

type MonitorFn = Box<dyn FnMut(u64) -> (Payload, BusStatus) + Send>;

enum Behavior {
    Fixed {
        payload: Payload,
        status: BusStatus,
        /// Jittered as a float when set.
        analog: bool,
    },
    /// FIFO script; the last element repeats once the script is exhausted.
    Script(VecDeque<(Payload, BusStatus)>),
    Func(MonitorFn),
}

struct SimInner {
    monitors: HashMap<u32, Behavior>,
    /// Last commanded payload per monitor address, used for echo readback.
    written: HashMap<u32, Payload>,
    commands: Vec<(Rca, Payload)>,
    command_status: HashMap<u32, VecDeque<BusStatus>>,
    monitor_count: u64,
    rng: u64,
}

/// In-memory [`BusInterface`] with scripted replies.
pub struct SimulatedBus {
    inner: Mutex<SimInner>,
    randomize_analog: bool,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::with_jitter(false)
    }

    pub fn with_jitter(randomize_analog: bool) -> Self {
        SimulatedBus {
            inner: Mutex::new(SimInner {
                monitors: HashMap::new(),
                written: HashMap::new(),
                commands: Vec::new(),
                command_status: HashMap::new(),
                monitor_count: 0,
                rng: 0x9E37_79B9_7F4A_7C15,
            }),
            randomize_analog,
        }
    }

    /// Fixed float monitor point (jittered when jitter is enabled).
    pub fn set_monitor_f32(&self, rca: Rca, value: f32) {
        self.inner.lock().monitors.insert(
            rca.as_monitor().raw(),
            Behavior::Fixed {
                payload: value.encode(),
                status: BusStatus::NoError,
                analog: true,
            },
        );
    }

    /// Fixed monitor point from any wire type, no jitter.
    pub fn set_monitor<T: WireType>(&self, rca: Rca, value: T) {
        self.set_monitor_payload(rca, value.encode(), BusStatus::NoError);
    }

    /// Fixed raw monitor reply with an explicit status.
    pub fn set_monitor_payload(&self, rca: Rca, payload: Payload, status: BusStatus) {
        self.inner.lock().monitors.insert(
            rca.as_monitor().raw(),
            Behavior::Fixed {
                payload,
                status,
                analog: false,
            },
        );
    }

    /// FIFO-scripted replies; the last entry repeats once exhausted.
    pub fn script_monitor(&self, rca: Rca, replies: Vec<(Payload, BusStatus)>) {
        self.inner.lock().monitors.insert(
            rca.as_monitor().raw(),
            Behavior::Script(replies.into_iter().collect()),
        );
    }

    /// Scripted float values, all with NoError status.
    pub fn script_monitor_f32(&self, rca: Rca, values: &[f32]) {
        self.script_monitor(
            rca,
            values
                .iter()
                .map(|v| (v.encode(), BusStatus::NoError))
                .collect(),
        );
    }

    /// Closure-driven monitor point; receives the per-bus monitor count.
    pub fn script_monitor_fn<F>(&self, rca: Rca, f: F)
    where
        F: FnMut(u64) -> (Payload, BusStatus) + Send + 'static,
    {
        self.inner
            .lock()
            .monitors
            .insert(rca.as_monitor().raw(), Behavior::Func(Box::new(f)));
    }

    /// FIFO-scripted command acknowledgement statuses for one address.
    pub fn script_command_status(&self, rca: Rca, statuses: Vec<BusStatus>) {
        self.inner
            .lock()
            .command_status
            .insert(rca.as_command().raw(), statuses.into_iter().collect());
    }

    /// Every command issued so far, in order.
    pub fn commands(&self) -> Vec<(Rca, Payload)> {
        self.inner.lock().commands.clone()
    }

    /// Commands issued to one address (command flag ignored), in order.
    pub fn commands_for(&self, rca: Rca) -> Vec<Payload> {
        let want = rca.as_monitor();
        self.inner
            .lock()
            .commands
            .iter()
            .filter(|(r, _)| r.as_monitor() == want)
            .map(|(_, p)| *p)
            .collect()
    }

    /// Total monitor transactions answered.
    pub fn monitor_count(&self) -> u64 {
        self.inner.lock().monitor_count
    }

    fn jitter(rng: &mut u64, payload: Payload) -> Payload {
        // xorshift64; +/-0.2% multiplicative noise.
        *rng ^= *rng << 13;
        *rng ^= *rng >> 7;
        *rng ^= *rng << 17;
        let bytes = payload.bytes();
        if bytes.len() != 4 {
            return payload;
        }
        let value = f32::decode(bytes);
        let noise = ((*rng % 4001) as f32 / 1000.0 - 2.0) * 1e-3;
        (value * (1.0 + noise)).encode()
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusInterface for SimulatedBus {
    fn submit(&self, request: BusRequest) {
        let mut inner = self.inner.lock();
        let reply = match request.mode {
            TransactionMode::Monitor => {
                inner.monitor_count += 1;
                let count = inner.monitor_count;
                let key = request.rca.as_monitor().raw();
                let (payload, status, analog) = match inner.monitors.get_mut(&key) {
                    Some(Behavior::Fixed {
                        payload,
                        status,
                        analog,
                    }) => (*payload, *status, *analog),
                    Some(Behavior::Script(script)) => {
                        let (p, s) = if script.len() > 1 {
                            script.pop_front().unwrap()
                        } else {
                            script
                                .front()
                                .copied()
                                .unwrap_or((Payload::empty(), BusStatus::Timeout))
                        };
                        (p, s, false)
                    }
                    Some(Behavior::Func(f)) => {
                        let (p, s) = f(count);
                        (p, s, false)
                    }
                    None => match inner.written.get(&key) {
                        // Echo the last commanded value for readback.
                        Some(p) => (*p, BusStatus::NoError, false),
                        None => (Payload::empty(), BusStatus::Timeout, false),
                    },
                };
                let payload = if analog && self.randomize_analog {
                    Self::jitter(&mut inner.rng, payload)
                } else {
                    payload
                };
                BusReply {
                    payload,
                    timestamp: now_ticks(),
                    status,
                }
            }
            TransactionMode::Command => {
                let key = request.rca.as_command().raw();
                inner.commands.push((request.rca, request.payload));
                inner
                    .written
                    .insert(request.rca.as_monitor().raw(), request.payload);
                let status = inner
                    .command_status
                    .get_mut(&key)
                    .and_then(|s| s.pop_front())
                    .unwrap_or(BusStatus::NoError);
                BusReply {
                    payload: Payload::empty(),
                    timestamp: now_ticks(),
                    status,
                }
            }
        };
        // A dropped receiver just means the caller gave up waiting.
        let _ = request.completion.send(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::unpack;
    use crossbeam_channel::bounded;

    fn roundtrip(bus: &SimulatedBus, rca: Rca, mode: TransactionMode, payload: Payload) -> BusReply {
        let (tx, rx) = bounded(1);
        bus.submit(BusRequest {
            channel: 0,
            node: 0x13,
            rca,
            mode,
            payload,
            completion: tx,
        });
        rx.recv().expect("simulated bus always completes")
    }

    #[test]
    fn scripted_monitor_repeats_last_entry() {
        let bus = SimulatedBus::new();
        let rca = Rca::new(0x3008);
        bus.script_monitor_f32(rca, &[1.0, 2.0]);
        let values: Vec<f32> = (0..4)
            .map(|_| {
                let reply = roundtrip(&bus, rca, TransactionMode::Monitor, Payload::empty());
                unpack::<f32>(&reply.payload).unwrap().value
            })
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn unknown_point_times_out() {
        let bus = SimulatedBus::new();
        let reply = roundtrip(
            &bus,
            Rca::new(0xC123),
            TransactionMode::Monitor,
            Payload::empty(),
        );
        assert_eq!(reply.status, BusStatus::Timeout);
    }

    #[test]
    fn command_is_recorded_and_echoed() {
        let bus = SimulatedBus::new();
        let rca = Rca::new(0x3008).as_command();
        let payload = 2.5f32.encode();
        let reply = roundtrip(&bus, rca, TransactionMode::Command, payload);
        assert_eq!(reply.status, BusStatus::NoError);
        assert_eq!(bus.commands_for(rca), vec![payload]);

        let reply = roundtrip(
            &bus,
            rca.as_monitor(),
            TransactionMode::Monitor,
            Payload::empty(),
        );
        assert_eq!(unpack::<f32>(&reply.payload).unwrap().value, 2.5);
    }

    #[test]
    fn jitter_stays_within_band() {
        let bus = SimulatedBus::with_jitter(true);
        let rca = Rca::new(0x3010);
        bus.set_monitor_f32(rca, 10.0);
        for _ in 0..50 {
            let reply = roundtrip(&bus, rca, TransactionMode::Monitor, Payload::empty());
            let v = unpack::<f32>(&reply.payload).unwrap().value;
            assert!((v - 10.0).abs() <= 10.0 * 2.1e-3, "jittered value {}", v);
        }
    }
}
