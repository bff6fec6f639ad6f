//! Single-PHY test bench: drives a [`Phy`] from a private event queue and
//! records everything it sends to the observer and the channel.

#![allow(dead_code)]

use wpsim_common::{
    DropReason, Entity, EntityId, Event, EventId, EventPayload, EventQueue, IncomingSignalEvent, PhyControl,
    PhyFrame, PhyState, RxDropEvent, RxOkEvent, SimContext, SimTime, TransmitAirEvent, TxRequestEvent,
};
use wpsim_interference::{FrameTiming, StandardFrameTiming};
use wpsim_phy::{Phy, PhyConfig};

pub const PHY: EntityId = EntityId(1);
pub const CHANNEL: EntityId = EntityId(2);
pub const OBSERVER: EntityId = EntityId(3);
pub const PEER: EntityId = EntityId(10);

pub fn us(v: u64) -> SimTime {
    SimTime::from_micros(v)
}

pub fn frame_duration(frame: &PhyFrame) -> SimTime {
    StandardFrameTiming.frame_duration(&frame.format, frame.payload_bytes)
}

pub struct Bench {
    pub ctx: SimContext,
    pub queue: EventQueue,
    pub phy: Phy,
    pub observed: Vec<(SimTime, EventPayload)>,
    pub air: Vec<(SimTime, TransmitAirEvent)>,
}

impl Bench {
    pub fn new(config: PhyConfig, seed: u64) -> Self {
        Self::with_phy(Phy::new(PHY, "sta", config, CHANNEL, seed))
    }

    pub fn with_phy(phy: Phy) -> Self {
        Bench {
            ctx: SimContext::new(),
            queue: EventQueue::new(),
            phy: phy.with_observer(OBSERVER),
            observed: Vec::new(),
            air: Vec::new(),
        }
    }

    pub fn schedule(&mut self, at: SimTime, payload: EventPayload) {
        let id = EventId(self.ctx.next_event_id());
        self.queue.push(Event {
            id,
            time: at,
            source: PEER,
            targets: vec![PHY],
            payload,
        });
    }

    /// Deliver `frame` at `at` on channel 1 with its natural duration.
    pub fn incoming(&mut self, at: SimTime, frame: PhyFrame, rx_power_dbm: f64) {
        self.incoming_on(at, frame, rx_power_dbm, 1);
    }

    pub fn incoming_on(&mut self, at: SimTime, frame: PhyFrame, rx_power_dbm: f64, channel_number: u16) {
        let duration = frame_duration(&frame);
        self.schedule(
            at,
            EventPayload::IncomingSignal(IncomingSignalEvent {
                source_phy: PEER,
                frame,
                rx_power_dbm,
                channel_number,
                duration,
            }),
        );
    }

    pub fn control(&mut self, at: SimTime, control: PhyControl) {
        self.schedule(at, EventPayload::PhyControl(control));
    }

    pub fn transmit(&mut self, at: SimTime, frame: PhyFrame) {
        self.schedule(at, EventPayload::PhyTxRequest(TxRequestEvent { frame, power_level: 0 }));
    }

    /// Process every event up to and including `until`.
    pub fn run_until(&mut self, until: SimTime) {
        while let Some(time) = self.queue.peek_time() {
            if time > until {
                break;
            }
            let Some(event) = self.queue.pop() else {
                break;
            };
            if event.time > until {
                self.queue.push(event);
                break;
            }
            self.ctx.set_time(event.time);
            for target in &event.targets {
                match *target {
                    PHY => {
                        self.ctx.set_source(PHY);
                        self.phy.handle_event(&event, &mut self.ctx).expect("phy handler failed");
                    }
                    OBSERVER => self.observed.push((event.time, event.payload.clone())),
                    CHANNEL => {
                        if let EventPayload::TransmitAir(tx) = &event.payload {
                            self.air.push((event.time, tx.clone()));
                        }
                    }
                    _ => {}
                }
            }
            self.queue.extend(self.ctx.take_pending_events());
            self.queue.cancel_all(self.ctx.take_cancelled());
        }
        self.ctx.set_time(until);
    }

    /// Apply pending effects of a direct call on the PHY.
    pub fn flush(&mut self) {
        self.queue.extend(self.ctx.take_pending_events());
        self.queue.cancel_all(self.ctx.take_cancelled());
    }

    pub fn states(&self) -> Vec<(SimTime, PhyState)> {
        self.observed
            .iter()
            .filter_map(|(t, p)| match p {
                EventPayload::PhyStateChanged(change) => Some((*t, change.state)),
                _ => None,
            })
            .collect()
    }

    pub fn state_sequence(&self) -> Vec<PhyState> {
        self.states().into_iter().map(|(_, s)| s).collect()
    }

    pub fn received(&self) -> Vec<&RxOkEvent> {
        self.observed
            .iter()
            .filter_map(|(_, p)| match p {
                EventPayload::PhyRxOk(ok) => Some(ok),
                _ => None,
            })
            .collect()
    }

    pub fn drops(&self) -> Vec<&RxDropEvent> {
        self.observed
            .iter()
            .filter_map(|(_, p)| match p {
                EventPayload::PhyRxDrop(drop) => Some(drop),
                _ => None,
            })
            .collect()
    }

    pub fn drop_reasons(&self) -> Vec<DropReason> {
        self.drops().into_iter().map(|d| d.reason).collect()
    }
}
