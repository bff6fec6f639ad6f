//! Shared medium: routes transmissions to the PHYs that can hear them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;
use wpsim_common::{Entity, EntityId, Event, EventPayload, IncomingSignalEvent, SimContext, SimError, SimTime};

/// Propagation from one PHY to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkParams {
    /// Path loss in dB.
    pub loss_db: f64,
    /// Propagation delay.
    pub delay: SimTime,
}

/// Directed links between PHYs.
///
/// Uses a BTreeMap so receivers are visited in entity order, which keeps
/// runs reproducible.
#[derive(Debug, Clone, Default)]
pub struct LinkModel {
    links: BTreeMap<(EntityId, EntityId), LinkParams>,
}

impl LinkModel {
    /// Create an empty link model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the link `from -> to`.
    pub fn add_link(&mut self, from: EntityId, to: EntityId, params: LinkParams) {
        self.links.insert((from, to), params);
    }

    /// Link parameters `from -> to`.
    pub fn get_link(&self, from: EntityId, to: EntityId) -> Option<&LinkParams> {
        self.links.get(&(from, to))
    }

    /// Every PHY that hears `from`, in entity order.
    pub fn get_receivers(&self, from: EntityId) -> impl Iterator<Item = (EntityId, &LinkParams)> {
        self.links
            .iter()
            .filter(move |((f, _), _)| *f == from)
            .map(|((_, to), params)| (*to, params))
    }

    /// Number of directed links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// True if there are no links.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// The channel entity.
///
/// Receives `TransmitAir` from PHYs and delivers an `IncomingSignal` to every
/// linked receiver after the link delay, attenuated by the link loss. The
/// channel number travels with the signal; receivers tuned elsewhere ignore it.
pub struct Channel {
    id: EntityId,
    link_model: LinkModel,
}

impl Channel {
    /// Create a channel over `link_model`.
    pub fn new(id: EntityId, link_model: LinkModel) -> Self {
        Channel { id, link_model }
    }

    /// The link model.
    pub fn link_model(&self) -> &LinkModel {
        &self.link_model
    }

    /// The link model, for runtime changes.
    pub fn link_model_mut(&mut self) -> &mut LinkModel {
        &mut self.link_model
    }
}

impl Entity for Channel {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        if let EventPayload::TransmitAir(tx) = &event.payload {
            for (receiver, link) in self.link_model.get_receivers(tx.phy_id) {
                let rx_power_dbm = tx.tx_power_dbm - link.loss_db;
                trace!(from = tx.phy_id.0, to = receiver.0, frame = tx.frame.id, rx_power_dbm, "delivering signal");
                ctx.post_event(
                    link.delay,
                    vec![receiver],
                    EventPayload::IncomingSignal(IncomingSignalEvent {
                        source_phy: tx.phy_id,
                        frame: tx.frame.clone(),
                        rx_power_dbm,
                        channel_number: tx.channel_number,
                        duration: tx.duration,
                    }),
                );
            }
        }
        Ok(())
    }
}
