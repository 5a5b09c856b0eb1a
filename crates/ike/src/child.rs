//! Child SA bookkeeping
//!
//! One [`ChildSession`] per Child SA under an IKE session. The IKE state
//! machine drives the exchanges; this module tracks each child's state, its
//! installed transform pair, the narrowed traffic selectors and the
//! configuration attributes received for it.

use crate::error::{Error, Result};
use crate::ikev2::payload::{ConfigAttribute, TrafficSelector};
use crate::params::ChildSessionParams;
use crate::transport::IpsecTransform;

/// Lifecycle state of a Child SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Negotiation in progress, no transforms installed yet
    Creating,
    /// Transform pair installed and usable
    Established,
    /// A replacement pair is being negotiated
    Rekeying,
    /// A delete exchange for this child is in flight
    Deleting,
    /// Torn down
    Closed,
}

/// The two directions of an established Child SA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformPair {
    /// Transform protecting traffic from the peer
    pub inbound: IpsecTransform,
    /// Transform protecting traffic to the peer
    pub outbound: IpsecTransform,
}

/// State of one Child SA
#[derive(Debug)]
pub struct ChildSession {
    id: u32,
    params: ChildSessionParams,
    state: ChildState,
    local_spi: u32,
    pair: Option<TransformPair>,
    inbound_ts: Vec<TrafficSelector>,
    outbound_ts: Vec<TrafficSelector>,
    config_replies: Vec<ConfigAttribute>,
}

impl ChildSession {
    /// Start negotiating a child with the given local ESP SPI
    pub fn new(id: u32, params: ChildSessionParams, local_spi: u32) -> Self {
        ChildSession {
            id,
            params,
            state: ChildState::Creating,
            local_spi,
            pair: None,
            inbound_ts: Vec::new(),
            outbound_ts: Vec::new(),
            config_replies: Vec::new(),
        }
    }

    /// Identifier assigned at request time
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Negotiation parameters
    pub fn params(&self) -> &ChildSessionParams {
        &self.params
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChildState {
        self.state
    }

    /// Local ESP SPI offered for this child
    pub fn local_spi(&self) -> u32 {
        self.local_spi
    }

    /// Installed transform pair, if established
    pub fn pair(&self) -> Option<&TransformPair> {
        self.pair.as_ref()
    }

    /// Traffic selectors the peer narrowed to, inbound direction
    pub fn inbound_ts(&self) -> &[TrafficSelector] {
        &self.inbound_ts
    }

    /// Traffic selectors the peer narrowed to, outbound direction
    pub fn outbound_ts(&self) -> &[TrafficSelector] {
        &self.outbound_ts
    }

    /// Configuration attributes received for this child
    pub fn config_replies(&self) -> &[ConfigAttribute] {
        &self.config_replies
    }

    /// Record a completed negotiation
    pub fn establish(
        &mut self,
        pair: TransformPair,
        inbound_ts: Vec<TrafficSelector>,
        outbound_ts: Vec<TrafficSelector>,
        config_replies: Vec<ConfigAttribute>,
    ) -> Result<()> {
        if self.state != ChildState::Creating {
            return Err(Error::InvalidState(format!(
                "Child {} cannot establish in state {:?}",
                self.id, self.state
            )));
        }
        self.pair = Some(pair);
        self.inbound_ts = inbound_ts;
        self.outbound_ts = outbound_ts;
        self.config_replies = config_replies;
        self.state = ChildState::Established;
        Ok(())
    }

    /// Mark the start of a rekey
    pub fn begin_rekey(&mut self) -> Result<()> {
        if self.state != ChildState::Established {
            return Err(Error::InvalidState(format!(
                "Child {} cannot rekey in state {:?}",
                self.id, self.state
            )));
        }
        self.state = ChildState::Rekeying;
        Ok(())
    }

    /// Swap in the replacement pair, returning the retired one
    pub fn complete_rekey(
        &mut self,
        new_local_spi: u32,
        new_pair: TransformPair,
    ) -> Result<TransformPair> {
        if self.state != ChildState::Rekeying {
            return Err(Error::InvalidState(format!(
                "Child {} is not rekeying",
                self.id
            )));
        }
        let old = self.pair.take().ok_or_else(|| {
            Error::Internal(format!("Child {} rekeying without a pair", self.id))
        })?;
        self.local_spi = new_local_spi;
        self.pair = Some(new_pair);
        self.state = ChildState::Established;
        Ok(old)
    }

    /// Abort an in-progress rekey, keeping the current pair
    pub fn abort_rekey(&mut self) {
        if self.state == ChildState::Rekeying {
            self.state = ChildState::Established;
        }
    }

    /// Mark the start of a delete exchange
    pub fn begin_delete(&mut self) -> Result<()> {
        match self.state {
            ChildState::Established | ChildState::Rekeying => {
                self.state = ChildState::Deleting;
                Ok(())
            }
            _ => Err(Error::InvalidState(format!(
                "Child {} cannot delete in state {:?}",
                self.id, self.state
            ))),
        }
    }

    /// Tear down, returning the pair to remove if one was installed
    pub fn close(&mut self) -> Option<TransformPair> {
        self.state = ChildState::Closed;
        self.pair.take()
    }
}
