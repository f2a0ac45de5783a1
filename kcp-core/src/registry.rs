//! Conversation table: many independent conversations multiplexed over one
//! transport, routed by the `conv` field of each incoming datagram.
//!
//! Conversations share one [`SegmentPool`]. A datagram for an unknown
//! conversation creates it from the table's template configuration, the
//! same create-on-first-use behavior a server endpoint relies on.

use crate::config::KcpCoreConfig;
use crate::engine::KcpEngine;
use crate::error::{KcpCoreError, KcpCoreResult};
use crate::pool::SegmentPool;
use crate::protocol::{peek_conv, ConvId, Timestamp};

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ConversationTable {
    conversations: HashMap<ConvId, KcpEngine>,
    template: KcpCoreConfig,
    pool: Arc<SegmentPool>,
}

impl ConversationTable {
    pub fn new(template: KcpCoreConfig) -> KcpCoreResult<Self> {
        Self::with_pool(template, Arc::new(SegmentPool::new()))
    }

    pub fn with_pool(template: KcpCoreConfig, pool: Arc<SegmentPool>) -> KcpCoreResult<Self> {
        template.validate()?;
        Ok(Self {
            conversations: HashMap::new(),
            template,
            pool,
        })
    }

    /// Create a conversation; fails if `conv` is already present
    pub fn create(&mut self, conv: ConvId) -> KcpCoreResult<&mut KcpEngine> {
        if self.conversations.contains_key(&conv) {
            return Err(KcpCoreError::invalid_argument(format!(
                "conversation {conv} already exists"
            )));
        }
        Ok(self.get_or_create(conv)?.0)
    }

    /// Look up a conversation, creating it from the template if absent.
    /// The flag reports whether it was newly created.
    pub fn get_or_create(&mut self, conv: ConvId) -> KcpCoreResult<(&mut KcpEngine, bool)> {
        use std::collections::hash_map::Entry;

        match self.conversations.entry(conv) {
            Entry::Occupied(entry) => Ok((entry.into_mut(), false)),
            Entry::Vacant(entry) => {
                let engine = KcpEngine::with_pool(conv, self.template.clone(), self.pool.clone())?;
                info!(conv = %conv, "New conversation");
                Ok((entry.insert(engine), true))
            }
        }
    }

    pub fn get(&self, conv: ConvId) -> Option<&KcpEngine> {
        self.conversations.get(&conv)
    }

    pub fn get_mut(&mut self, conv: ConvId) -> Option<&mut KcpEngine> {
        self.conversations.get_mut(&conv)
    }

    pub fn contains(&self, conv: ConvId) -> bool {
        self.conversations.contains_key(&conv)
    }

    /// Queue a message on a live conversation
    pub fn send(&mut self, conv: ConvId, data: &[u8]) -> KcpCoreResult<()> {
        let engine = self
            .conversations
            .get_mut(&conv)
            .ok_or(KcpCoreError::UnknownConversation { conv })?;
        if engine.is_dead() {
            return Err(KcpCoreError::ConnectionLost);
        }
        engine.send(data)
    }

    /// Route a datagram to its conversation; returns the conversation id
    pub fn input(&mut self, datagram: &[u8]) -> KcpCoreResult<ConvId> {
        let conv = peek_conv(datagram).ok_or_else(|| {
            KcpCoreError::malformed(format!("datagram of {} bytes has no conv", datagram.len()))
        })?;
        let (engine, created) = self.get_or_create(conv)?;
        if let Err(e) = engine.input(datagram) {
            // garbage must not leave a conversation behind
            if created {
                self.conversations.remove(&conv);
            }
            return Err(e);
        }
        Ok(conv)
    }

    /// Drive every conversation's clock
    pub fn update_all(&mut self, now: Timestamp) {
        for engine in self.conversations.values_mut() {
            engine.update(now);
        }
    }

    /// Earliest time any conversation wants its next update
    pub fn check_all(&self, now: Timestamp) -> Timestamp {
        self.conversations
            .values()
            .map(|engine| engine.check(now))
            .min_by_key(|&due| due.wrapping_sub(now))
            .unwrap_or(now)
    }

    /// Collect buffered datagrams from every conversation
    pub fn drain_output(&mut self) -> Vec<(ConvId, Bytes)> {
        let mut out = Vec::new();
        for (&conv, engine) in self.conversations.iter_mut() {
            out.extend(engine.drain_output().into_iter().map(|d| (conv, d)));
        }
        out
    }

    /// Conversations whose link has been declared dead
    pub fn broken(&self) -> Vec<ConvId> {
        self.conversations
            .iter()
            .filter(|(_, engine)| engine.is_dead())
            .map(|(&conv, _)| conv)
            .collect()
    }

    /// Remove a conversation and return its buffers to the pool
    pub fn release(&mut self, conv: ConvId) -> KcpCoreResult<()> {
        let engine = self
            .conversations
            .remove(&conv)
            .ok_or(KcpCoreError::UnknownConversation { conv })?;
        engine.release();
        debug!(conv = %conv, "Conversation released");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn pool(&self) -> &Arc<SegmentPool> {
        &self.pool
    }
}
