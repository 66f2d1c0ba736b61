//! Channel: the per-connection context shared by its calls.
//!
//! A channel owns the transport handle its calls dispatch ops to, the alarm
//! scheduler used for deadlines, and the channel-wide configuration (status
//! and details metadata keys, maximum message length).

use std::sync::Arc;

use bytes::Bytes;

use crate::alarm::AlarmScheduler;
use crate::config::ChannelConfig;
use crate::transport::Transport;

pub struct Channel {
    transport: Arc<dyn Transport>,
    alarms: AlarmScheduler,
    config: ChannelConfig,
}

impl Channel {
    pub fn new(transport: Arc<dyn Transport>, config: ChannelConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            alarms: AlarmScheduler::new(),
            config,
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// The metadata key carrying the numeric status code.
    pub fn status_key(&self) -> &Bytes {
        &self.config.status_key
    }

    /// The metadata key carrying the status details string.
    pub fn message_key(&self) -> &Bytes {
        &self.config.message_key
    }

    pub fn max_message_length(&self) -> u32 {
        self.config.max_message_length
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn alarms(&self) -> &AlarmScheduler {
        &self.alarms
    }
}
