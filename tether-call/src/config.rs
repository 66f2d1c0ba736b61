use bytes::Bytes;

/// Default cap on a single incoming message's declared length.
pub const DEFAULT_MAX_MESSAGE_LENGTH: u32 = 4 * 1024 * 1024;

/// Configuration shared by every call on a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Maximum declared length of an incoming message. A peer declaring a
    /// longer message gets the call cancelled with `InvalidArgument`.
    pub max_message_length: u32,
    /// Metadata key under which the numeric status code travels (ASCII
    /// decimal value).
    pub status_key: Bytes,
    /// Metadata key under which the status details string travels.
    pub message_key: Bytes,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            status_key: Bytes::from_static(b"grpc-status"),
            message_key: Bytes::from_static(b"grpc-message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_keys() {
        let config = ChannelConfig::default();
        assert_eq!(&config.status_key[..], b"grpc-status");
        assert_eq!(&config.message_key[..], b"grpc-message");
        assert_eq!(config.max_message_length, 4 * 1024 * 1024);
    }
}
