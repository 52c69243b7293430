use thiserror::Error;

// ---

#[derive(Debug, Error)]
pub enum ShaperError {
    // ---
    #[error("channel closed before the write was released")]
    ChannelClosed,

    #[error("channel write failed: {0}")]
    Io(#[from] std::io::Error),
}
