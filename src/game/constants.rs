/// Simulation timing
pub mod sim {
    /// Simulation tick rate in Hz
    pub const TICK_RATE: u32 = 60;
    /// Delta time per tick in seconds
    pub const DT: f32 = 1.0 / TICK_RATE as f32;
    /// Delay before a buffered authoritative correction overrides a local
    /// prediction, in seconds
    pub const CORRECTION_DELAY: f32 = 1.0;
}

/// Relay transport constants
pub mod relay {
    /// Size of the little-endian frame length prefix
    pub const LENGTH_PREFIX: usize = 2;
    /// Largest payload a single frame can carry
    pub const MAX_FRAME_LEN: usize = u16::MAX as usize;
    /// Writer idle time before a heartbeat frame is sent
    pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;
    /// Reader idle budget before the peer is considered gone
    pub const READ_TIMEOUT_SECS: u64 = 30;
    /// Longest a single frame write may block on a peer that stopped reading
    pub const WRITE_TIMEOUT_SECS: u64 = 10;
    /// Length of a single blocking read slice
    pub const POLL_INTERVAL_MS: u64 = 100;
    /// Read buffer size per poll
    pub const READ_CHUNK: usize = 8192;
}

/// Entity registry limits
pub mod world {
    /// Entity ids are 16 bit; id 0 is never handed out
    pub const MAX_ENTITIES: usize = u16::MAX as usize;
    /// Slots per container unless a spawn says otherwise
    pub const DEFAULT_CONTAINER_CAPACITY: usize = 8;
}
