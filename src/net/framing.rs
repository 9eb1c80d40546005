//! Relay frame format
//!
//! Format: [2 bytes little-endian length][payload]. A zero length frame is a
//! heartbeat and carries no payload.

use std::io::{self, Read, Write};

use crate::game::constants::relay::{LENGTH_PREFIX, MAX_FRAME_LEN};

/// Errors that can occur during message framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Prefix `payload` with its length
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FramingError::FrameTooLarge(payload.len(), MAX_FRAME_LEN));
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Write one frame and flush
pub fn write_frame<W: Write>(stream: &mut W, payload: &[u8]) -> Result<(), FramingError> {
    stream.write_all(&encode_frame(payload)?)?;
    stream.flush()?;
    Ok(())
}

/// Blocking read of one complete frame
pub fn read_frame<R: Read>(stream: &mut R) -> Result<Vec<u8>, FramingError> {
    let mut len_buf = [0u8; LENGTH_PREFIX];
    read_exact_or_closed(stream, &mut len_buf)?;

    let len = u16::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    read_exact_or_closed(stream, &mut buf)?;
    Ok(buf)
}

fn read_exact_or_closed<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<(), FramingError> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FramingError::ConnectionClosed),
        Err(e) => Err(FramingError::Io(e)),
    }
}

#[derive(Debug)]
enum AssemblerState {
    WaitingForLength { prefix: [u8; LENGTH_PREFIX], filled: usize },
    WaitingForBody { body: Vec<u8>, expected: usize },
}

impl Default for AssemblerState {
    fn default() -> Self {
        AssemblerState::WaitingForLength {
            prefix: [0; LENGTH_PREFIX],
            filled: 0,
        }
    }
}

/// Incremental frame parser for bytes arriving in arbitrary chunks
#[derive(Debug, Default)]
pub struct FrameAssembler {
    state: AssemblerState,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes, returning every frame they complete
    pub fn push(&mut self, mut bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        loop {
            match &mut self.state {
                AssemblerState::WaitingForLength { prefix, filled } => {
                    if bytes.is_empty() {
                        break;
                    }
                    let take = (LENGTH_PREFIX - *filled).min(bytes.len());
                    prefix[*filled..*filled + take].copy_from_slice(&bytes[..take]);
                    *filled += take;
                    bytes = &bytes[take..];

                    if *filled == LENGTH_PREFIX {
                        let expected = u16::from_le_bytes(*prefix) as usize;
                        self.state = AssemblerState::WaitingForBody {
                            body: Vec::with_capacity(expected),
                            expected,
                        };
                    }
                }
                AssemblerState::WaitingForBody { body, expected } => {
                    let take = (*expected - body.len()).min(bytes.len());
                    body.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];

                    if body.len() < *expected {
                        break;
                    }
                    frames.push(std::mem::take(body));
                    self.state = AssemblerState::default();
                }
            }
        }
        frames
    }

    /// True between frames
    pub fn is_idle(&self) -> bool {
        matches!(
            self.state,
            AssemblerState::WaitingForLength { filled: 0, .. }
        )
    }
}
