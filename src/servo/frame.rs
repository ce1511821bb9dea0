// LX-16A bus frame codec
//
// Packet format: [0x55, 0x55, ID, Length, Command, Params..., Checksum]
// Length counts every byte after itself: command + params + checksum.

/// Packet header bytes
pub const HEADER: [u8; 2] = [0x55, 0x55];

/// Broadcast ID, every servo on the bus executes the command (and none replies)
pub const BROADCAST_ID: u8 = 0xFE;

/// Header (2) + ID (1) + Length (1) + Command (1) + Checksum (1)
pub const FRAME_OVERHEAD: usize = 6;

/// Largest parameter block the length byte can describe
pub const MAX_PARAMS: usize = u8::MAX as usize - 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Invalid header: {0:02X?}")]
    BadHeader([u8; 2]),

    #[error("Checksum mismatch: computed 0x{computed:02X}, received 0x{received:02X}")]
    ChecksumMismatch { computed: u8, received: u8 },

    #[error("Frame length mismatch: header declares {declared} bytes, buffer holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Parameter block too long: {0} bytes")]
    PayloadTooLong(usize),
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u8,
    pub command: u8,
    pub params: Vec<u8>,
}

impl Frame {
    pub fn new(id: u8, command: u8, params: Vec<u8>) -> Self {
        Self {
            id,
            command,
            params,
        }
    }

    /// Little-endian u16 at parameter offset `index`
    pub fn param_u16(&self, index: usize) -> Option<u16> {
        let bytes = self.params.get(index..index + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode(self.id, self.command, &self.params)
    }
}

/// Complement of the byte sum over id, length, command and params
pub fn checksum(data: &[u8]) -> u8 {
    !data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Total size of a frame carrying `param_len` parameter bytes
pub fn frame_len(param_len: usize) -> usize {
    FRAME_OVERHEAD + param_len
}

/// Build a frame with header and checksum
pub fn encode(id: u8, command: u8, params: &[u8]) -> Result<Vec<u8>, FrameError> {
    if params.len() > MAX_PARAMS {
        return Err(FrameError::PayloadTooLong(params.len()));
    }
    let length = (params.len() + 3) as u8;
    let mut packet = Vec::with_capacity(frame_len(params.len()));

    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push(length);
    packet.push(command);
    packet.extend_from_slice(params);

    let sum = checksum(&packet[2..]);
    packet.push(sum);

    Ok(packet)
}

/// Parse and validate one complete frame
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < FRAME_OVERHEAD {
        return Err(FrameError::Truncated {
            expected: FRAME_OVERHEAD,
            actual: bytes.len(),
        });
    }

    let header = [bytes[0], bytes[1]];
    if header != HEADER {
        return Err(FrameError::BadHeader(header));
    }

    let length = bytes[3] as usize;
    let declared = length + 3;
    // Length byte covers at least itself, the command and the checksum
    if length < 3 {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }
    if bytes.len() < declared {
        return Err(FrameError::Truncated {
            expected: declared,
            actual: bytes.len(),
        });
    }
    if bytes.len() > declared {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }

    let received = bytes[declared - 1];
    let computed = checksum(&bytes[2..declared - 1]);
    if computed != received {
        return Err(FrameError::ChecksumMismatch { computed, received });
    }

    Ok(Frame {
        id: bytes[2],
        command: bytes[4],
        params: bytes[5..declared - 1].to_vec(),
    })
}
