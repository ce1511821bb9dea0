// Servo bus layer for the hexapod
//
// Provides:
// - LX-16A frame codec
// - Transports (serial port, in-memory simulation, null sink)
// - Typed driver operations per servo
// - Per-servo commanded state with limit clamping

pub mod actuator;
pub mod frame;
pub mod lx16a;
pub mod transport;

pub use actuator::{AngleLimits, LimitError, Servo, ServoSpec};
pub use frame::{Frame, FrameError};
pub use lx16a::{FaultCode, LedState, Lx16aBus, ServoError, ServoMode};
pub use transport::{NullTransport, SerialTransport, SimulatedTransport, Transport, TransportError};
