//! OCPP-J envelope layer
//!
//! - `frame`: frame model (CALL, CALLRESULT, CALLERROR) and identifiers
//! - `codec`: conversion between wire arrays and [`Frame`]

pub mod codec;
pub mod frame;

pub use codec::{FrameError, FrameErrorKind};
pub use frame::*;
