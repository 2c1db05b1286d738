//! Hardware command packets and capability descriptor for the gpusub submission core.

pub mod caps;
pub mod cmd;
pub mod writer;

pub use caps::{FrontEndKind, HwCaps, PreemptionMode, PREEMPTION_CONTROL_REGISTER};
pub use cmd::*;
pub use writer::{align_up, encode_cmd, write_cmd_at, CmdStreamWriter};
