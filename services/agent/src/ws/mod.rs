//! Voice Agent Session
//!
//! Everything that happens on the socket to the remote agent:
//!
//! - `protocol`: the JSON control messages.
//! - `settings`: the handshake that configures the agent.
//! - `transport`: the socket itself, behind traits so it can be replaced in tests.
//! - `dispatcher`: runs function calls and answers them.
//! - `farewell`: the hang-up sequence that lets the goodbye finish playing.
//! - `sender` / `receiver`: the two tasks that run while the session is active.
//! - `session`: lifecycle, setup and teardown.

pub mod dispatcher;
pub mod farewell;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod settings;
pub mod transport;

pub use session::{SessionError, SessionHandle, SetupError, VoiceSession};
