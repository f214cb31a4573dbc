//! The two tasks that run over a session's stream.
//!
//! - `sender`: writes the outgoing bytes. Either a fixed payload on a timed
//!   cadence (client role) or the chunks the receiver just read (server echo).
//! - `receiver`: reads until end-of-stream and surfaces each chunk.
//!
//! Neither task closes the stream. They borrow one half each and the
//! supervisor takes the halves back when they exit.
//!
//! ## Wire Format
//!
//! None. Payloads are opaque bytes and chunk boundaries on the receiving side
//! carry no meaning:
//!
//! ```text
//! sender writes:    PING | PING | PING
//! receiver may see:  PI | NGPING | PIN | G
//! ```

pub mod receiver;
pub mod sender;

pub use receiver::{run_receiver, ReceiveEnd, ReceiveStats};
pub use sender::{run_sender, Outgoing, SendStats};
