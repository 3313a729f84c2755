//! The fusion build orchestration daemon: an Asset Manager half that
//! owns build state and transaction commits, and a Resource Manager half
//! that schedules tasks onto remote providers (spec §2 "System
//! Overview"). The two halves never call each other synchronously; they
//! only exchange `TaskCommand`/`AssetNotify` messages over unbounded
//! channels (spec §5 "Coroutine-free concurrency").

pub mod assets;
pub mod lifecycle;
pub mod protocol;
pub mod resources;
pub mod server;

/// The daemon's own protocol version string, exchanged during the wire
/// version gate (spec §4.1) and reported by `ValidateProtocolVersion`.
/// Tracks `fusion_wire::PROTOCOL_VERSION`, just rendered as the string
/// clients compare against rather than the header's version byte.
pub const FUSION_VERSION: &str = "1";
