pub mod cli_style;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
pub mod sweeper;
pub mod synthesis;

pub use config::{Cli, Commands, GatewayConfig, ServeArgs};
pub use protocol::{ErrorCode, ServerMessage, SynthesisRequest};
pub use registry::{ConnectionRegistry, Registration, SessionHandle};
pub use server::AppState;
pub use session::{run_session, CloseReason, SessionContext, SessionState};
pub use store::{Artifact, ArtifactError, ArtifactStore, SweepReport};
pub use sweeper::{RetentionConfig, RetentionSweeper};
pub use synthesis::{EngineConfig, SynthesisError, SynthesisJobRunner, Synthesizer};
