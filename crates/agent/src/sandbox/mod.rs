pub mod cache;
pub mod heuristics;
pub mod platform;
pub mod runtime_plan;
pub mod session;

#[cfg(test)]
mod session_tests;

pub use cache::HandleCache;
pub use platform::{
    CommandExit, LogChunk, SandboxCommand, SandboxError, SandboxHandle, SandboxPlatform, WriteFile,
};
pub use session::SessionManager;
