//! # System Interaction Layer
//!
//! Everything that touches processes directly.
//!
//! ## Modules
//!
//! - **`backend`**: The capability interface services are built, launched and stopped
//!   through, plus the registry that maps backend types to loaders.
//! - **`commandline`**: The backend for services described by shell-style commands.
//! - **`process`**: Liveness checks, signals and exit waits for launched processes.

pub mod backend;
pub mod commandline;
pub mod process;
