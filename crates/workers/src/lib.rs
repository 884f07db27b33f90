pub mod executor;
pub mod profile;
pub mod registry;

pub use executor::{CommandExecutor, ExecutorError, WorkerExecutor, WorkerRequest};
pub use profile::{WorkerCommand, WorkerProfile, WorkerSet};
pub use registry::{RegistryError, WorkerRegistry};
