pub mod clock;
pub mod cmdmon;
pub mod discipline;
pub mod error;
pub mod keys;
pub mod net;
pub mod refclock;
pub mod registry;
pub mod scheduler;
pub mod smoother;

pub use clock::{read_raw_time, GenericClock, Instant, PlatformClock};
#[cfg(target_os = "linux")]
pub use clock::LinuxClock;
pub use discipline::DisciplineEngine;
pub use error::{DaemonError, ResolutionError};
pub use keys::KeyStore;
pub use net::ControlSocket;
pub use refclock::{RefclockDriver, RefclockInstance};
pub use registry::{SourceRegistry, SourceReport};
pub use scheduler::Scheduler;
pub use smoother::TimeSmoother;
