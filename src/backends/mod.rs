/// Kubernetes session backend (Deployment + Service + PVC per session).
pub mod kubernetes;
/// Worker invocation planning: workdir, repo clone, argv, child env.
pub mod launch;
/// Local session backend (one supervised process per session).
pub mod local;
/// Mock backend for tests.
pub mod mock;
/// TCP port allocation for local workers.
pub mod ports;
/// The backend contract shared by all session managers.
pub mod traits;

pub use kubernetes::KubernetesBackend;
pub use local::LocalBackend;
pub use ports::PortAllocator;
pub use traits::{CreateContext, SessionBackend};
