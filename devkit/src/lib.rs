/*!
# Spark DevKit - fakes and harness for hardware-free testing

- `FakeHost`: in-memory docker / Ray / nvidia-smi / RDMA / ssh behind `CommandRunner`
- `FakeInferenceServer`: OpenAI-compatible endpoints plus the Ray dashboard version route
- `TestHarness`: both of the above wired to a fast-polling `ClusterConfig`
*/

pub mod fake_host;
pub mod fake_server;
pub mod test_utils;

pub use fake_host::FakeHost;
pub use fake_server::{FakeInferenceServer, FakeServerOptions};
pub use test_utils::{test_config, TestHarness, TEST_IMAGE};
